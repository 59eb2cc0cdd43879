use crate::{Container, Volume};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// The containers and volumes injected into every mutated pod.
///
/// Loaded once at startup and shared read-only by all requests.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SidecarSpec {
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read the NSE configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unmarshal the NSE configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

// === impl SidecarSpec ===

impl SidecarSpec {
    /// Reads and parses the sidecar configuration file, logging its checksum.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let data = std::fs::read(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let sha256sum = format!("{:x}", Sha256::digest(&data));
        info!(path = %path.display(), %sha256sum, "New configuration");

        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &[u8]) -> Result<Self, ConfigLoadError> {
        let spec = serde_yaml::from_slice::<Self>(data)?;
        debug!(
            containers = ?spec.containers.iter().map(|c| &c.name).collect::<Vec<_>>(),
            volumes = ?spec.volumes.iter().map(|v| &v.name).collect::<Vec<_>>(),
            "NSE sidecar configuration loaded"
        );
        Ok(spec)
    }
}
