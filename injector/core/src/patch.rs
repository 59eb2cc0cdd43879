use crate::{Container, Pod, SidecarSpec, Volume, STATUS_ANNOTATION, STATUS_INJECTED};
use json_patch::{jsonptr::PointerBuf, AddOperation, Patch, PatchOperation};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Builds the JSON patch that injects the sidecar into a pod.
#[derive(Clone, Debug)]
pub struct PatchBuilder {
    sidecar: Arc<SidecarSpec>,
}

/// The kinds of pod spec entries the sidecar adds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Volume,
}

#[derive(Debug, Error)]
#[error("could not encode the {kind} patch operations of pod: {source}")]
pub struct PatchEncodeError {
    kind: ResourceKind,
    #[source]
    source: serde_json::Error,
}

/// A pod spec entry that can be appended by the sidecar.
trait Resource: Serialize {
    const KIND: ResourceKind;
}

impl Resource for Container {
    const KIND: ResourceKind = ResourceKind::Container;
}

impl Resource for Volume {
    const KIND: ResourceKind = ResourceKind::Volume;
}

// === impl PatchBuilder ===

impl PatchBuilder {
    pub fn new(sidecar: Arc<SidecarSpec>) -> Self {
        Self { sidecar }
    }

    /// Produces the ordered patch for `pod`: all container additions, then all
    /// volume additions, then the annotations update.
    ///
    /// When the pod has no entries of a kind, the first sidecar entry of that
    /// kind establishes the whole array and the rest are appended with `/-`.
    pub fn create_patch(&self, pod: &Pod) -> Result<Patch, PatchEncodeError> {
        let spec = pod.spec.as_ref();
        let containers = spec.map_or(0, |s| s.containers.len());
        let volumes = spec.and_then(|s| s.volumes.as_ref()).map_or(0, Vec::len);

        let SidecarSpec {
            containers: sidecar_containers,
            volumes: sidecar_volumes,
        } = &*self.sidecar;

        let mut ops = Vec::with_capacity(sidecar_containers.len() + sidecar_volumes.len() + 1);
        push_adds(&mut ops, containers, sidecar_containers)?;
        push_adds(&mut ops, volumes, sidecar_volumes)?;

        let mut annotations = pod.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(STATUS_ANNOTATION.to_string(), STATUS_INJECTED.to_string());
        debug!(?annotations, "Annotations patch added");
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: Value::Object(
                annotations
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect(),
            ),
        }));

        Ok(Patch(ops))
    }
}

fn push_adds<R: Resource>(
    ops: &mut Vec<PatchOperation>,
    existing: usize,
    resources: &[R],
) -> Result<(), PatchEncodeError> {
    let mut is_first = existing == 0;
    for resource in resources {
        let op = add_operation(resource, is_first)?;
        debug!(kind = %R::KIND, path = %op.path, "Patch added");
        ops.push(PatchOperation::Add(op));
        is_first = false;
    }
    Ok(())
}

/// Adds a single resource. The first entry of an empty array replaces the
/// array with a one-element sequence; later entries append the bare object.
fn add_operation<R: Resource>(
    resource: &R,
    is_first: bool,
) -> Result<AddOperation, PatchEncodeError> {
    let field = R::KIND.field();
    let (path, value) = if is_first {
        (
            PointerBuf::from_tokens(["spec", field]),
            serde_json::to_value([resource]),
        )
    } else {
        (
            PointerBuf::from_tokens(["spec", field, "-"]),
            serde_json::to_value(resource),
        )
    };
    let value = value.map_err(|source| PatchEncodeError {
        kind: R::KIND,
        source,
    })?;
    Ok(AddOperation { path, value })
}

// === impl ResourceKind ===

impl ResourceKind {
    /// The pod spec field holding this kind of entry.
    pub fn field(self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::Volume => "volumes",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => "container".fmt(f),
            Self::Volume => "volume".fmt(f),
        }
    }
}
