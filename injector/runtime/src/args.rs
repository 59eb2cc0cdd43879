use crate::{
    admission::Mutate, core::SidecarSpec, metrics::AdmissionMetrics, server::ServerArgs,
    trace::TraceRequestsLayer,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "nse-injector",
    version,
    about = "this program injects NSE sidecar into the pod description"
)]
pub struct Args {
    /// Defines the level of logging for this program.
    #[clap(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// File containing the mutation configuration.
    #[clap(long, env = "SIDECAR_CFG", value_parser = existing_file)]
    sidecar_cfg: PathBuf,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            sidecar_cfg,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let server = server
            .bind()
            .await
            .context("failed to initialize the NSE webhook server")?;

        let sidecar = SidecarSpec::load(&sidecar_cfg)
            .map(Arc::new)
            .context("failed to load NSE configuration file")?;

        let addr = server.local_addr();
        server.spawn(
            tower::ServiceBuilder::new()
                .layer(TraceRequestsLayer::new())
                .service(Mutate::new(sidecar, metrics)),
            runtime.shutdown_handle(),
        );
        info!(%addr, "NSE webhook injector has started");

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        info!("NSE webhook injector has shut down");
        Ok(())
    }
}

fn existing_file(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.exists() {
        return Err(format!("{s} file doesn't exist"));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    struct Files {
        _dir: tempfile::TempDir,
        sidecar: PathBuf,
        key: PathBuf,
        certs: PathBuf,
    }

    fn mk_files() -> Files {
        let dir = tempfile::tempdir().expect("temp dir");
        let touch = |name: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, "").expect("write file");
            path
        };
        let sidecar = touch("sidecar.yaml");
        let key = touch("tls.key");
        let certs = touch("tls.crt");
        Files {
            _dir: dir,
            sidecar,
            key,
            certs,
        }
    }

    fn parse(files: &Files, extra: &[&str]) -> Result<Args, clap::Error> {
        let mut args: Vec<OsString> = vec![
            "nse-injector".into(),
            "--sidecar-cfg".into(),
            files.sidecar.clone().into(),
            "--server-tls-key".into(),
            files.key.clone().into(),
            "--server-tls-certs".into(),
            files.certs.clone().into(),
        ];
        args.extend(extra.iter().map(OsString::from));
        Args::try_parse_from(args)
    }

    #[test]
    fn server_addr_defaults_to_8443() {
        let files = mk_files();
        let args = parse(&files, &[]).expect("args must parse");
        assert_eq!(
            args.server.server_addr,
            "0.0.0.0:8443".parse::<std::net::SocketAddr>().unwrap()
        );
        assert_eq!(args.server.server_tls_key, files.key);
        assert_eq!(args.server.server_tls_certs, files.certs);
        assert_eq!(args.sidecar_cfg, files.sidecar);
    }

    #[test]
    fn server_addr_is_configurable() {
        let files = mk_files();
        let args = parse(&files, &["--server-addr", "127.0.0.1:9443", "--log-level", "debug"])
            .expect("args must parse");
        assert_eq!(
            args.server.server_addr,
            "127.0.0.1:9443".parse::<std::net::SocketAddr>().unwrap()
        );
    }

    #[test]
    fn missing_sidecar_file_is_rejected() {
        let files = mk_files();
        let missing = files.sidecar.with_file_name("missing.yaml");
        let err = Args::try_parse_from([
            OsString::from("nse-injector"),
            "--sidecar-cfg".into(),
            missing.into_os_string(),
            "--server-tls-key".into(),
            files.key.clone().into_os_string(),
            "--server-tls-certs".into(),
            files.certs.clone().into_os_string(),
        ])
        .expect_err("nonexistent file must be rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn sidecar_and_tls_files_are_required() {
        let err = Args::try_parse_from(["nse-injector"]).expect_err("files are required");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
