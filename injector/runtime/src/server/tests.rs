use super::*;
use crate::{core::SidecarSpec, AdmissionMetrics, Mutate, TraceRequestsLayer};
use prometheus_client::registry::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, ProtocolVersion, RootCertStore},
    TlsConnector,
};

const CA_PEM: &[u8] = include_bytes!("testdata/ca.pem");

fn testdata(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("src/server/testdata")
        .join(name)
}

fn mk_args(key: PathBuf, certs: PathBuf) -> ServerArgs {
    ServerArgs {
        server_addr: "127.0.0.1:0".parse().unwrap(),
        server_tls_key: key,
        server_tls_certs: certs,
    }
}

fn mk_connector(version: &'static rustls::SupportedProtocolVersion) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &*CA_PEM) {
        roots.add(cert.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cfg = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[version])
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(cfg))
}

struct TestServer {
    addr: SocketAddr,
    drain: drain::Signal,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();

        let bound = mk_args(testdata("server.key"), testdata("server.pem"))
            .bind()
            .await
            .expect("server must bind");
        let addr = bound.local_addr();

        let metrics = AdmissionMetrics::register(&mut Registry::default());
        let svc = tower::ServiceBuilder::new()
            .layer(TraceRequestsLayer::new())
            .service(Mutate::new(Arc::new(SidecarSpec::default()), metrics));

        let (drain, watch) = drain::channel();
        let task = bound.spawn(svc, watch);
        Self { addr, drain, task }
    }

    async fn connect(
        &self,
        version: &'static rustls::SupportedProtocolVersion,
    ) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(self.addr).await?;
        let name = ServerName::try_from("localhost".to_string()).unwrap();
        mk_connector(version).connect(name, tcp).await
    }

    async fn shutdown(self) {
        self.drain.drain().await;
        self.task.await.expect("server task must not panic");
    }
}

#[tokio::test]
async fn negotiates_tls13() {
    let server = TestServer::spawn().await;

    let mut conn = server
        .connect(&rustls::version::TLS13)
        .await
        .expect("TLS 1.3 handshake must succeed");
    assert_eq!(
        conn.get_ref().1.protocol_version(),
        Some(ProtocolVersion::TLSv1_3)
    );

    conn.write_all(b"GET /mutate HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut rsp = Vec::new();
    let mut buf = [0u8; 1024];
    while !rsp.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = conn.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "connection closed before the response head");
        rsp.extend_from_slice(&buf[..n]);
    }
    let rsp = String::from_utf8_lossy(&rsp);
    assert!(rsp.starts_with("HTTP/1.1 404"), "{rsp}");

    drop(conn);
    server.shutdown().await;
}

#[tokio::test]
async fn refuses_tls12() {
    let server = TestServer::spawn().await;

    server
        .connect(&rustls::version::TLS12)
        .await
        .expect_err("TLS 1.2 handshake must fail");

    // The server keeps accepting after a failed handshake.
    server
        .connect(&rustls::version::TLS13)
        .await
        .expect("TLS 1.3 handshake must succeed");

    server.shutdown().await;
}

#[tokio::test]
async fn bind_requires_valid_credentials() {
    let dir = tempfile::tempdir().unwrap();

    let err = mk_args(dir.path().join("missing.key"), testdata("server.pem"))
        .bind()
        .await
        .err()
        .expect("missing key must fail");
    assert!(matches!(err, Error::TlsKeyRead(_)), "{err}");

    let err = mk_args(testdata("server.pem"), testdata("server.pem"))
        .bind()
        .await
        .err()
        .expect("a certificate is not a key");
    assert!(matches!(err, Error::NoTlsKey(_)), "{err}");

    let err = mk_args(testdata("server.key"), testdata("server.key"))
        .bind()
        .await
        .err()
        .expect("a key is not a certificate");
    assert!(matches!(err, Error::NoTlsCerts(_)), "{err}");

    let err = mk_args(testdata("server.key"), testdata("ca.pem"))
        .bind()
        .await
        .err()
        .expect("the key must match the certificate");
    assert!(matches!(err, Error::InvalidTlsCredentials(_)), "{err}");
}
