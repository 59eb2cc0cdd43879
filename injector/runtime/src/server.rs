use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{
    rustls::{self, pki_types::CertificateDer},
    TlsAcceptor,
};
use tracing::{debug, error, info, info_span, Instrument};

/// The webhook listens on 8443 unless `--server-addr` says otherwise.
const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8443";

/// Configures the HTTPS server that receives admission reviews.
#[derive(Clone, Debug, clap::Parser)]
pub struct ServerArgs {
    /// The server's address.
    #[clap(long, default_value = DEFAULT_SERVER_ADDR)]
    pub server_addr: SocketAddr,

    /// File containing the x509 private key to the certificate.
    ///
    /// A PEM-encoded file holding a single PKCS#8, SEC1 or RSA private key.
    #[clap(long)]
    pub server_tls_key: PathBuf,

    /// File containing the x509 certificate chain for HTTPS.
    #[clap(long)]
    pub server_tls_certs: PathBuf,
}

/// A bound server whose TLS credentials have been loaded.
pub struct Bound {
    local_addr: SocketAddr,
    tcp: TcpListener,
    tls: TlsAcceptor,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read TLS certificates: {0}")]
    TlsCertsRead(#[source] std::io::Error),

    #[error("no TLS certificates found in {}", .0.display())]
    NoTlsCerts(PathBuf),

    #[error("failed to read TLS key: {0}")]
    TlsKeyRead(#[source] std::io::Error),

    #[error("no TLS private key found in {}", .0.display())]
    NoTlsKey(PathBuf),

    #[error("failed to load TLS credentials: {0}")]
    InvalidTlsCredentials(#[source] rustls::Error),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("failed to get bound local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

// === impl ServerArgs ===

impl ServerArgs {
    /// Loads the key pair and binds the listening socket.
    pub async fn bind(self) -> Result<Bound, Error> {
        let tls = load_tls(&self.server_tls_key, &self.server_tls_certs).await?;
        let tcp = TcpListener::bind(&self.server_addr)
            .await
            .map_err(|e| Error::Bind(self.server_addr, e))?;
        let local_addr = tcp.local_addr().map_err(Error::LocalAddr)?;
        Ok(Bound {
            local_addr,
            tcp,
            tls: TlsAcceptor::from(tls),
        })
    }
}

// === impl Bound ===

impl Bound {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `service` on every accepted connection until `drain` is
    /// signaled. In-flight requests complete before the drain is released.
    pub fn spawn<S, B>(
        self,
        service: S,
        drain: kubert::shutdown::Watch,
    ) -> tokio::task::JoinHandle<()>
    where
        S: tower::Service<hyper::Request<hyper::body::Incoming>, Response = hyper::Response<B>>
            + Clone
            + Send
            + 'static,
        S::Error: std::error::Error + Send + Sync,
        S::Future: Send,
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync,
    {
        let Self {
            local_addr,
            tcp,
            tls,
        } = self;
        tokio::spawn(
            accept_loop(tcp, tls, service, drain)
                .instrument(info_span!("server", port = %local_addr.port())),
        )
    }
}

async fn accept_loop<S, B>(
    tcp: TcpListener,
    tls: TlsAcceptor,
    service: S,
    drain: kubert::shutdown::Watch,
) where
    S: tower::Service<hyper::Request<hyper::body::Incoming>, Response = hyper::Response<B>>
        + Clone
        + Send
        + 'static,
    S::Error: std::error::Error + Send + Sync,
    S::Future: Send,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync,
{
    debug!("Listening");
    loop {
        let (socket, client_addr) = tokio::select! {
            biased;

            release = drain.clone().signaled() => {
                drop(release);
                return;
            }

            res = tcp.accept() => match res {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "Failed to accept connection");
                    continue;
                }
            },
        };

        if let Err(error) = socket.set_nodelay(true) {
            error!(%error, "Failed to set TCP_NODELAY");
            continue;
        }

        tokio::spawn(
            serve_conn(socket, tls.clone(), service.clone(), drain.clone()).instrument(info_span!(
                "conn",
                client.ip = %client_addr.ip(),
                client.port = %client_addr.port(),
            )),
        );
    }
}

async fn serve_conn<S, B>(
    socket: TcpStream,
    tls: TlsAcceptor,
    service: S,
    drain: kubert::shutdown::Watch,
) where
    S: tower::Service<hyper::Request<hyper::body::Incoming>, Response = hyper::Response<B>>
        + Clone
        + Send
        + 'static,
    S::Error: std::error::Error + Send + Sync,
    S::Future: Send,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::error::Error + Send + Sync,
{
    let socket = match tls.accept(socket).await {
        Ok(socket) => socket,
        Err(error) => {
            info!(%error, "TLS handshake failed");
            return;
        }
    };
    debug!("TLS handshake completed");

    let mut builder = hyper_util::server::conn::auto::Builder::new(Executor);
    // Keep idle scanners from holding connections open.
    builder
        .http1()
        .header_read_timeout(std::time::Duration::from_secs(2))
        .timer(hyper_util::rt::TokioTimer::default());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let conn = graceful.watch(
        builder
            .serve_connection(
                hyper_util::rt::TokioIo::new(socket),
                hyper_util::service::TowerToHyperService::new(service),
            )
            .into_owned(),
    );
    tokio::spawn(
        async move {
            match conn.await {
                Ok(()) => debug!("Connection closed"),
                Err(error) => info!(%error, "Connection lost"),
            }
        }
        .in_current_span(),
    );

    let latch = drain.signaled().await;
    latch.release_after(graceful.shutdown()).await;
}

#[derive(Copy, Clone, Debug)]
struct Executor;

impl<F> hyper::rt::Executor<F> for Executor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut.in_current_span());
    }
}

/// Builds a server configuration that only negotiates TLS 1.3.
async fn load_tls(
    key_path: &std::path::Path,
    certs_path: &std::path::Path,
) -> Result<Arc<rustls::ServerConfig>, Error> {
    let pem = tokio::fs::read(key_path).await.map_err(Error::TlsKeyRead)?;
    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(Error::TlsKeyRead)?
        .ok_or_else(|| Error::NoTlsKey(key_path.to_path_buf()))?;

    let pem = tokio::fs::read(certs_path).await.map_err(Error::TlsCertsRead)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(Error::TlsCertsRead)?;
    if certs.is_empty() {
        return Err(Error::NoTlsCerts(certs_path.to_path_buf()));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut cfg = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(Error::InvalidTlsCredentials)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(Error::InvalidTlsCredentials)?;
    cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(cfg))
}

#[cfg(test)]
mod tests;
