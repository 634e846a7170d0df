//! Listeners and the accept loop.
//!
//! A listener is bound from a descriptor (`tcp:HOST:PORT`, `HOST:PORT`, or
//! `unix:PATH`) and runs until accepting fails with a non-temporary error.
//! Every accepted connection is relayed on its own task.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, error, info, warn, Instrument};

use super::relay::{relay_connection, ServerConfig};
use crate::error::{is_resource_exhaustion, AcceptError, DialError, RelayError};

/// Pause after accept fails for lack of descriptors or buffers.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Address of one end of a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAddr {
    Tcp(SocketAddr),
    /// Unix socket; `None` for unnamed (client-side) sockets.
    Unix(Option<PathBuf>),
}

impl fmt::Display for ConnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnAddr::Tcp(addr) => write!(f, "{addr}"),
            ConnAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            ConnAddr::Unix(None) => f.write_str("unix:@"),
        }
    }
}

/// Local and remote addresses of an accepted client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddressing {
    /// Address the client connected to.
    pub local: ConnAddr,
    /// Address the client connected from.
    pub remote: ConnAddr,
}

/// An accepted client connection.
#[derive(Debug)]
pub enum ClientConn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientConn {
    /// Local and peer address of the connection.
    pub fn addressing(&self) -> io::Result<ClientAddressing> {
        match self {
            ClientConn::Tcp(stream) => Ok(ClientAddressing {
                local: ConnAddr::Tcp(stream.local_addr()?),
                remote: ConnAddr::Tcp(stream.peer_addr()?),
            }),
            ClientConn::Unix(stream) => Ok(ClientAddressing {
                local: ConnAddr::Unix(stream.local_addr()?.as_pathname().map(Path::to_path_buf)),
                remote: ConnAddr::Unix(stream.peer_addr()?.as_pathname().map(Path::to_path_buf)),
            }),
        }
    }
}

impl AsyncRead for ClientConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientConn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientConn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientConn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientConn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientConn::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientConn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientConn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientConn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Where to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenSpec {
    /// `HOST:PORT`, passed to the resolver at bind time.
    Tcp(String),
    /// Filesystem path of a Unix socket.
    Unix(PathBuf),
}

impl FromStr for ListenSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(format!("{s:?}: missing socket path"));
            }
            return Ok(ListenSpec::Unix(PathBuf::from(path)));
        }

        let addr = s.strip_prefix("tcp:").unwrap_or(s);
        if let Ok(port) = addr.parse::<u16>() {
            return Ok(ListenSpec::Tcp(format!("[::]:{port}")));
        }
        match addr.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => Ok(ListenSpec::Tcp(addr.to_string())),
            _ => Err(format!("{s:?}: expected tcp:HOST:PORT, HOST:PORT, or unix:PATH")),
        }
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenSpec::Tcp(addr) => write!(f, "tcp:{addr}"),
            ListenSpec::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// ClientHello peek failures (timeout, not TLS, malformed).
    pub peek_failed: AtomicU64,
    /// Connections without a usable hostname.
    pub hostname_failed: AtomicU64,
    /// Backend dial failures, including disallowed addresses.
    pub dial_failed: AtomicU64,
    /// Dials refused by the backend allow-list.
    pub backend_not_allowed: AtomicU64,
    /// Bytes relayed to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_failure(&self, err: &RelayError) {
        match err {
            RelayError::PeekFailed(_) => {
                self.peek_failed.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::NoHostname | RelayError::InvalidHostname(_) => {
                self.hostname_failed.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::Dial(e) => {
                self.dial_failed.fetch_add(1, Ordering::Relaxed);
                if matches!(e, DialError::BackendNotAllowed { .. }) {
                    self.backend_not_allowed.fetch_add(1, Ordering::Relaxed);
                }
            }
            RelayError::ProxyHeaderWriteFailed(_) => {}
        }
    }
}

#[derive(Debug)]
enum ListenSocket {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

/// A bound listener.
#[derive(Debug)]
pub struct Listener {
    socket: ListenSocket,
    server: Arc<ServerConfig>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a listener.
    ///
    /// A stale Unix socket file at the target path is removed first; any
    /// other kind of file is left alone and the bind fails.
    pub async fn bind(spec: &ListenSpec, server: Arc<ServerConfig>) -> io::Result<Self> {
        let socket = match spec {
            ListenSpec::Tcp(addr) => ListenSocket::Tcp(TcpListener::bind(addr.as_str()).await?),
            ListenSpec::Unix(path) => {
                remove_stale_socket(path)?;
                ListenSocket::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                }
            }
        };

        let listener = Self {
            socket,
            server,
            stats: Arc::new(ListenerStats::default()),
        };
        info!(listen = %listener.local_addr()?, "Listener bound");
        Ok(listener)
    }

    /// Bind every descriptor, failing on the first error.
    pub async fn bind_all(specs: &[ListenSpec], server: Arc<ServerConfig>) -> io::Result<Vec<Self>> {
        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            let listener = Self::bind(spec, Arc::clone(&server)).await.map_err(|e| {
                io::Error::new(e.kind(), format!("failed to listen on {spec}: {e}"))
            })?;
            listeners.push(listener);
        }
        Ok(listeners)
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<ConnAddr> {
        match &self.socket {
            ListenSocket::Tcp(listener) => Ok(ConnAddr::Tcp(listener.local_addr()?)),
            ListenSocket::Unix { path, .. } => Ok(ConnAddr::Unix(Some(path.clone()))),
        }
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    async fn accept(&self) -> io::Result<ClientConn> {
        match &self.socket {
            ListenSocket::Tcp(listener) => listener.accept().await.map(|(s, _)| ClientConn::Tcp(s)),
            ListenSocket::Unix { listener, .. } => {
                listener.accept().await.map(|(s, _)| ClientConn::Unix(s))
            }
        }
    }

    /// Run the listener, accepting and relaying connections.
    ///
    /// Returns only when accepting fails with a non-temporary error.
    pub async fn run(self: Arc<Self>) -> Result<(), AcceptError> {
        let listen = self.local_addr().map_err(AcceptError::Fatal)?;
        info!(listen = %listen, "Listener started");

        loop {
            let conn = match self.accept().await {
                Ok(conn) => conn,
                Err(e) => match AcceptError::classify(e) {
                    AcceptError::Temporary(e) => {
                        warn!(listen = %listen, error = %e, "Temporary accept error");
                        if is_resource_exhaustion(&e) {
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        continue;
                    }
                    fatal => {
                        error!(listen = %listen, error = %fatal, "Listener failed");
                        return Err(fatal);
                    }
                },
            };

            let addressing = match conn.addressing() {
                Ok(addressing) => addressing,
                Err(e) => {
                    debug!(error = %e, "Dropping connection without addresses");
                    continue;
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let span = tracing::info_span!("connection", peer = %addressing.remote);
            let server = Arc::clone(&self.server);
            let stats = Arc::clone(&self.stats);

            tokio::spawn(
                async move {
                    match relay_connection(&server, conn, addressing).await {
                        Ok(transfer) => {
                            stats
                                .bytes_to_backend
                                .fetch_add(transfer.to_backend, Ordering::Relaxed);
                            stats
                                .bytes_from_backend
                                .fetch_add(transfer.from_backend, Ordering::Relaxed);
                            debug!(
                                bytes_to_backend = transfer.to_backend,
                                bytes_from_backend = transfer.from_backend,
                                "Connection closed"
                            );
                        }
                        Err(e) => {
                            stats.record_failure(&e);
                            log_failure(&e);
                        }
                    }

                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                }
                .instrument(span),
            );
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenSocket::Unix { path, .. } = &self.socket {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Failed to remove listener socket");
            }
        }
    }
}

fn log_failure(err: &RelayError) {
    match err {
        RelayError::Dial(DialError::BackendNotAllowed { .. }) => {
            warn!(reason = err.reason_code(), error = %err, "Connection rejected");
        }
        _ => {
            info!(reason = err.reason_code(), error = %err, "Connection failed");
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale listener socket");
            std::fs::remove_file(path)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::backend::UnixDialer;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server(dir: &Path) -> Arc<ServerConfig> {
        Arc::new(ServerConfig::new(Arc::new(UnixDialer::new(dir))))
    }

    #[rstest]
    #[case("tcp:127.0.0.1:443", ListenSpec::Tcp("127.0.0.1:443".into()))]
    #[case("127.0.0.1:443", ListenSpec::Tcp("127.0.0.1:443".into()))]
    #[case("tcp:[::1]:8443", ListenSpec::Tcp("[::1]:8443".into()))]
    #[case("localhost:443", ListenSpec::Tcp("localhost:443".into()))]
    #[case("tcp:443", ListenSpec::Tcp("[::]:443".into()))]
    #[case("unix:/run/tlsmux.sock", ListenSpec::Unix("/run/tlsmux.sock".into()))]
    fn test_listen_spec_parse(#[case] input: &str, #[case] expected: ListenSpec) {
        assert_eq!(input.parse::<ListenSpec>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("unix:")]
    #[case("127.0.0.1")]
    #[case("tcp:host:notaport")]
    fn test_listen_spec_parse_invalid(#[case] input: &str) {
        assert!(input.parse::<ListenSpec>().is_err());
    }

    #[test]
    fn test_conn_addr_display() {
        assert_eq!(
            ConnAddr::Tcp("192.0.2.1:443".parse().unwrap()).to_string(),
            "192.0.2.1:443"
        );
        assert_eq!(
            ConnAddr::Unix(Some("/run/a.sock".into())).to_string(),
            "unix:/run/a.sock"
        );
        assert_eq!(ConnAddr::Unix(None).to_string(), "unix:@");
    }

    #[test]
    fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.record_failure(&RelayError::NoHostname);
        stats.record_failure(&RelayError::from(DialError::BackendNotAllowed {
            addr: "10.0.0.1".parse().unwrap(),
        }));
        assert_eq!(stats.hostname_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.dial_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.backend_not_allowed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unix_listener_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listen.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = Listener::bind(&ListenSpec::Unix(path.clone()), server(dir.path()))
            .await
            .unwrap();
        assert_eq!(listener.local_addr().unwrap(), ConnAddr::Unix(Some(path.clone())));

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unix_listener_refuses_to_clobber_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();

        let result = Listener::bind(&ListenSpec::Unix(path.clone()), server(dir.path())).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_bind_all_reports_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing").join("listen.sock");
        let specs = vec![
            ListenSpec::Tcp("127.0.0.1:0".into()),
            ListenSpec::Unix(missing.clone()),
        ];

        let err = Listener::bind_all(&specs, server(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains(&missing.display().to_string()));
    }

    #[tokio::test]
    async fn test_accept_loop_counts_peek_failure() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Arc::new(
            Listener::bind(&ListenSpec::Tcp("127.0.0.1:0".into()), server(dir.path()))
                .await
                .unwrap(),
        );
        let addr = match listener.local_addr().unwrap() {
            ConnAddr::Tcp(addr) => addr,
            other => panic!("Expected TCP address, got {other}"),
        };
        let handle = tokio::spawn(Arc::clone(&listener).run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /").await.unwrap();

        // The router closes the connection without writing anything.
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Stats are updated after the connection is dropped.
        for _ in 0..50 {
            if listener.stats().connections_closed.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = listener.stats();
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.peek_failed.load(Ordering::Relaxed), 1);

        handle.abort();
    }
}
