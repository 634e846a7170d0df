//! Test harness for router integration tests.
//!
//! Provides helpers to spawn Unix-socket and TCP backends (plain and TLS),
//! router listeners, and raw ClientHello bytes.
#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tlsmux_router::{ConnAddr, ListenSpec, Listener, ServerConfig, UnixDialer};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What a backend saw on one connection.
#[derive(Debug, Clone)]
pub struct Received {
    /// Every byte read before the client half-closed.
    pub bytes: Vec<u8>,
}

/// Backend that reads each connection to EOF, records it, then replies.
///
/// Replying only after EOF means a response is observed by the client only
/// if the router half-closes instead of tearing the connection down.
pub struct RecordingBackend {
    pub connections: Arc<AtomicU64>,
    received_rx: mpsc::UnboundedReceiver<Received>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl RecordingBackend {
    /// Listen on `dir/name`.
    pub async fn spawn_unix(dir: &Path, name: &str, reply: &[u8]) -> io::Result<Self> {
        let listener = UnixListener::bind(dir.join(name))?;
        Ok(Self::spawn(AnyListener::Unix(listener), reply))
    }

    /// Listen on 127.0.0.1 at an ephemeral port.
    pub async fn spawn_tcp(reply: &[u8]) -> io::Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok((Self::spawn(AnyListener::Tcp(listener), reply), addr))
    }

    fn spawn(listener: AnyListener, reply: &[u8]) -> Self {
        let connections = Arc::new(AtomicU64::new(0));
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let reply = reply.to_vec();

        tokio::spawn(async move {
            loop {
                let accepted: io::Result<Box<dyn Duplex>> = tokio::select! {
                    accept_result = accept(&listener) => accept_result,
                    _ = &mut shutdown_rx => break,
                };
                let Ok(mut stream) = accepted else { break };

                conn_clone.fetch_add(1, Ordering::Relaxed);
                let received_tx = received_tx.clone();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut bytes = Vec::new();
                    if stream.read_to_end(&mut bytes).await.is_err() {
                        return;
                    }
                    let _ = received_tx.send(Received { bytes });
                    let _ = stream.write_all(&reply).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            connections,
            received_rx,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Next recorded connection.
    pub async fn next_received(&mut self) -> Option<Received> {
        tokio::time::timeout(TEST_TIMEOUT, self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for RecordingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

async fn accept(listener: &AnyListener) -> io::Result<Box<dyn Duplex>> {
    match listener {
        AnyListener::Tcp(l) => Ok(Box::new(l.accept().await?.0)),
        AnyListener::Unix(l) => Ok(Box::new(l.accept().await?.0)),
    }
}

/// TLS-terminating backend on a Unix socket.
pub struct TlsBackend {
    pub path: PathBuf,
    pub cert_der: Vec<u8>,
    pub connections: Arc<AtomicU64>,
    pub marker: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsBackend {
    /// Listen on `dir/socket_name` with a certificate for `server_name`.
    ///
    /// Each connection completes the handshake, reads one request, and
    /// answers with `marker`.
    pub async fn spawn_unix(
        dir: &Path,
        socket_name: &str,
        server_name: &str,
        marker: &str,
    ) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let certs = vec![CertificateDer::from(cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let path = dir.join(socket_name);
        let listener = UnixListener::bind(&path)?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);
        let marker_bytes = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                let response = marker_bytes.clone();
                                tokio::spawn(async move {
                                    if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                        let mut buf = vec![0u8; 1024];
                                        if tls_stream.read(&mut buf).await.is_ok() {
                                            let _ = tls_stream.write_all(&response).await;
                                            let _ = tls_stream.shutdown().await;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            path,
            cert_der,
            connections,
            marker: marker.to_string(),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running router listener.
pub struct RouterHandle {
    pub listen_addr: ConnAddr,
    pub listener: Arc<Listener>,
    task: tokio::task::JoinHandle<()>,
}

impl RouterHandle {
    /// Route to Unix sockets in `dir`, listening on 127.0.0.1.
    pub async fn spawn_unix_dir(dir: &Path) -> io::Result<Self> {
        Self::spawn(unix_server(dir)).await
    }

    /// Listen on 127.0.0.1 at an ephemeral port.
    pub async fn spawn(server: ServerConfig) -> io::Result<Self> {
        Self::spawn_on(&ListenSpec::Tcp("127.0.0.1:0".to_string()), server).await
    }

    pub async fn spawn_on(spec: &ListenSpec, server: ServerConfig) -> io::Result<Self> {
        let listener = Arc::new(Listener::bind(spec, Arc::new(server)).await?);
        let listen_addr = listener.local_addr()?;

        let run = Arc::clone(&listener);
        let task = tokio::spawn(async move {
            let _ = run.run().await;
        });

        Ok(Self {
            listen_addr,
            listener,
            task,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        match &self.listen_addr {
            ConnAddr::Tcp(addr) => *addr,
            other => panic!("router is not listening on TCP: {other}"),
        }
    }

    pub async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(self.tcp_addr()).await
    }

    pub async fn connect_unix(&self) -> io::Result<UnixStream> {
        match &self.listen_addr {
            ConnAddr::Unix(Some(path)) => UnixStream::connect(path).await,
            other => panic!("router is not listening on a Unix socket: {other}"),
        }
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn unix_server(dir: &Path) -> ServerConfig {
    ServerConfig::new(Arc::new(UnixDialer::new(dir)))
}

/// A TLS 1.2-framed ClientHello record, optionally carrying SNI.
pub fn client_hello(server_name: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(name) = server_name {
        let name = name.as_bytes();
        let mut list = vec![0x00];
        list.extend_from_slice(&(name.len() as u16).to_be_bytes());
        list.extend_from_slice(name);

        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
        extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&list);
    }

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x42; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Read until the router closes the connection.
pub async fn read_until_closed<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "router did not close"))??;
    Ok(buf)
}

pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}
