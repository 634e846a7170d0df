//! Per-connection relay.
//!
//! Peek the ClientHello, pick the hostname, dial the backend, optionally
//! announce the client with a PROXY v2 header, then copy bytes both ways.
//!
//! Shutdown follows the client: when the client stops sending, the backend's
//! write side is shut down and the response keeps flowing. When the backend
//! stops sending (or either copy fails), both connections are closed.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

use super::backend::BackendDialer;
use super::hostname::{canonicalize, CanonicalHostname};
use super::listener::ClientAddressing;
use super::proxy_protocol::ProxyProtocolV2;
use super::sni::{ClientHelloPeeker, PeekConfig};
use crate::error::RelayError;

/// Copy buffer size per direction.
const COPY_BUF_LEN: usize = 8192;

/// Router behaviour shared by every listener.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Backend dialer.
    pub dialer: Arc<dyn BackendDialer>,
    /// Write a PROXY v2 header to each backend before relaying.
    pub proxy_protocol: bool,
    /// Used when the ClientHello carries no server name.
    pub default_hostname: Option<CanonicalHostname>,
    /// ClientHello peek limits.
    pub peek: PeekConfig,
}

impl ServerConfig {
    /// Configuration with no PROXY header and no default hostname.
    pub fn new(dialer: Arc<dyn BackendDialer>) -> Self {
        Self {
            dialer,
            proxy_protocol: false,
            default_hostname: None,
            peek: PeekConfig::default(),
        }
    }

    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.proxy_protocol = enabled;
        self
    }

    pub fn with_default_hostname(mut self, hostname: Option<CanonicalHostname>) -> Self {
        self.default_hostname = hostname;
        self
    }
}

/// Bytes relayed in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Client to backend, including the replayed ClientHello.
    pub to_backend: u64,
    /// Backend to client.
    pub from_backend: u64,
}

/// Pick the routing hostname for a ClientHello server name.
pub fn select_hostname(
    server_name: &str,
    default_hostname: Option<&CanonicalHostname>,
) -> Result<CanonicalHostname, RelayError> {
    if server_name.is_empty() {
        return default_hostname.cloned().ok_or(RelayError::NoHostname);
    }
    Ok(canonicalize(server_name)?)
}

/// Relay one client connection to its backend.
///
/// Both connections are closed by the time this returns, on every path.
pub async fn relay_connection<S>(
    server: &ServerConfig,
    client: S,
    addressing: ClientAddressing,
) -> Result<Transfer, RelayError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let peeker = ClientHelloPeeker::with_config(server.peek.clone());
    let (hello, client) = peeker.peek(client).await?;

    let hostname = select_hostname(&hello.server_name, server.default_hostname.as_ref())?;
    debug!(hostname = %hostname, "Routing connection");

    let mut backend = server.dialer.dial(&hostname, &addressing).await?;

    if server.proxy_protocol {
        let header = ProxyProtocolV2::new(addressing.remote, addressing.local).encode();
        backend
            .write_all(&header)
            .await
            .map_err(RelayError::ProxyHeaderWriteFailed)?;
        debug!("PROXY v2 header sent");
    }

    Ok(splice(client, backend).await)
}

/// Aborts the task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Copy bytes between `client` and `backend` until the backend is done.
///
/// Client EOF half-closes the backend. Backend EOF, or an error in either
/// direction, tears down both streams.
pub async fn splice<C, B>(client: C, backend: B) -> Transfer
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let to_backend = Arc::new(AtomicU64::new(0));
    let upstream_counter = Arc::clone(&to_backend);

    let mut upstream = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = copy_counting(&mut client_read, &mut backend_write, &upstream_counter).await
        {
            debug!(error = %e, "Client to backend copy failed");
        }
        if let Err(e) = backend_write.shutdown().await {
            debug!(error = %e, "Backend half-close failed");
        }
    }));

    let from_backend = AtomicU64::new(0);
    if let Err(e) = copy_counting(&mut backend_read, &mut client_write, &from_backend).await {
        debug!(error = %e, "Backend to client copy failed");
    }
    if let Err(e) = client_write.shutdown().await {
        debug!(error = %e, "Client shutdown failed");
    }

    // Wait for the upstream half to be gone so both streams drop here.
    upstream.0.abort();
    let _ = (&mut upstream.0).await;

    Transfer {
        to_backend: to_backend.load(Ordering::Relaxed),
        from_backend: from_backend.load(Ordering::Relaxed),
    }
}

async fn copy_counting<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
