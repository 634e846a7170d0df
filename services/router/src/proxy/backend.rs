//! Backend dialing.
//!
//! A [`BackendDialer`] turns a canonical hostname (plus the addressing of the
//! client connection) into a connected backend stream. Two strategies exist:
//!
//! - [`UnixDialer`]: one Unix socket per hostname inside a directory, with a
//!   wildcard fallback (`_.example.com`).
//! - [`TcpDialer`](super::tcp::TcpDialer): the hostname is resolved and
//!   dialed over TCP, restricted to allow-listed CIDRs, optionally from a
//!   synthetic NAT46 source address.
//!
//! The relay only ever holds an `Arc<dyn BackendDialer>`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::debug;

use super::hostname::CanonicalHostname;
use super::listener::ClientAddressing;
use super::tcp::{TcpDialer, TcpDialerConfig};
use crate::error::DialError;

/// A connected duplex backend stream.
///
/// Half-close is `AsyncWriteExt::shutdown`, which for TCP and Unix streams
/// shuts down the write direction only; the stream stays readable until
/// dropped.
pub trait BackendStream: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

impl<T> BackendStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

/// Owned backend connection; dropping it closes the connection.
pub type BackendConn = Box<dyn BackendStream>;

/// Capability to connect to the backend for a hostname.
#[async_trait]
pub trait BackendDialer: Send + Sync + fmt::Debug {
    /// Connect to the backend serving `hostname`.
    async fn dial(
        &self,
        hostname: &CanonicalHostname,
        client: &ClientAddressing,
    ) -> Result<BackendConn, DialError>;
}

/// Dialer selection, as configured at startup.
#[derive(Debug, Clone)]
pub enum DialerConfig {
    /// Unix sockets named after hostnames inside `directory`.
    Unix { directory: PathBuf },
    /// CIDR-restricted TCP, optionally with NAT46 source addresses.
    Tcp(TcpDialerConfig),
}

impl DialerConfig {
    /// Build the dialer for this configuration.
    pub fn build(&self) -> Arc<dyn BackendDialer> {
        match self {
            DialerConfig::Unix { directory } => Arc::new(UnixDialer::new(directory.clone())),
            DialerConfig::Tcp(config) => Arc::new(TcpDialer::new(config.clone())),
        }
    }

    /// Short mode name for logs.
    pub fn mode(&self) -> &'static str {
        match self {
            DialerConfig::Unix { .. } => "unix",
            DialerConfig::Tcp(config) if config.ipv6_source_prefix.is_some() => "nat46",
            DialerConfig::Tcp(_) => "tcp",
        }
    }
}

/// Dials `directory/<hostname>`, falling back to `directory/<wildcard>`.
#[derive(Debug, Clone)]
pub struct UnixDialer {
    directory: PathBuf,
}

impl UnixDialer {
    /// Create a dialer for a socket directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Socket path for a routing key.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

#[async_trait]
impl BackendDialer for UnixDialer {
    async fn dial(
        &self,
        hostname: &CanonicalHostname,
        _client: &ClientAddressing,
    ) -> Result<BackendConn, DialError> {
        let exact = hostname.as_str().to_string();
        let wildcard = hostname.wildcard();

        let mut candidates = vec![exact];
        if wildcard != candidates[0] {
            candidates.push(wildcard);
        }

        for name in candidates {
            let path = self.socket_path(&name);
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    debug!(socket = %path.display(), "Connected to backend socket");
                    return Ok(Box::new(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(socket = %path.display(), "Backend socket does not exist");
                }
                Err(e) => {
                    return Err(DialError::Connect {
                        target: path.display().to_string(),
                        source: e,
                    });
                }
            }
        }

        Err(DialError::NoBackendFound {
            hostname: hostname.to_string(),
        })
    }
}
