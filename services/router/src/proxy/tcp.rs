//! CIDR-restricted TCP backend dialing.
//!
//! The SNI hostname is used directly as the backend's network name. After
//! resolution, and before each connect, [`prepare_socket`] checks the numeric
//! address against the allow-list, so the address actually contacted is the
//! one that was validated. In NAT46 mode the same hook binds the outgoing
//! IPv6 socket to `<prefix>:<client IPv4>` (with `IP_FREEBIND`, since the
//! address is not configured locally).
//!
//! - backend port: configured port, or the port the client connected to
//! - dial timeout: 5s, covering resolution and connect

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tlsmux_networking::{AllowList, Nat46Prefix};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::backend::{BackendConn, BackendDialer};
use super::hostname::CanonicalHostname;
use super::listener::{ClientAddressing, ConnAddr};
use crate::error::DialError;

/// Default timeout for backend dials.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`TcpDialer`].
#[derive(Debug, Clone)]
pub struct TcpDialerConfig {
    /// Fixed backend port; `None` reuses the client's destination port.
    pub port: Option<u16>,
    /// CIDRs a resolved backend address must fall into.
    pub allowed: AllowList,
    /// NAT46 source prefix; when set, only IPv6 backends are dialed.
    pub ipv6_source_prefix: Option<Nat46Prefix>,
    /// Bound on resolution plus connect.
    pub timeout: Duration,
}

impl TcpDialerConfig {
    /// Create a configuration with the given allow-list and defaults otherwise.
    pub fn new(allowed: AllowList) -> Self {
        Self {
            port: None,
            allowed,
            ipv6_source_prefix: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Dials the hostname over TCP, restricted to allow-listed addresses.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    config: TcpDialerConfig,
}

impl TcpDialer {
    pub fn new(config: TcpDialerConfig) -> Self {
        Self { config }
    }

    /// Determine the backend port.
    pub fn port(&self, client: &ClientAddressing) -> Result<u16, DialError> {
        if let Some(port) = self.config.port {
            return Ok(port);
        }

        match client.local {
            ConnAddr::Tcp(addr) => Ok(addr.port()),
            ConnAddr::Unix(_) => Err(DialError::CannotDeterminePort),
        }
    }

    /// Resolve the hostname, keeping only addresses of the dial family.
    async fn resolve(
        &self,
        hostname: &CanonicalHostname,
        port: u16,
    ) -> Result<Vec<SocketAddr>, DialError> {
        let addrs = lookup_host((hostname.as_str(), port))
            .await
            .map_err(|source| DialError::Resolve {
                hostname: hostname.to_string(),
                source,
            })?;

        let ipv6_only = self.config.ipv6_source_prefix.is_some();
        let addrs: Vec<SocketAddr> = addrs.filter(|a| !ipv6_only || a.is_ipv6()).collect();

        if addrs.is_empty() {
            return Err(DialError::NoAddresses {
                hostname: hostname.to_string(),
            });
        }
        Ok(addrs)
    }

    async fn connect_any(
        &self,
        hostname: &CanonicalHostname,
        client: &ClientAddressing,
    ) -> Result<TcpStream, DialError> {
        let port = self.port(client)?;
        let targets = self.resolve(hostname, port).await?;
        self.connect_targets(hostname, targets, client).await
    }

    /// Try each address in order; return the first connection, or the error
    /// from the last address.
    async fn connect_targets(
        &self,
        hostname: &CanonicalHostname,
        targets: Vec<SocketAddr>,
        client: &ClientAddressing,
    ) -> Result<TcpStream, DialError> {
        let mut last_err = None;
        for target in targets {
            match self.connect_one(target, client).await {
                Ok(stream) => {
                    debug!(backend_addr = %target, "Connected to backend");
                    return Ok(stream);
                }
                Err(e) => {
                    if let DialError::BackendNotAllowed { addr } = &e {
                        warn!(
                            hostname = %hostname,
                            backend_addr = %addr,
                            "Backend address rejected by allow-list"
                        );
                    } else {
                        debug!(backend_addr = %target, error = %e, "Backend connect failed");
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DialError::NoAddresses {
            hostname: hostname.to_string(),
        }))
    }

    /// Create a socket for `target`, run the pre-connect hook, and connect.
    async fn connect_one(
        &self,
        target: SocketAddr,
        client: &ClientAddressing,
    ) -> Result<TcpStream, DialError> {
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
            .map_err(DialError::Socket)?;
        socket.set_nonblocking(true).map_err(DialError::Socket)?;

        prepare_socket(&self.config, target, &socket, client)?;

        let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));
        socket
            .connect(target)
            .await
            .map_err(|source| DialError::Connect {
                target: target.to_string(),
                source,
            })
    }
}

#[async_trait]
impl BackendDialer for TcpDialer {
    async fn dial(
        &self,
        hostname: &CanonicalHostname,
        client: &ClientAddressing,
    ) -> Result<BackendConn, DialError> {
        let stream = timeout(self.config.timeout, self.connect_any(hostname, client))
            .await
            .map_err(|_| DialError::Timeout)??;
        Ok(Box::new(stream))
    }
}

/// Pre-connect hook, run against every resolved address.
///
/// Rejects addresses outside the allow-list and, in NAT46 mode, binds the
/// not-yet-connected socket to the client's synthetic IPv6 source address.
pub fn prepare_socket(
    config: &TcpDialerConfig,
    target: SocketAddr,
    socket: &Socket,
    client: &ClientAddressing,
) -> Result<(), DialError> {
    check_backend(&config.allowed, target.ip())?;

    if let Some(prefix) = &config.ipv6_source_prefix {
        let source = nat46_source(prefix, client)?;
        set_freebind(socket).map_err(DialError::Socket)?;
        socket
            .bind(&SocketAddr::new(IpAddr::V6(source), 0).into())
            .map_err(DialError::Socket)?;
        debug!(source_addr = %source, "Bound NAT46 source address");
    }

    Ok(())
}

/// Check a resolved backend address against the allow-list.
pub fn check_backend(allowed: &AllowList, addr: IpAddr) -> Result<(), DialError> {
    if allowed.contains(addr) {
        Ok(())
    } else {
        Err(DialError::BackendNotAllowed { addr })
    }
}

/// Synthetic source address for a client: `<prefix>:<client IPv4>`.
///
/// The client must be connected over TCP with an IPv4 (or IPv4-mapped IPv6)
/// address.
pub fn nat46_source(prefix: &Nat46Prefix, client: &ClientAddressing) -> Result<Ipv6Addr, DialError> {
    let remote = match client.remote {
        ConnAddr::Tcp(addr) => addr.ip().to_canonical(),
        ConnAddr::Unix(_) => {
            return Err(DialError::Nat46Precondition(
                "client is not connected using TCP",
            ))
        }
    };

    match remote {
        IpAddr::V4(v4) => Ok(prefix.embed(v4)),
        IpAddr::V6(_) => Err(DialError::Nat46Precondition(
            "client is not connected using IPv4",
        )),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_freebind(socket: &Socket) -> io::Result<()> {
    socket.set_freebind(true)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_freebind(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "IP_FREEBIND is not supported on this platform",
    ))
}
