//! Error types for the router.
//!
//! Every per-connection failure maps to a [`RelayError`], which is logged with
//! its reason code and then dropped together with the connection. Only
//! [`AcceptError::Fatal`] escapes a listener.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Hostname validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostnameError {
    /// Empty, starts with a dot, contains a path separator, or ends in "..".
    #[error("invalid hostname {0:?}")]
    Invalid(String),
}

/// Errors while peeking the TLS ClientHello.
#[derive(Debug, Error)]
pub enum PeekError {
    /// Client did not send a complete ClientHello in time.
    #[error("timed out waiting for ClientHello")]
    Timeout,

    /// I/O error (including EOF in the middle of a record).
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    /// First record is not a TLS handshake record.
    #[error("not a TLS handshake record (content type {content_type:#04x})")]
    NotTls { content_type: u8 },

    /// First handshake message is not a ClientHello.
    #[error("handshake message is not a ClientHello (type {handshake_type:#04x})")]
    NotClientHello { handshake_type: u8 },

    /// Record or handshake exceeds the size limit.
    #[error("ClientHello too large ({len} bytes)")]
    TooLarge { len: usize },

    /// Structurally invalid ClientHello.
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),
}

/// Errors while dialing a backend.
#[derive(Debug, Error)]
pub enum DialError {
    /// Neither the exact nor the wildcard socket exists.
    #[error("no backend socket found for {hostname:?}")]
    NoBackendFound { hostname: String },

    /// Resolved address is outside every allow-listed CIDR.
    #[error("{addr} is not an allowed backend")]
    BackendNotAllowed { addr: IpAddr },

    /// No port configured and the client is not connected over TCP.
    #[error("cannot determine backend port number because client is not connected using TCP")]
    CannotDeterminePort,

    /// NAT46 source binding requires an IPv4-over-TCP client.
    #[error("NAT46 source address unavailable: {0}")]
    Nat46Precondition(&'static str),

    /// Name resolution failed.
    #[error("failed to resolve {hostname:?}: {source}")]
    Resolve {
        hostname: String,
        #[source]
        source: io::Error,
    },

    /// Name resolved to no usable address.
    #[error("{hostname:?} did not resolve to any usable address")]
    NoAddresses { hostname: String },

    /// Socket setup before connect failed (creation, freebind, bind).
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),

    /// Connect failed (refused, unreachable, permission denied, ...).
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Dial did not complete within the timeout.
    #[error("connect timed out")]
    Timeout,
}

impl DialError {
    /// Get the reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DialError::NoBackendFound { .. } => "no_backend_found",
            DialError::BackendNotAllowed { .. } => "backend_not_allowed",
            DialError::CannotDeterminePort => "cannot_determine_port",
            DialError::Nat46Precondition(_) => "nat46_precondition_failed",
            DialError::Resolve { .. } | DialError::NoAddresses { .. } => "resolve_failed",
            DialError::Socket(_) | DialError::Connect { .. } | DialError::Timeout => "dial_failed",
        }
    }
}

/// Connection-fatal relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("peeking ClientHello failed: {0}")]
    PeekFailed(#[from] PeekError),

    #[error("no SNI provided and no default hostname set")]
    NoHostname,

    #[error(transparent)]
    InvalidHostname(#[from] HostnameError),

    #[error("dialing backend failed: {0}")]
    Dial(#[from] DialError),

    #[error("writing PROXY header to backend failed: {0}")]
    ProxyHeaderWriteFailed(#[source] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::PeekFailed(_) => "peek_failed",
            RelayError::NoHostname => "no_hostname",
            RelayError::InvalidHostname(_) => "invalid_hostname",
            RelayError::Dial(e) => e.reason_code(),
            RelayError::ProxyHeaderWriteFailed(_) => "proxy_header_write_failed",
        }
    }
}

/// Accept-time errors.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// Transient condition; the accept loop keeps going.
    #[error("temporary accept error: {0}")]
    Temporary(#[source] io::Error),

    /// The listener is unusable; its accept loop ends.
    #[error("accept failed: {0}")]
    Fatal(#[source] io::Error),
}

impl AcceptError {
    /// Classify an accept error.
    pub fn classify(err: io::Error) -> Self {
        if is_temporary(&err) {
            AcceptError::Temporary(err)
        } else {
            AcceptError::Fatal(err)
        }
    }
}

/// Whether an accept error is transient.
///
/// Covers aborted/reset handshakes, interrupted calls, and descriptor or
/// buffer exhaustion, which clears once other connections close.
pub fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    is_resource_exhaustion(err)
}

/// Out of descriptors or kernel buffers.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DialError::NoBackendFound {
            hostname: "svc.example.com".to_string(),
        };
        assert!(err.to_string().contains("svc.example.com"));

        let err = DialError::BackendNotAllowed {
            addr: "192.168.1.1".parse().unwrap(),
        };
        assert_eq!(err.to_string(), "192.168.1.1 is not an allowed backend");
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RelayError::NoHostname.reason_code(), "no_hostname");
        assert_eq!(
            RelayError::from(DialError::BackendNotAllowed {
                addr: "10.0.0.1".parse().unwrap()
            })
            .reason_code(),
            "backend_not_allowed"
        );
        assert_eq!(
            RelayError::from(PeekError::Timeout).reason_code(),
            "peek_failed"
        );
        assert_eq!(
            RelayError::from(HostnameError::Invalid("a/b".to_string())).reason_code(),
            "invalid_hostname"
        );
        assert_eq!(
            RelayError::ProxyHeaderWriteFailed(io::Error::from(io::ErrorKind::BrokenPipe))
                .reason_code(),
            "proxy_header_write_failed"
        );
    }

    #[test]
    fn test_accept_error_classification() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(matches!(
            AcceptError::classify(aborted),
            AcceptError::Temporary(_)
        ));

        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(is_temporary(&emfile));

        let invalid = io::Error::from_raw_os_error(libc::EBADF);
        assert!(matches!(AcceptError::classify(invalid), AcceptError::Fatal(_)));
    }
}
