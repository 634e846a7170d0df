//! tlsmux router library.
//!
//! Routes TLS connections to backends by the server name in the ClientHello,
//! without terminating TLS.

pub mod error;
pub mod proxy;

pub use error::{AcceptError, DialError, HostnameError, PeekError, RelayError};
pub use proxy::{
    canonicalize, parse_proxy_v2, BackendDialer, CanonicalHostname, ClientAddressing, ConnAddr,
    DialerConfig, ListenSpec, Listener, ListenerStats, ParsedProxyHeader, ProxyProtocolV2,
    ServerConfig, TcpDialer, TcpDialerConfig, UnixDialer,
};
