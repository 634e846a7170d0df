//! SNI passthrough relay.
//!
//! This module provides:
//! - Hostname canonicalization and wildcard names
//! - ClientHello peeking with byte replay
//! - Backend dialing over Unix sockets or allow-listed TCP
//! - PROXY protocol v2 header generation
//! - Listeners and the per-connection relay
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ClientHello Peeker -> Hostname -> BackendDialer -> Backend
//!                                                              |
//!                                                  PROXY v2 Header (if enabled)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tlsmux_router::{Listener, ListenSpec, ServerConfig, UnixDialer};
//!
//! let server = Arc::new(ServerConfig::new(Arc::new(UnixDialer::new("/run/tlsmux"))));
//! let listener = Listener::bind(&"[::]:443".parse()?, server).await?;
//! Arc::new(listener).run().await?;
//! ```

mod backend;
mod hostname;
mod listener;
mod proxy_protocol;
mod relay;
mod sni;
mod tcp;

pub use backend::{BackendConn, BackendDialer, BackendStream, DialerConfig, UnixDialer};
pub use hostname::{canonicalize, wildcard, CanonicalHostname, WILDCARD_LABEL};
pub use listener::{
    ClientAddressing, ClientConn, ConnAddr, ListenSpec, Listener, ListenerStats, ACCEPT_BACKOFF,
};
pub use proxy_protocol::{parse_proxy_v2, ParsedProxyHeader, ProxyProtocolV2, PROXY_V2_SIGNATURE};
pub use relay::{relay_connection, select_hostname, splice, ServerConfig, Transfer};
pub use sni::{
    ClientHelloInfo, ClientHelloPeeker, PeekConfig, ReplayableConnection,
    DEFAULT_MAX_HANDSHAKE_LEN, DEFAULT_PEEK_TIMEOUT,
};
pub use tcp::{
    check_backend, nat46_source, prepare_socket, TcpDialer, TcpDialerConfig, DEFAULT_DIAL_TIMEOUT,
};
