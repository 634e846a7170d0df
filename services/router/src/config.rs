//! Router configuration.
//!
//! Every option is a command-line flag with a `TLSMUX_*` environment
//! fallback. Mode-specific requirements are checked in
//! [`Config::into_server_config`], not by the argument parser, so the error
//! names the mode that needs the missing option.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tlsmux_networking::{AllowList, Nat46Prefix};

use tlsmux_router::{
    canonicalize, DialerConfig, ListenSpec, ServerConfig, TcpDialerConfig,
};

/// Backend dialing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// One Unix socket per hostname in --unix-directory.
    Unix,
    /// TCP to allow-listed backends.
    Tcp,
    /// TCP over IPv6 from a NAT46 source address.
    Nat46,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "tlsmux", version, about = "Route TLS connections to backends by SNI")]
pub struct Config {
    /// Socket to listen on: tcp:HOST:PORT, HOST:PORT, or unix:PATH (repeatable)
    #[arg(long = "listen", env = "TLSMUX_LISTEN", value_delimiter = ',')]
    pub listen: Vec<ListenSpec>,

    /// Default hostname if client does not provide SNI
    #[arg(long, env = "TLSMUX_DEFAULT_HOSTNAME")]
    pub default_hostname: Option<String>,

    /// Backend mode
    #[arg(long, env = "TLSMUX_MODE", value_enum)]
    pub mode: Option<Mode>,

    /// Use PROXY protocol when talking to backend
    #[arg(long, env = "TLSMUX_PROXY_PROTO")]
    pub proxy_proto: bool,

    /// Directory containing backend Unix sockets (unix mode)
    #[arg(long, env = "TLSMUX_UNIX_DIRECTORY")]
    pub unix_directory: Option<PathBuf>,

    /// CIDR of allowed backends (repeatable) (tcp, nat46 modes)
    #[arg(long = "backend-cidr", env = "TLSMUX_BACKEND_CIDR", value_delimiter = ',')]
    pub backend_cidr: Vec<String>,

    /// Port number of backend; defaults to the listener's port (tcp, nat46 modes)
    #[arg(long, env = "TLSMUX_BACKEND_PORT")]
    pub backend_port: Option<u16>,

    /// IPv6 prefix for NAT46 source addresses; first 96 bits are used (nat46 mode)
    #[arg(long, env = "TLSMUX_NAT46_PREFIX")]
    pub nat46_prefix: Option<Nat46Prefix>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "TLSMUX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "TLSMUX_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

impl Config {
    /// Dialer for the configured mode.
    pub fn dialer_config(&self) -> Result<DialerConfig> {
        let Some(mode) = self.mode else {
            bail!("--mode must be unix, tcp, or nat46");
        };

        match mode {
            Mode::Unix => {
                let Some(directory) = self.unix_directory.clone() else {
                    bail!("--unix-directory must be specified when you use --mode unix");
                };
                Ok(DialerConfig::Unix { directory })
            }
            Mode::Tcp | Mode::Nat46 => {
                let mode_name = if mode == Mode::Tcp { "tcp" } else { "nat46" };
                if self.backend_cidr.is_empty() {
                    bail!(
                        "At least one --backend-cidr must be specified when you use --mode {mode_name}"
                    );
                }

                let mut allowed = AllowList::new();
                for cidr in &self.backend_cidr {
                    allowed
                        .add_cidr(cidr)
                        .with_context(|| format!("invalid --backend-cidr {cidr:?}"))?;
                }

                let mut config = TcpDialerConfig::new(allowed);
                config.port = self.backend_port;

                if mode == Mode::Nat46 {
                    let Some(prefix) = self.nat46_prefix else {
                        bail!("--nat46-prefix must be specified when you use --mode nat46");
                    };
                    config.ipv6_source_prefix = Some(prefix);
                }

                Ok(DialerConfig::Tcp(config))
            }
        }
    }

    /// Validate the configuration and build the shared server state.
    pub fn into_server_config(&self) -> Result<Arc<ServerConfig>> {
        let dialer = self.dialer_config()?;

        if self.listen.is_empty() {
            bail!("At least one --listen must be specified");
        }

        let default_hostname = self
            .default_hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(canonicalize)
            .transpose()
            .context("invalid --default-hostname")?;

        Ok(Arc::new(
            ServerConfig::new(dialer.build())
                .with_proxy_protocol(self.proxy_proto)
                .with_default_hostname(default_hostname),
        ))
    }
}
