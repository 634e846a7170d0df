//! tlsmux
//!
//! SNI passthrough router.
//!
//! This service:
//! - Accepts connections on every configured listener
//! - Reads the TLS ClientHello to learn the requested hostname
//! - Connects to the backend for that hostname (Unix socket or TCP)
//! - Optionally sends a PROXY protocol v2 header
//! - Relays bytes both ways without terminating TLS

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tlsmux_router::Listener;

mod config;

use config::{Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to TLSMUX_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    let server = config.into_server_config()?;
    let mode = config.dialer_config()?.mode();

    info!("Starting tlsmux");
    info!(
        mode = mode,
        proxy_protocol = server.proxy_protocol,
        default_hostname = server.default_hostname.as_ref().map(|h| h.as_str()),
        listener_count = config.listen.len(),
        "Configuration loaded"
    );

    let listeners = Listener::bind_all(&config.listen, Arc::clone(&server))
        .await
        .context("failed to open listeners")?;

    let mut tasks = JoinSet::new();
    for listener in listeners {
        let listener = Arc::new(listener);
        tasks.spawn(async move {
            let listen = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
            (listen, listener.run().await)
        });
    }

    // Listeners are not restarted: the first one to stop ends the process.
    match tasks.join_next().await {
        Some(Ok((listen, Err(e)))) => {
            error!(listen = %listen, error = %e, "Listener stopped");
            Err(e).with_context(|| format!("listener {listen} failed"))
        }
        Some(Ok((listen, Ok(())))) => bail!("listener {listen} stopped"),
        Some(Err(e)) => Err(e).context("listener task panicked"),
        None => bail!("no listeners running"),
    }
}
