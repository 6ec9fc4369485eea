//! chat-relay: a multi-client TCP chat relay.
//!
//! Clients connect over IPv4 or IPv6, register a nickname, then exchange
//! short length-prefixed text messages that the server rebroadcasts to
//! every connected client (sender included).
//!
//! Features:
//! - Fixed pool of 62 client slots
//! - Per-connection protocol state machine over a completion queue
//! - Worker-pool dispatch with a single acceptor thread
//! - Configuration via CLI arguments or TOML file

mod broadcast;
mod codec;
mod config;
mod pool;
mod queue;
mod server;
mod session;
mod worker;

use std::sync::Arc;
use std::thread;

use config::Config;
use server::{ServerOptions, Shutdown};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        threads = config.threads,
        "Starting chat-relay server"
    );

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_watcher(Arc::clone(&shutdown))?;

    server::run(
        ServerOptions {
            port: config.port,
            threads: config.threads,
        },
        shutdown,
    )?;

    Ok(())
}

/// Trigger shutdown on ctrl-c. The server core is thread-based, so the
/// watcher runs a minimal single-thread runtime just for the signal.
fn spawn_signal_watcher(shutdown: Arc<Shutdown>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "couldn't start signal watcher");
                    return;
                }
            };
            match runtime.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => {
                    info!("interrupt received");
                    shutdown.trigger();
                }
                Err(e) => error!(error = %e, "couldn't listen for ctrl-c"),
            }
        })
        .map(|_| ())
}
