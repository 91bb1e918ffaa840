//! chat-hub: a single-process broadcast chat server
//!
//! Clients connect over TCP, announce a name, and from then on every chat
//! line one client sends is relayed to all the others. Joins and departures
//! are announced as ordinary chat lines.
//!
//! Features:
//! - Length-prefixed MessagePack frames
//! - Single-threaded mio reactor with non-blocking reads and writes
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Interactive client mode (`--name`)
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod protocol;
mod registry;
mod router;
mod runtime;

use config::Config;
use tracing::info;
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
        .with_writer(std::io::stderr)
        .init();

    match config.name.clone() {
        Some(name) => run_client(config, &name),
        None => run_server(config),
    }
}

/// Serve the hub until a termination signal arrives
fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        backlog = config.backlog,
        max_frame_size = config.max_frame_size,
        "Starting chat-hub server"
    );
    runtime::run(&config)?;
    Ok(())
}

/// Join a running hub as an interactive client
fn run_client(config: Config, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    client::run(&config, name)?;
    Ok(())
}
