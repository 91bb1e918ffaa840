//! Single-threaded readiness runtime for the chat hub.
//!
//! Built on mio (epoll on Linux, kqueue on macOS):
//! - `event_loop`: the `Server` reactor and its shutdown control channel
//! - `lifecycle`: accept, handshake, relay and departure handlers
//! - `connection`: per-connection read/write state
//! - `token`: poll token assignment

mod connection;
mod event_loop;
mod lifecycle;
mod token;

pub use event_loop::Server;
#[cfg(test)]
pub use event_loop::ShutdownHandle;

use crate::config::Config;
use std::io;
use tracing::{error, info};

/// Run the hub until a termination signal arrives.
pub fn run(config: &Config) -> io::Result<()> {
    let mut server = Server::bind(config)?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        if let Err(e) = handle.shutdown() {
            error!(error = %e, "Failed to signal shutdown");
        }
    })
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    server.run()?;
    info!(
        addr = %server.local_addr(),
        state = ?server.state(),
        clients = server.registry().len(),
        watched = server.watched(),
        "Server stopped"
    );
    Ok(())
}
