//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! The whole hub runs on one thread. The listener, the control waker and
//! every client socket share one `Poll`; handlers for a readiness round run
//! one after another to completion. The only place the loop waits is
//! `Poll::poll`.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info};

use super::connection::Connection;
use super::token::{classify, TokenKind, CONTROL_TOKEN, LISTENER_TOKEN};
use crate::config::Config;
use crate::registry::{ClientId, ClientRegistry};

/// Reactor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Blocked in (or about to enter) the readiness wait.
    Idle,
    /// Handling the descriptors of one readiness round.
    Dispatching,
    /// Terminal: every socket is closed and no further dispatch happens.
    ShuttingDown,
}

/// Cross-thread handle that asks the reactor to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Request shutdown and wake the reactor out of its readiness wait.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Per-connection limits applied by the lifecycle handlers.
#[derive(Debug, Clone, Copy)]
pub(super) struct Limits {
    pub max_frame_size: usize,
    pub max_write_backlog: usize,
}

/// A readiness event copied out of `Events`.
#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

/// The broadcast hub: listening socket, watch set and registry.
pub struct Server {
    pub(super) poll: Poll,
    events: Events,
    ready: Vec<Ready>,
    pub(super) listener: Option<TcpListener>,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    /// Every watched client socket, handshaking or joined.
    pub(super) connections: Slab<Connection>,
    pub(super) registry: ClientRegistry,
    pub(super) limits: Limits,
    state: LoopState,
}

impl Server {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let waker = Waker::new(poll.registry(), CONTROL_TOKEN)?;
        let shutdown = ShutdownHandle {
            requested: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
        };

        info!(addr = %local_addr, backlog = config.backlog, "Server listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            ready: Vec::with_capacity(config.event_capacity),
            listener: Some(listener),
            local_addr,
            shutdown,
            connections: Slab::new(),
            registry: ClientRegistry::new(),
            limits: Limits {
                max_frame_size: config.max_frame_size,
                max_write_backlog: config.max_write_backlog,
            },
            state: LoopState::Idle,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Number of watched descriptors, listener included.
    pub fn watched(&self) -> usize {
        self.connections.len() + usize::from(self.listener.is_some())
    }

    /// Run until shutdown is requested or the readiness wait fails.
    ///
    /// A wait interrupted by a signal is re-entered; the control waker then
    /// delivers the shutdown request. Any other readiness-wait failure is
    /// fatal: connections are closed and the error is returned to the caller.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            match self.turn(None) {
                Ok(LoopState::ShuttingDown) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Readiness wait failed");
                    self.close_all();
                    return Err(e);
                }
            }
        }
    }

    /// Perform one readiness round: wait, then dispatch every ready handle.
    ///
    /// `None` blocks until something is ready.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<LoopState> {
        if self.state == LoopState::ShuttingDown {
            return Ok(self.state);
        }

        self.state = LoopState::Idle;
        let waited = self.poll.poll(&mut self.events, timeout);
        self.dispatch_round(waited)
    }

    /// Dispatch the events gathered by the last readiness wait.
    ///
    /// `EINTR` leaves the loop idle with nothing dispatched.
    fn dispatch_round(&mut self, waited: io::Result<()>) -> io::Result<LoopState> {
        match waited {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("Readiness wait interrupted");
                return Ok(self.state);
            }
            Err(e) => return Err(e),
        }

        self.state = LoopState::Dispatching;

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|event| Ready {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable(),
        }));

        for event in &ready {
            if self.state == LoopState::ShuttingDown {
                break;
            }

            match classify(event.token) {
                TokenKind::Listener => self.handle_accept(),
                TokenKind::Control => {
                    if self.shutdown.is_requested() {
                        self.close_all();
                    }
                }
                TokenKind::Client(id) => {
                    self.handle_client_event(id, event.readable, event.writable)
                }
            }
        }

        self.ready = ready;

        if self.state == LoopState::Dispatching {
            self.state = LoopState::Idle;
        }
        Ok(self.state)
    }

    /// Close every client socket and the listener and enter `ShuttingDown`.
    fn close_all(&mut self) {
        info!(clients = self.registry.len(), "Shutting down server");
        self.state = LoopState::ShuttingDown;

        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            let _ = conn.stream.shutdown(Shutdown::Both);
        }

        let joined: Vec<ClientId> = self.registry.ids().collect();
        for id in joined {
            let _ = self.registry.unregister(id);
        }

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }
}

/// Create the listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
