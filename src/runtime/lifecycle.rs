//! Connection lifecycle handlers.
//!
//! Accept path: a new socket enters the watch set in the handshaking phase.
//! Its first complete frame must be a name announcement; the server answers
//! with the address it sees, registers the client and announces the join to
//! everyone already present.
//!
//! Message path: each chat line is relayed to every other joined client.
//!
//! Departure path: end of stream, a transport error, a malformed frame or a
//! protocol violation all remove the connection. For a joined client the
//! display name is resolved first, then the socket is closed, the registry
//! entry dropped and the departure announced to the remaining clients.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use bytes::Bytes;
use mio::{Interest, Registry};
use slab::Slab;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, Phase, ReadStatus};
use super::event_loop::Server;
use super::token::client_token;
use crate::protocol::{encode, CodecError, Message};
use crate::registry::ClientId;
use crate::router::{self, FrameSink};

/// Read granularity for client sockets.
const READ_CHUNK: usize = 16 * 1024;

/// Why a connection is being removed.
#[derive(Debug)]
pub(super) enum Departure {
    /// Peer ended the stream.
    Closed,
    /// Read or write failed.
    Transport(io::Error),
    /// Frame could not be decoded.
    Malformed(CodecError),
    /// Well-formed frame that is not allowed in the current phase.
    Violation(&'static str),
    /// The server could not produce its own reply.
    Internal(CodecError),
}

impl fmt::Display for Departure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Departure::Closed => write!(f, "closed by peer"),
            Departure::Transport(e) => write!(f, "transport error: {e}"),
            Departure::Malformed(e) => write!(f, "malformed frame: {e}"),
            Departure::Violation(what) => write!(f, "protocol violation: {what}"),
            Departure::Internal(e) => write!(f, "server error: {e}"),
        }
    }
}

/// Frame sink that queues onto the reactor's connections.
struct Outbound<'a> {
    connections: &'a mut Slab<Connection>,
    registry: &'a Registry,
    max_write_backlog: usize,
}

impl FrameSink for Outbound<'_> {
    fn send_frame(&mut self, id: ClientId, frame: &Bytes) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(id.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        conn.queue(frame, self.max_write_backlog)?;
        conn.sync_interest(self.registry, client_token(id))
    }
}

impl Server {
    /// Accept every pending connection on the listener.
    pub(super) fn handle_accept(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let entry = self.connections.vacant_entry();
                    let id = ClientId(entry.key());
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        client_token(id),
                        Interest::READABLE,
                    ) {
                        warn!(peer = %peer_addr, error = %e, "Failed to watch connection");
                        continue;
                    }
                    entry.insert(Connection::new(
                        stream,
                        peer_addr,
                        self.limits.max_frame_size,
                    ));

                    debug!(conn_id = %id, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Service one readiness event on a client socket.
    pub(super) fn handle_client_event(&mut self, id: ClientId, readable: bool, writable: bool) {
        if writable {
            let Some(conn) = self.connections.get_mut(id.0) else {
                return;
            };
            let flushed = conn
                .flush()
                .and_then(|_| conn.sync_interest(self.poll.registry(), client_token(id)));
            if let Err(e) = flushed {
                self.depart(id, Departure::Transport(e));
                return;
            }
        }

        if readable {
            self.service_readable(id);
        }
    }

    /// Read until the socket is drained, handling each complete frame as
    /// soon as it is buffered.
    fn service_readable(&mut self, id: ClientId) {
        let mut scratch = [0u8; READ_CHUNK];

        loop {
            let Some(conn) = self.connections.get_mut(id.0) else {
                return;
            };

            match conn.read_chunk(&mut scratch) {
                Ok(ReadStatus::Data) => {
                    if !self.drain_messages(id) {
                        return;
                    }
                }
                Ok(ReadStatus::Drained) => return,
                Ok(ReadStatus::Closed) => {
                    self.depart(id, Departure::Closed);
                    return;
                }
                Err(e) => {
                    self.depart(id, Departure::Transport(e));
                    return;
                }
            }
        }
    }

    /// Dispatch every complete frame buffered for `id`.
    ///
    /// Returns `false` once the connection is gone.
    fn drain_messages(&mut self, id: ClientId) -> bool {
        loop {
            let Some(conn) = self.connections.get_mut(id.0) else {
                return false;
            };

            match conn.next_message() {
                Ok(Some(message)) => {
                    if !self.dispatch(id, message) {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    self.depart(id, Departure::Malformed(e));
                    return false;
                }
            }
        }
    }

    /// Handle one inbound message according to the connection's phase.
    fn dispatch(&mut self, id: ClientId, message: Message) -> bool {
        let Some(phase) = self.connections.get(id.0).map(|c| c.phase) else {
            return false;
        };

        match (phase, message) {
            (Phase::Handshaking, Message::NameAnnounce { name }) => {
                self.complete_handshake(id, name)
            }
            (Phase::Handshaking, _) => {
                self.depart(id, Departure::Violation("expected name announcement"));
                false
            }
            (Phase::Joined, Message::ChatLine { text }) => {
                if text.is_empty() {
                    debug!(conn_id = %id, "Ignoring empty chat line");
                } else {
                    self.relay(id, &text);
                }
                self.connections.contains(id.0)
            }
            (Phase::Joined, _) => {
                self.depart(id, Departure::Violation("unexpected message after join"));
                false
            }
        }
    }

    /// Acknowledge the client's address, register it and announce the join.
    fn complete_handshake(&mut self, id: ClientId, name: String) -> bool {
        let name = name.trim().to_string();
        if name.is_empty() {
            self.depart(id, Departure::Violation("empty name"));
            return false;
        }

        let Some(conn) = self.connections.get_mut(id.0) else {
            return false;
        };
        let peer_addr = conn.peer_addr;

        let ack = match encode(&Message::address_ack(peer_addr.ip().to_string())) {
            Ok(frame) => frame,
            Err(e) => {
                error!(conn_id = %id, error = %e, "Failed to encode address ack");
                self.depart(id, Departure::Internal(e));
                return false;
            }
        };

        let sent = conn
            .queue(&ack, self.limits.max_write_backlog)
            .and_then(|_| conn.sync_interest(self.poll.registry(), client_token(id)));
        if let Err(e) = sent {
            self.depart(id, Departure::Transport(e));
            return false;
        }

        let client_number = match self.registry.register(id, peer_addr, name.as_str()) {
            Ok(n) => n,
            Err(e) => {
                error!(conn_id = %id, error = %e, "Registry invariant violated");
                self.depart(id, Departure::Violation("duplicate registration"));
                return false;
            }
        };
        conn.phase = Phase::Joined;

        let display_name = match self.registry.resolve_display_name(id) {
            Ok(display_name) => display_name,
            Err(e) => {
                error!(conn_id = %id, error = %e, "Registry invariant violated");
                return true;
            }
        };

        info!(
            conn_id = %id,
            peer = %peer_addr,
            name = %name,
            clients = client_number,
            "Client joined"
        );

        let failed = self.fan_out(Some(id), &Message::join_notice(client_number, display_name));
        self.depart_all(failed);
        self.connections.contains(id.0)
    }

    /// Relay a chat line from `id` to every other joined client.
    fn relay(&mut self, id: ClientId, text: &str) {
        let display_name = match self.registry.resolve_display_name(id) {
            Ok(display_name) => display_name,
            Err(e) => {
                error!(conn_id = %id, error = %e, "Registry invariant violated");
                return;
            }
        };

        debug!(conn_id = %id, len = text.len(), "Relaying chat line");
        let failed = self.fan_out(Some(id), &Message::relayed(&display_name, text));
        self.depart_all(failed);
    }

    /// Broadcast to every registered client except `exclude`.
    ///
    /// Returns the recipients whose send failed; the caller removes them.
    fn fan_out(&mut self, exclude: Option<ClientId>, message: &Message) -> Vec<(ClientId, Departure)> {
        let mut sink = Outbound {
            connections: &mut self.connections,
            registry: self.poll.registry(),
            max_write_backlog: self.limits.max_write_backlog,
        };

        match router::broadcast(&self.registry, &mut sink, exclude, message) {
            Ok(delivery) => delivery
                .failed
                .into_iter()
                .map(|(id, e)| (id, Departure::Transport(e)))
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to encode broadcast");
                Vec::new()
            }
        }
    }

    /// Remove a connection, plus any recipient that fails while its
    /// departure is being announced.
    pub(super) fn depart(&mut self, id: ClientId, reason: Departure) {
        self.depart_all(vec![(id, reason)]);
    }

    fn depart_all(&mut self, departures: Vec<(ClientId, Departure)>) {
        let mut queue: VecDeque<_> = departures.into();

        while let Some((id, reason)) = queue.pop_front() {
            queue.extend(self.remove_connection(id, reason));
        }
    }

    fn remove_connection(&mut self, id: ClientId, reason: Departure) -> Vec<(ClientId, Departure)> {
        let Some(mut conn) = self.connections.try_remove(id.0) else {
            return Vec::new();
        };

        let _ = self.poll.registry().deregister(&mut conn.stream);
        if conn.pending_output() > 0 {
            debug!(conn_id = %id, unsent = conn.pending_output(), "Dropping unsent output");
        }

        if conn.phase == Phase::Handshaking {
            warn!(conn_id = %id, peer = %conn.peer_addr, reason = %reason, "Handshake failed");
            return Vec::new();
        }

        // Resolve before unregistering so the announcement can name the client.
        let display_name = self.registry.resolve_display_name(id);
        drop(conn);

        if let Err(e) = self.registry.unregister(id) {
            error!(conn_id = %id, error = %e, "Registry invariant violated");
        }

        match display_name {
            Ok(display_name) => {
                info!(
                    conn_id = %id,
                    client = %display_name,
                    clients = self.registry.connected(),
                    reason = %reason,
                    "Client left"
                );
                self.fan_out(None, &Message::leave_notice(display_name))
            }
            Err(e) => {
                error!(conn_id = %id, error = %e, reason = %reason, "Removed unnamed client");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_departure_reasons_blame_the_right_side() {
        let frame_err = CodecError::FrameTooLarge { size: 10, max: 5 };
        assert_eq!(
            Departure::Malformed(frame_err).to_string(),
            "malformed frame: frame size 10 exceeds maximum 5"
        );

        let local_err = CodecError::FrameTooLarge { size: 10, max: 5 };
        assert_eq!(
            Departure::Internal(local_err).to_string(),
            "server error: frame size 10 exceeds maximum 5"
        );

        assert_eq!(Departure::Closed.to_string(), "closed by peer");
        assert_eq!(
            Departure::Violation("empty name").to_string(),
            "protocol violation: empty name"
        );
    }
}
