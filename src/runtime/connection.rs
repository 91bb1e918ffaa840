//! Per-connection state for the reactor.
//!
//! A connection owns its non-blocking stream, an inbound frame accumulator
//! and an outbound pending-write buffer. Reads and writes never block: they
//! stop at `WouldBlock` and resume on the next readiness event.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::protocol::{CodecError, FrameDecoder, Message};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted, waiting for the name announcement.
    Handshaking,
    /// Handshake complete and registered.
    Joined,
}

/// Result of a single read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes were appended to the frame accumulator.
    Data,
    /// Nothing more to read until the next readiness event.
    Drained,
    /// Peer closed its side of the stream.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub phase: Phase,
    decoder: FrameDecoder,
    /// Encoded frames not yet accepted by the kernel.
    outbound: BytesMut,
    /// Interest currently registered with the poller.
    interest: Interest,
}

impl Connection {
    /// Create a connection in the handshaking phase.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            stream,
            peer_addr,
            phase: Phase::Handshaking,
            decoder: FrameDecoder::new(max_frame_size),
            outbound: BytesMut::new(),
            interest: Interest::READABLE,
        }
    }

    /// Read once into `scratch` and feed the bytes to the frame accumulator.
    pub fn read_chunk(&mut self, scratch: &mut [u8]) -> io::Result<ReadStatus> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    self.decoder.extend(&scratch[..n]);
                    return Ok(ReadStatus::Data);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Drained)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Next complete inbound message, if one is fully buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        self.decoder.next_message()
    }

    /// Append a frame to the pending output and push as much as possible.
    ///
    /// Fails when the peer is not draining its socket and the backlog would
    /// grow past `max_backlog`.
    pub fn queue(&mut self, frame: &[u8], max_backlog: usize) -> io::Result<()> {
        if !self.outbound.is_empty() && self.outbound.len() + frame.len() > max_backlog {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "write backlog exceeded: {} pending bytes",
                    self.outbound.len()
                ),
            ));
        }

        self.outbound.extend_from_slice(frame);
        self.flush()
    }

    /// Write pending output until it is empty or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Re-register with the poller if the wanted interest changed.
    ///
    /// Writable interest is only held while output is pending.
    pub fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let wanted = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        if wanted != self.interest {
            registry.reregister(&mut self.stream, token, wanted)?;
            self.interest = wanted;
        }
        Ok(())
    }
}
