//! Length-prefixed framing for chat messages.
//!
//! Wire format of one frame:
//! - 4 bytes: big-endian payload length `L`
//! - `L` bytes: MessagePack-encoded [`Message`]
//!
//! Two decoding paths are provided. [`read_message`] blocks on a reader until
//! a whole frame has arrived and is used by the client. [`FrameDecoder`]
//! accumulates bytes as they trickle in on a non-blocking socket and yields
//! messages only once a frame is complete, so the reactor never waits on a
//! single slow peer.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::message::Message;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default cap on a declared frame length (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest single reservation made for a partially received frame.
const MAX_RESERVE_STEP: usize = 64 * 1024;

/// Errors raised while framing or unframing messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Transport failure while reading or writing a frame.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Declared or encoded frame length exceeds the allowed maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// MessagePack encoding error.
    #[error("encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Payload did not deserialize into a message.
    #[error("decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serialize a message and prefix it with its length.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let payload = rmp_serde::to_vec_named(message)?;

    if payload.len() > u32::MAX as usize {
        return Err(CodecError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Encode a message and write the whole frame to `writer`.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), CodecError> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read exactly one frame from a blocking reader.
///
/// Returns `Ok(None)` when the peer closes before a complete length prefix
/// arrives. Once the prefix is in, short reads are looped over until the
/// full payload is available; an end of stream inside the payload is an
/// `Io` error with kind `UnexpectedEof`.
pub fn read_message<R: Read>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Message>, CodecError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;

    while filled < LENGTH_PREFIX_SIZE {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let length = u32::from_be_bytes(prefix) as usize;
    if length > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: length,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Resumable frame accumulator for one connection.
///
/// Bytes are appended with [`extend`](FrameDecoder::extend) as they are read
/// off the socket; [`next_message`](FrameDecoder::next_message) only
/// deserializes once the declared length is fully buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed as a frame.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, if any.
    ///
    /// `Ok(None)` means more bytes are needed. An oversized length prefix or
    /// an undecodable payload is an error; the decoder is not usable after
    /// that since the stream has lost framing.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;

        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        if self.buf.len() < LENGTH_PREFIX_SIZE + length {
            // Grow toward the declared length in bounded steps.
            let missing = LENGTH_PREFIX_SIZE + length - self.buf.len();
            self.buf.reserve(missing.min(MAX_RESERVE_STEP));
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        let payload = self.buf.split_to(length);
        Ok(Some(rmp_serde::from_slice(&payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `chunk` bytes per call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(out.len()).min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_encode_prefix_is_big_endian_length() {
        let frame = encode(&Message::chat_line("hi")).unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_read_message_roundtrip() {
        let messages = vec![
            Message::name_announce("alice"),
            Message::address_ack("127.0.0.1"),
            Message::chat_line("hello there"),
            Message::join_notice(3, "carol@10.1.1.1"),
            Message::leave_notice("bob@10.1.1.2"),
        ];

        let mut wire = Vec::new();
        for msg in &messages {
            write_message(&mut wire, msg).unwrap();
        }

        let mut reader = Cursor::new(wire);
        for msg in &messages {
            let got = read_message(&mut reader, DEFAULT_MAX_FRAME_SIZE).unwrap();
            assert_eq!(got.as_ref(), Some(msg));
        }
        assert!(read_message(&mut reader, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_read_message_short_reads() {
        let text = "x".repeat(10_000);
        let frame = encode(&Message::chat_line(text.clone())).unwrap();

        for chunk in [1, 3, 7, 4096] {
            let mut reader = Trickle {
                data: frame.to_vec(),
                pos: 0,
                chunk,
            };
            let got = read_message(&mut reader, DEFAULT_MAX_FRAME_SIZE).unwrap();
            assert_eq!(got, Some(Message::chat_line(text.clone())));
        }
    }

    #[test]
    fn test_read_message_truncated_prefix_is_no_message() {
        let mut reader = Cursor::new(vec![0u8, 0]);
        assert!(read_message(&mut reader, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_read_message_truncated_payload_is_error() {
        let frame = encode(&Message::chat_line("cut short")).unwrap();
        let mut reader = Cursor::new(frame[..frame.len() - 2].to_vec());
        match read_message(&mut reader, DEFAULT_MAX_FRAME_SIZE) {
            Err(CodecError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[test]
    fn test_decoder_accumulates_partial_frames() {
        let first = Message::chat_line("first");
        let second = Message::name_announce("second");
        let mut wire = encode(&first).unwrap().to_vec();
        wire.extend_from_slice(&encode(&second).unwrap());

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let mut decoded = Vec::new();

        for (i, chunk) in wire.chunks(5).enumerate() {
            decoder.extend(chunk);
            while let Some(msg) = decoder.next_message().unwrap() {
                decoded.push((i, msg));
            }
        }

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].1, first);
        assert_eq!(decoded[1].1, second);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_waits_for_full_payload() {
        let frame = encode(&Message::chat_line("patience")).unwrap();
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);

        decoder.extend(&frame[..frame.len() - 1]);
        assert!(decoder.next_message().unwrap().is_none());
        assert_eq!(decoder.buffered(), frame.len() - 1);

        decoder.extend(&frame[frame.len() - 1..]);
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::chat_line("patience"))
        );
    }

    #[test]
    fn test_decoder_rejects_oversized_prefix() {
        let mut decoder = FrameDecoder::new(64);
        decoder.extend(&1000u32.to_be_bytes());
        match decoder.next_message() {
            Err(CodecError::FrameTooLarge { size: 1000, max: 64 }) => {}
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decoder_bounds_reservation_for_large_prefix() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&[0x00, 0xFF, 0xFF, 0xFF]);

        assert!(decoder.next_message().unwrap().is_none());
        assert!(decoder.buf.capacity() < 1024 * 1024);

        // Still completes once the whole payload shows up.
        let text = "y".repeat(200 * 1024);
        let frame = encode(&Message::chat_line(text.clone())).unwrap();
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        for chunk in frame.chunks(16 * 1024) {
            decoder.extend(chunk);
            if let Some(msg) = decoder.next_message().unwrap() {
                assert_eq!(msg, Message::chat_line(text.clone()));
                return;
            }
        }
        panic!("frame never completed");
    }

    #[test]
    fn test_decoder_rejects_garbage_payload() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        decoder.extend(&3u32.to_be_bytes());
        decoder.extend(&[0xc1, 0xc1, 0xc1]);
        assert!(matches!(decoder.next_message(), Err(CodecError::Decode(_))));
    }
}
