//! Broadcast fan-out.
//!
//! The router picks recipients from the registry, encodes the message once
//! and hands the same frame to every recipient through a [`FrameSink`].
//! Each send is independent: a recipient whose transport fails is reported
//! back in the [`Delivery`] and the fan-out carries on with the rest.

use std::io;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::protocol::{encode, CodecError, Message};
use crate::registry::{ClientId, ClientRegistry};

/// Destination for encoded frames.
pub trait FrameSink {
    /// Queue one frame for delivery to `id`.
    fn send_frame(&mut self, id: ClientId, frame: &Bytes) -> io::Result<()>;
}

/// Outcome of a fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Recipients the frame was handed to.
    pub delivered: usize,
    /// Recipients whose send failed.
    pub failed: Vec<(ClientId, io::Error)>,
}

/// Send `message` to every registered client except `exclude`.
pub fn broadcast<S: FrameSink>(
    registry: &ClientRegistry,
    sink: &mut S,
    exclude: Option<ClientId>,
    message: &Message,
) -> Result<Delivery, CodecError> {
    let frame = encode(message)?;
    let mut delivery = Delivery::default();

    for id in registry.ids() {
        if Some(id) == exclude {
            continue;
        }

        match sink.send_frame(id, &frame) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "Send failed, skipping recipient");
                delivery.failed.push((id, e));
            }
        }
    }

    trace!(
        delivered = delivery.delivered,
        failed = delivery.failed.len(),
        "Broadcast complete"
    );

    Ok(delivery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{read_message, DEFAULT_MAX_FRAME_SIZE};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct RecordingSink {
        frames: HashMap<ClientId, Vec<Bytes>>,
        broken: Vec<ClientId>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&mut self, id: ClientId, frame: &Bytes) -> io::Result<()> {
            if self.broken.contains(&id) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.frames.entry(id).or_default().push(frame.clone());
            Ok(())
        }
    }

    fn registry_of(n: usize) -> ClientRegistry {
        let mut registry = ClientRegistry::new();
        for i in 0..n {
            let addr = SocketAddr::from(([127, 0, 0, 1], 5000 + i as u16));
            registry
                .register(ClientId(i), addr, format!("user{i}"))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let registry = registry_of(4);
        let mut sink = RecordingSink::default();
        let msg = Message::relayed("user1@127.0.0.1", "hello");

        let delivery = broadcast(&registry, &mut sink, Some(ClientId(1)), &msg).unwrap();

        assert_eq!(delivery.delivered, 3);
        assert!(delivery.failed.is_empty());
        assert!(!sink.frames.contains_key(&ClientId(1)));

        for id in [0, 2, 3] {
            let frames = &sink.frames[&ClientId(id)];
            assert_eq!(frames.len(), 1);
            let mut reader = Cursor::new(frames[0].to_vec());
            let got = read_message(&mut reader, DEFAULT_MAX_FRAME_SIZE).unwrap();
            assert_eq!(got, Some(msg.clone()));
        }
    }

    #[test]
    fn test_broadcast_without_exclusion_reaches_everyone() {
        let registry = registry_of(3);
        let mut sink = RecordingSink::default();

        let delivery =
            broadcast(&registry, &mut sink, None, &Message::leave_notice("x@1.2.3.4")).unwrap();

        assert_eq!(delivery.delivered, 3);
        assert_eq!(sink.frames.len(), 3);
    }

    #[test]
    fn test_failed_recipient_does_not_abort_fanout() {
        let registry = registry_of(5);
        let mut sink = RecordingSink {
            broken: vec![ClientId(2)],
            ..Default::default()
        };

        let delivery =
            broadcast(&registry, &mut sink, Some(ClientId(0)), &Message::chat_line("hi")).unwrap();

        assert_eq!(delivery.delivered, 3);
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(delivery.failed[0].0, ClientId(2));
        for id in [1, 3, 4] {
            assert_eq!(sink.frames[&ClientId(id)].len(), 1);
        }
    }

    #[test]
    fn test_broadcast_to_empty_registry() {
        let registry = ClientRegistry::new();
        let mut sink = RecordingSink::default();

        let delivery = broadcast(&registry, &mut sink, None, &Message::chat_line("anyone?")).unwrap();
        assert_eq!(delivery.delivered, 0);
        assert!(sink.frames.is_empty());
    }
}
