//! Chat wire protocol.
//!
//! - `message`: the closed set of messages exchanged with clients
//! - `codec`: length-prefixed framing (blocking reader and incremental decoder)

pub mod codec;
pub mod message;

pub use codec::{encode, read_message, write_message, CodecError, FrameDecoder};
pub use message::Message;
