//! Chat messages carried inside frames.
//!
//! Every frame holds exactly one `Message`. The enum is the closed schema
//! of the wire protocol:
//!
//! ```text
//! client -> server   NameAnnounce   (first frame only)
//! server -> client   AddressAck     (reply to NameAnnounce)
//! client -> server   ChatLine       (steady state)
//! server -> client   ChatLine       (relayed, prefixed with sender)
//! server -> client   JoinNotice / LeaveNotice
//! ```

use serde::{Deserialize, Serialize};

/// A single logical chat protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// Handshake: the client's chosen display name.
    NameAnnounce { name: String },
    /// Handshake reply: the client's address as the server sees it.
    AddressAck { address: String },
    /// A line of chat text.
    ChatLine { text: String },
    /// Another client joined the hub.
    JoinNotice {
        /// Connected-client count including the newcomer.
        client_number: u64,
        display_name: String,
    },
    /// Another client left the hub.
    LeaveNotice { display_name: String },
}

impl Message {
    pub fn name_announce(name: impl Into<String>) -> Self {
        Message::NameAnnounce { name: name.into() }
    }

    pub fn address_ack(address: impl Into<String>) -> Self {
        Message::AddressAck {
            address: address.into(),
        }
    }

    pub fn chat_line(text: impl Into<String>) -> Self {
        Message::ChatLine { text: text.into() }
    }

    /// Relayed chat line as delivered to the other clients.
    pub fn relayed(display_name: &str, text: &str) -> Self {
        Message::ChatLine {
            text: format!("#[{display_name}]>>{text}"),
        }
    }

    pub fn join_notice(client_number: u64, display_name: impl Into<String>) -> Self {
        Message::JoinNotice {
            client_number,
            display_name: display_name.into(),
        }
    }

    pub fn leave_notice(display_name: impl Into<String>) -> Self {
        Message::LeaveNotice {
            display_name: display_name.into(),
        }
    }

    /// Render the message as the line a client prints.
    pub fn display_line(&self) -> String {
        match self {
            Message::NameAnnounce { name } => format!("NAME: {name}"),
            Message::AddressAck { address } => format!("CLIENT: {address}"),
            Message::ChatLine { text } => text.clone(),
            Message::JoinNotice {
                client_number,
                display_name,
            } => format!("(Connected: New client {client_number} from {display_name})"),
            Message::LeaveNotice { display_name } => {
                format!("(Now hung up: Client from {display_name})")
            }
        }
    }
}
