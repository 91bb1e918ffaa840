//! Poll token assignment.
//!
//! Client connections use their slab key as the token. The two highest
//! token values are reserved for the listening socket and the control
//! waker; slab keys never grow that large.

use mio::Token;

use crate::registry::ClientId;

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token of the control channel (shutdown waker).
pub const CONTROL_TOKEN: Token = Token(usize::MAX - 1);

/// What a readiness event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Listener,
    Control,
    Client(ClientId),
}

pub fn client_token(id: ClientId) -> Token {
    Token(id.0)
}

pub fn classify(token: Token) -> TokenKind {
    match token {
        LISTENER_TOKEN => TokenKind::Listener,
        CONTROL_TOKEN => TokenKind::Control,
        Token(key) => TokenKind::Client(ClientId(key)),
    }
}
