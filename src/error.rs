//! remux/src/error.rs
//! Crate-wide error type. One variant per error kind named in the design:
//! transport, protocol/codec, auth, routing, resource and drain-timeout errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemuxError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("empty message")]
    EmptyMessage,

    #[error("invalid message type: {0}")]
    InvalidType(u8),

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("message length {got} exceeds max size {max}")]
    MessageLength { got: u32, max: u32 },

    #[error("message type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: u8, got: u8 },

    #[error("failed to encode message: {0}")]
    Marshal(String),

    #[error("failed to decode message: {0}")]
    Unmarshal(String),

    #[error("invalid ack status")]
    InvalidStatus,

    #[error("invalid token")]
    InvalidToken,

    #[error("agent {0} already exists")]
    AgentExists(String),

    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("bridge {0} not found")]
    BridgeNotFound(u64),

    #[error("unsupported mod: {0}")]
    UnsupportedMod(String),

    #[error("{kind} [{name}] is not registered")]
    NotRegistered { kind: &'static str, name: String },

    #[error("{kind} [{name}] is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },

    #[error("missing option: {0}")]
    MissingOption(&'static str),

    #[error("channel closed")]
    ChannelClosed,

    #[error("bridge drain timed out after {0:?}")]
    DrainTimeout(std::time::Duration),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("hook error: {0}")]
    Hook(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("no dialer available")]
    NoDialer,

    #[error("no listener available")]
    NoListener,
}

pub type Result<T> = std::result::Result<T, RemuxError>;
