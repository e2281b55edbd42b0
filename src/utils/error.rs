//! Error types shared across the gateway.
//!
//! Framing problems are split into recoverable conditions (the stream can be
//! resynchronized and the connection kept) and fatal ones. Startup problems
//! surface as `GatewayError` and end the process.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid frame magic number {0:#018x}")]
    BadMagic(u64),

    #[error("declared frame size {size} exceeds maximum {max}")]
    Oversized { size: u64, max: usize },

    #[error("footer id {footer:#x} does not match header id {header:#x}")]
    IdMismatch { header: u64, footer: u64 },

    #[error("frame hash mismatch")]
    HashMismatch,

    #[error("could not decompress payload: {0}")]
    Decompress(io::Error),

    #[error("could not decode payload: {0}")]
    Deserialize(bincode::Error),

    #[error("could not encode message: {0}")]
    Serialize(bincode::Error),

    #[error("could not compress payload: {0}")]
    Compress(io::Error),

    #[error("encoded frame of {0} bytes is too large")]
    TooLarge(usize),

    #[error("connection closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the offending bytes were discarded and reading may continue
    /// on the same stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::BadMagic(_)
                | CodecError::Oversized { .. }
                | CodecError::IdMismatch { .. }
                | CodecError::HashMismatch
                | CodecError::Decompress(_)
                | CodecError::Deserialize(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("backlog store error: {0}")]
    Store(#[from] sled::Error),

    #[error("could not encode backlog record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid site definition '{def}': {reason}")]
    SiteDef { def: String, reason: String },

    #[error("invalid route url '{0}'")]
    RouteUrl(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("could not bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is shut down")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("delivery failed with status {0:?}")]
    Delivery(crate::broker::message::DeliveryStatus),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("not connected")]
    Disconnected,

    #[error("expected ACK for frame {expected:#x}, got frame {got:#x} with status {status:?}")]
    UnexpectedReply {
        expected: u64,
        got: u64,
        status: crate::broker::message::Status,
    },

    #[error("no ACK within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
