//! Error types for protocol encoding and routing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or routing protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A request path did not match any endpoint.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// An identifier is not usable on the wire.
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),
}
