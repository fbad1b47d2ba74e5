//! Error types for the sync engine.

use thiserror::Error;
use vaultsync_protocol::{ItemId, ProtocolError, VaultId};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, ChannelError>;

/// Errors raised by the request and notification channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The call did not complete within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The relay rejected the token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// `expectedPreviousVersion` did not match the relay's version.
    #[error("version conflict: relay holds version {current_version}")]
    VersionConflict {
        /// Version the relay holds.
        current_version: u64,
    },

    /// Unknown item or vault.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request or response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The channel is closed.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Transport { retryable, .. } => *retryable,
            ChannelError::Timeout | ChannelError::Closed => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        ChannelError::Protocol(err.to_string())
    }
}

/// Errors raised while establishing a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No token was supplied before `connect`.
    #[error("no auth token supplied")]
    MissingToken,

    /// The relay rejected the token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The handshake or channel open failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A disconnect or vault switch overtook the connect.
    #[error("connect cancelled")]
    Cancelled,
}

impl SessionError {
    /// Returns true for token rejections.
    pub fn is_auth(&self) -> bool {
        matches!(self, SessionError::Auth(_) | SessionError::MissingToken)
    }
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Unauthorized(reason) => SessionError::Auth(reason),
            other => SessionError::Transport(other.to_string()),
        }
    }
}

/// Errors that abort a sync pass.
///
/// Cloneable so a pass result can be handed to every caller sharing it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The relay rejected the token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Not connected.
    #[error("not connected to relay")]
    NotConnected,

    /// The pass was overtaken by a disconnect or vault switch.
    #[error("sync cancelled")]
    Cancelled,

    /// No key is available for the vault.
    #[error("vault key unavailable: {0}")]
    KeyUnavailable(String),

    /// Encrypting a local edit failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The local store failed.
    #[error("store error: {0}")]
    Store(String),

    /// The item is not in the local store.
    #[error("unknown item {0}")]
    UnknownItem(ItemId),

    /// The item has a pending conflict and must be resolved first.
    #[error("item {0} has an unresolved conflict")]
    ItemInConflict(ItemId),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true for token rejections.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<ChannelError> for SyncError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Transport { message, retryable } => {
                SyncError::Transport { message, retryable }
            }
            ChannelError::Timeout => SyncError::Timeout,
            ChannelError::Closed => SyncError::transport_retryable("channel closed"),
            ChannelError::Unauthorized(reason) => SyncError::Auth(reason),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err.to_string())
    }
}

impl From<CryptoError> for SyncError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnknownVault(vault_id) => SyncError::KeyUnavailable(vault_id.to_string()),
            other => SyncError::Crypto(other.to_string()),
        }
    }
}

/// Errors from the encryption gateway and keyring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext was tampered with, truncated or encrypted under another key.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key material has the wrong size.
    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKey {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// No key has been registered for the vault.
    #[error("no key for vault {0}")]
    UnknownVault(VaultId),
}

/// Errors from the local item store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors returned by conflict resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Another resolution for the item is in flight.
    #[error("a resolution for item {0} is already in flight")]
    ConflictBusy(ItemId),

    /// No pending conflict exists for the item.
    #[error("no pending conflict for item {0}")]
    NotFound(ItemId),

    /// The relay moved again; a fresh conflict was raised in place of this one.
    #[error("conflict for item {item_id} superseded by relay version {server_version:?}")]
    Superseded {
        /// Item id.
        item_id: ItemId,
        /// Version the relay now holds, or `None` if it deleted the item.
        server_version: Option<u64>,
    },

    /// Encrypting the resolved content failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Transport, session or store failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        ResolveError::Sync(err.into())
    }
}

impl From<ChannelError> for ResolveError {
    fn from(err: ChannelError) -> Self {
        ResolveError::Sync(err.into())
    }
}

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for the schema.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}
