//! Error types for the relay.

use thiserror::Error;
use vaultsync_protocol::{status, ErrorBody, HttpResponse, ProtocolError};

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur in the relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Token missing, invalid, expired or revoked.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Unknown item or endpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// The base version of an update or delete is stale.
    #[error("version conflict: expected {expected}, current {current}")]
    VersionConflict {
        /// Version the client based its change on.
        expected: u64,
        /// Version the relay holds.
        current: u64,
    },

    /// The relay is refusing traffic.
    #[error("relay unavailable")]
    Unavailable,

    /// Internal relay error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidRequest(_)
                | RelayError::NotAuthorized(_)
                | RelayError::NotFound(_)
                | RelayError::VersionConflict { .. }
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, RelayError::Unavailable | RelayError::Internal(_))
    }

    /// Returns true if the token was rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, RelayError::NotAuthorized(_))
    }

    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            RelayError::InvalidRequest(_) => status::BAD_REQUEST,
            RelayError::NotAuthorized(_) => status::UNAUTHORIZED,
            RelayError::NotFound(_) => status::NOT_FOUND,
            RelayError::VersionConflict { .. } => status::CONFLICT,
            RelayError::Unavailable => status::UNAVAILABLE,
            RelayError::Internal(_) => status::INTERNAL_ERROR,
        }
    }

    /// Renders the error as a response.
    pub fn into_response(self) -> HttpResponse {
        let body = match &self {
            RelayError::VersionConflict { expected, current } => {
                ErrorBody::version_conflict(*expected, *current)
            }
            other => ErrorBody::new(other.to_string()),
        };
        HttpResponse::error(self.status(), body)
    }
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownEndpoint(path) => RelayError::NotFound(path),
            other => RelayError::InvalidRequest(other.to_string()),
        }
    }
}
