//! Logical REST surface: request envelopes, status codes and endpoint routing.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::ErrorBody;
use crate::model::{ItemId, VaultId};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// HTTP status codes used by the relay.
pub mod status {
    /// Success with a body.
    pub const OK: u16 = 200;
    /// Resource created.
    pub const CREATED: u16 = 201;
    /// Success without a body.
    pub const NO_CONTENT: u16 = 204;
    /// Malformed request.
    pub const BAD_REQUEST: u16 = 400;
    /// Missing or rejected token.
    pub const UNAUTHORIZED: u16 = 401;
    /// Unknown item or vault.
    pub const NOT_FOUND: u16 = 404;
    /// Stale `expectedPreviousVersion`.
    pub const CONFLICT: u16 = 409;
    /// Relay failure.
    pub const INTERNAL_ERROR: u16 = 500;
    /// Relay temporarily unavailable.
    pub const UNAVAILABLE: u16 = 503;
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

/// A request on the request channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Path relative to the API root, starting with `/`.
    pub path: String,
    /// Bearer token, if authenticated.
    pub bearer: Option<String>,
    /// JSON body (empty for GET).
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a request without a body.
    pub fn new(method: Method, endpoint: &Endpoint) -> Self {
        Self {
            method,
            path: endpoint.path(),
            bearer: None,
            body: Vec::new(),
        }
    }

    /// Attaches a bearer token.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Attaches a JSON body.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> ProtocolResult<Self> {
        self.body = encode_body(body)?;
        Ok(self)
    }
}

/// A response on the request channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// JSON body (may be empty).
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a JSON response.
    pub fn json<T: Serialize>(status: u16, body: &T) -> Self {
        match encode_body(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(status::INTERNAL_ERROR, ErrorBody::new(e.to_string())),
        }
    }

    /// Creates an empty response.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// Creates an error response.
    pub fn error(status: u16, body: ErrorBody) -> Self {
        let body = serde_json::to_vec(&body).unwrap_or_default();
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the error body, falling back to the raw text.
    pub fn error_body(&self) -> ErrorBody {
        decode_body(&self.body)
            .unwrap_or_else(|_| ErrorBody::new(String::from_utf8_lossy(&self.body).into_owned()))
    }
}

/// Encodes a JSON body.
pub fn encode_body<T: Serialize>(body: &T) -> ProtocolResult<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decodes a JSON body.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// The relay endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `/auth/session`
    Authenticate,
    /// `/vaults/{id}/manifest`
    Manifest(VaultId),
    /// `/items`
    Items,
    /// `/items/{id}`
    Item(ItemId),
}

impl Endpoint {
    /// Renders the endpoint path.
    pub fn path(&self) -> String {
        match self {
            Endpoint::Authenticate => "/auth/session".to_string(),
            Endpoint::Manifest(vault_id) => format!("/vaults/{vault_id}/manifest"),
            Endpoint::Items => "/items".to_string(),
            Endpoint::Item(item_id) => format!("/items/{item_id}"),
        }
    }

    /// Parses a request path. A leading API prefix (`/api/v1/...`) is
    /// tolerated as long as the endpoint part is recognizable.
    pub fn parse(path: &str) -> ProtocolResult<Self> {
        let path = path.split('?').next().unwrap_or(path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let endpoint = match segments.as_slice() {
            [.., "auth", "session"] => Some(Endpoint::Authenticate),
            [.., "vaults", id, "manifest"] => Some(Endpoint::Manifest(VaultId::new(*id))),
            [.., "items", id] => Some(Endpoint::Item(ItemId::new(*id))),
            [.., "items"] => Some(Endpoint::Items),
            _ => None,
        };

        endpoint.ok_or_else(|| ProtocolError::UnknownEndpoint(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeleteItemRequest;

    #[test]
    fn endpoint_paths() {
        assert_eq!(Endpoint::Authenticate.path(), "/auth/session");
        assert_eq!(
            Endpoint::Manifest(VaultId::new("v1")).path(),
            "/vaults/v1/manifest"
        );
        assert_eq!(Endpoint::Items.path(), "/items");
        assert_eq!(Endpoint::Item(ItemId::new("x")).path(), "/items/x");
    }

    #[test]
    fn parse_tolerates_prefix_and_query() {
        assert_eq!(
            Endpoint::parse("https://relay.example.com/api/v1/items/abc?x=1").unwrap(),
            Endpoint::Item(ItemId::new("abc"))
        );
        assert_eq!(
            Endpoint::parse("/api/vaults/home/manifest").unwrap(),
            Endpoint::Manifest(VaultId::new("home"))
        );
        assert!(Endpoint::parse("/nothing/here").is_err());
    }

    #[test]
    fn request_builder() {
        let request = HttpRequest::new(Method::Delete, &Endpoint::Item(ItemId::new("a")))
            .with_bearer("tok")
            .with_json(&DeleteItemRequest {
                expected_previous_version: 2,
            })
            .unwrap();

        assert_eq!(request.path, "/items/a");
        assert_eq!(request.bearer.as_deref(), Some("tok"));
        let body: DeleteItemRequest = decode_body(&request.body).unwrap();
        assert_eq!(body.expected_previous_version, 2);
    }

    #[test]
    fn error_body_fallback() {
        let response = HttpResponse {
            status: status::INTERNAL_ERROR,
            body: b"plain failure".to_vec(),
        };
        assert!(!response.is_success());
        assert_eq!(response.error_body().error, "plain failure");

        let conflict = HttpResponse::error(status::CONFLICT, ErrorBody::version_conflict(1, 5));
        assert_eq!(conflict.error_body().current_version, Some(5));
    }
}
