//! REST request and response bodies.

use crate::model::{ClearMetadata, DeviceId, ItemId, ItemType, ManifestEntry, Timestamp, VaultId};
use serde::{Deserialize, Serialize};

/// Handshake body for `POST /auth/session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Device presenting the token.
    pub device_id: DeviceId,
    /// Bearer token issued to the device.
    pub token: String,
}

/// Successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    /// Device the token belongs to.
    pub device_id: DeviceId,
    /// When the token stops being accepted.
    pub expires_at: Timestamp,
}

/// Body of `GET /vaults/{id}/manifest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    /// Vault the manifest describes.
    pub vault_id: VaultId,
    /// One entry per live item.
    pub entries: Vec<ManifestEntry>,
}

/// Body of `POST /items`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateItemRequest {
    /// Target vault.
    pub vault_id: VaultId,
    /// Item kind.
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// Opaque ciphertext.
    pub encrypted_payload: Vec<u8>,
    /// Cleartext listing metadata.
    pub clear_metadata: ClearMetadata,
}

/// Relay answer to a create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateItemResponse {
    /// Assigned id.
    pub id: ItemId,
    /// Assigned version.
    pub version: u64,
    /// Commit time.
    pub updated_at: Timestamp,
}

/// Body of `PUT /items/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItemRequest {
    /// Opaque ciphertext.
    pub encrypted_payload: Vec<u8>,
    /// Cleartext listing metadata.
    pub clear_metadata: ClearMetadata,
    /// Version the client believes the relay holds.
    pub expected_previous_version: u64,
}

/// Relay answer to an accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItemResponse {
    /// Item id.
    pub id: ItemId,
    /// New version.
    pub version: u64,
    /// Commit time.
    pub updated_at: Timestamp,
}

/// Body of `DELETE /items/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItemRequest {
    /// Version the client believes the relay holds.
    pub expected_previous_version: u64,
}

/// Error body returned with any non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Version the relay holds, on `409 Conflict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
}

impl ErrorBody {
    /// Creates an error body with a message only.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            current_version: None,
        }
    }

    /// Creates a version-conflict body.
    pub fn version_conflict(expected: u64, current: u64) -> Self {
        Self {
            error: format!("version conflict: expected {expected}, relay holds {current}"),
            current_version: Some(current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_wire_names() {
        let request = UpdateItemRequest {
            encrypted_payload: vec![9],
            clear_metadata: ClearMetadata::named("Mail"),
            expected_previous_version: 3,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["expectedPreviousVersion"], 3);
        assert_eq!(json["encryptedPayload"][0], 9);
    }

    #[test]
    fn conflict_body_carries_version() {
        let body = ErrorBody::version_conflict(1, 2);
        assert_eq!(body.current_version, Some(2));
        assert!(body.error.contains("expected 1"));

        let plain = ErrorBody::new("nope");
        let json = serde_json::to_string(&plain).unwrap();
        assert!(!json.contains("currentVersion"));
    }
}
