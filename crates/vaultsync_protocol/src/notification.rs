//! Frames pushed by the relay on the notification channel.
//!
//! Frames are CBOR-encoded maps tagged by `type`, so a frame reads the same as
//! the JSON form `{"type": "item-updated", "item": {...}}`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{DeviceId, ItemNotice, VaultId};
use serde::{Deserialize, Serialize};

/// A server-to-client notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// The channel is authenticated and subscribed to a vault.
    Subscribed {
        /// Subscribed vault.
        #[serde(rename = "vaultId")]
        vault_id: VaultId,
        /// Device the subscription belongs to.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    /// Another device committed a change to a subscribed vault.
    ItemUpdated {
        /// The committed change.
        item: ItemNotice,
    },
    /// The relay revoked the channel's authentication.
    AuthRevoked {
        /// Reason given by the relay.
        reason: String,
    },
}

impl Notification {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}
