//! Item, vault and manifest types.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Returns the current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

const PROVISIONAL_PREFIX: &str = "local-";

/// Identifier of an item.
///
/// The relay assigns ids on first push. Until then a locally created item
/// carries a provisional id that never appears in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Wraps an id received from the relay.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a fresh provisional id for a local creation.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4()))
    }

    /// Creates a fresh relay-side id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns true if the relay has not assigned this id yet.
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the id can be embedded in a request path.
    pub fn validate(&self) -> ProtocolResult<()> {
        validate_segment(&self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultId(String);

impl VaultId {
    /// Wraps a vault id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the id can be embedded in a request path.
    pub fn validate(&self) -> ProtocolResult<()> {
        validate_segment(&self.0)
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_segment(segment: &str) -> ProtocolResult<()> {
    if segment.is_empty() || segment.contains('/') || segment.contains('?') {
        return Err(ProtocolError::InvalidId(segment.to_string()));
    }
    Ok(())
}

/// Stable per-install device identifier.
///
/// Serialized as its hyphenated string form in every encoding, JSON and CBOR alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generates a new random device id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a device id from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0.to_string()
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Uuid::parse_str(&value)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidId(value))
    }
}

/// Kind of secret an item holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    /// Website or application login.
    Login,
    /// Free-form secure note.
    Note,
    /// Payment card.
    Card,
    /// Personal identity record.
    Identity,
}

/// Cleartext subset of an item used for listing and search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearMetadata {
    /// Display name.
    pub name: String,
    /// Username shown in lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Primary URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Favorite flag.
    #[serde(default)]
    pub favorite: bool,
}

impl ClearMetadata {
    /// Creates metadata with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Kind of vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultType {
    /// Owned by a single user.
    Personal,
    /// Shared between users.
    Shared,
    /// Owned by a team.
    Work,
}

/// A named collection of items sharing one symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    /// Vault id.
    pub id: VaultId,
    /// Display name.
    pub name: String,
    /// Vault kind.
    #[serde(rename = "type")]
    pub vault_type: VaultType,
    /// Vault key encrypted under the owning user's or team's key.
    pub encrypted_key: Vec<u8>,
    /// Owning team, for work vaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

/// One row of a vault manifest: identity and version, no ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Item id.
    pub id: ItemId,
    /// Version currently held by the relay.
    pub version: u64,
    /// Last commit time.
    pub updated_at: Timestamp,
}

/// Full encrypted record as stored by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    /// Item id.
    pub id: ItemId,
    /// Owning vault.
    pub vault_id: VaultId,
    /// Item kind.
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// Opaque ciphertext.
    pub encrypted_payload: Vec<u8>,
    /// Cleartext listing metadata.
    pub clear_metadata: ClearMetadata,
    /// Version held by the relay.
    pub version: u64,
    /// Last commit time.
    pub updated_at: Timestamp,
}

impl RemoteItem {
    /// Returns the manifest row for this record.
    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            id: self.id.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// Summary of a committed change, carried by `item-updated` notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemNotice {
    /// Item id.
    pub id: ItemId,
    /// Owning vault.
    pub vault_id: VaultId,
    /// Version after the commit.
    pub version: u64,
    /// Commit time.
    pub updated_at: Timestamp,
    /// True if the commit deleted the item.
    #[serde(default)]
    pub deleted: bool,
    /// Device that made the commit.
    pub origin: DeviceId,
}
