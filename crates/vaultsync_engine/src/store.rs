//! Local item store.

use crate::error::StoreError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use vaultsync_protocol::{now_millis, ClearMetadata, ItemId, ItemType, RemoteItem, Timestamp, VaultId};

/// Local copy of an item.
///
/// The payload is kept encrypted under the vault key, exactly as the relay
/// stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalItem {
    /// Item id; provisional until the first push is acknowledged.
    pub id: ItemId,
    /// Owning vault.
    pub vault_id: VaultId,
    /// Item kind.
    pub item_type: ItemType,
    /// Ciphertext of the current working copy.
    pub encrypted_payload: Vec<u8>,
    /// Cleartext listing metadata.
    pub clear_metadata: ClearMetadata,
    /// Working-copy version.
    pub version: u64,
    /// Last local or relay change.
    pub updated_at: Timestamp,
    /// Has edits the relay has not acknowledged.
    pub dirty: bool,
    /// Version the relay held when this device last reconciled the item.
    pub synced_version: Option<u64>,
    /// Tombstone: deleted locally, delete not yet acknowledged.
    pub deleted: bool,
}

impl LocalItem {
    /// Creates a new local item (version 0, dirty, provisional id).
    pub fn new_local(
        vault_id: VaultId,
        item_type: ItemType,
        clear_metadata: ClearMetadata,
        encrypted_payload: Vec<u8>,
    ) -> Self {
        Self {
            id: ItemId::provisional(),
            vault_id,
            item_type,
            encrypted_payload,
            clear_metadata,
            version: 0,
            updated_at: now_millis(),
            dirty: true,
            synced_version: None,
            deleted: false,
        }
    }

    /// Creates a clean local copy of a relay record.
    pub fn from_remote(remote: RemoteItem) -> Self {
        Self {
            id: remote.id,
            vault_id: remote.vault_id,
            item_type: remote.item_type,
            encrypted_payload: remote.encrypted_payload,
            clear_metadata: remote.clear_metadata,
            version: remote.version,
            updated_at: remote.updated_at,
            dirty: false,
            synced_version: Some(remote.version),
            deleted: false,
        }
    }

    /// Applies a user edit: one past the synced version, dirty.
    pub fn record_edit(&mut self, encrypted_payload: Vec<u8>, clear_metadata: ClearMetadata) {
        self.encrypted_payload = encrypted_payload;
        self.clear_metadata = clear_metadata;
        self.version = self.synced_version.map_or(0, |v| v + 1);
        self.updated_at = now_millis();
        self.dirty = true;
    }

    /// Turns the item into a tombstone.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.dirty = true;
        self.updated_at = now_millis();
    }

    /// Records a relay acknowledgment.
    pub fn mark_synced(&mut self, version: u64, updated_at: Timestamp) {
        self.version = version;
        self.synced_version = Some(version);
        self.updated_at = updated_at;
        self.dirty = false;
    }
}

/// Key-value item store keyed by item id.
pub trait ItemStore: Send + Sync {
    /// Returns an item.
    fn get(&self, id: &ItemId) -> Result<Option<LocalItem>, StoreError>;

    /// Inserts or replaces an item.
    fn put(&self, item: LocalItem) -> Result<(), StoreError>;

    /// Removes an item.
    fn delete(&self, id: &ItemId) -> Result<(), StoreError>;

    /// Lists the items of a vault, tombstones included.
    fn list(&self, vault_id: &VaultId) -> Result<Vec<LocalItem>, StoreError>;
}

/// An in-memory item store.
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<BTreeMap<ItemId, LocalItem>>,
}

impl MemoryItemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of items, tombstones included.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Returns true if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl ItemStore for MemoryItemStore {
    fn get(&self, id: &ItemId) -> Result<Option<LocalItem>, StoreError> {
        Ok(self.items.read().get(id).cloned())
    }

    fn put(&self, item: LocalItem) -> Result<(), StoreError> {
        self.items.write().insert(item.id.clone(), item);
        Ok(())
    }

    fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        self.items.write().remove(id);
        Ok(())
    }

    fn list(&self, vault_id: &VaultId) -> Result<Vec<LocalItem>, StoreError> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| &item.vault_id == vault_id)
            .cloned()
            .collect())
    }
}
