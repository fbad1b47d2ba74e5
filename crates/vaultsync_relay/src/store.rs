//! Relay-side item table.
//!
//! Holds the current encrypted record of every live item plus the versions
//! accepted for each id. Every accepted change yields a strictly higher
//! version than the one it replaced.

use crate::error::{RelayError, RelayResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use vaultsync_protocol::{
    now_millis, CreateItemRequest, ItemId, ManifestEntry, RemoteItem, UpdateItemRequest, VaultId,
};

/// Version assigned to a freshly created item.
pub const INITIAL_VERSION: u64 = 1;

#[derive(Debug, Default)]
struct Tables {
    items: HashMap<ItemId, RemoteItem>,
    history: HashMap<ItemId, Vec<u64>>,
}

/// In-memory item table.
#[derive(Debug, Default)]
pub struct ItemTable {
    tables: RwLock<Tables>,
}

impl ItemTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the manifest of a vault, ordered by item id.
    pub fn manifest(&self, vault_id: &VaultId) -> Vec<ManifestEntry> {
        let tables = self.tables.read();
        let mut entries: Vec<ManifestEntry> = tables
            .items
            .values()
            .filter(|item| &item.vault_id == vault_id)
            .map(RemoteItem::manifest_entry)
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Returns an item.
    pub fn get(&self, item_id: &ItemId) -> Option<RemoteItem> {
        self.tables.read().items.get(item_id).cloned()
    }

    /// Stores a new item under a fresh id.
    pub fn create(&self, request: CreateItemRequest) -> RemoteItem {
        let item = RemoteItem {
            id: ItemId::generate(),
            vault_id: request.vault_id,
            item_type: request.item_type,
            encrypted_payload: request.encrypted_payload,
            clear_metadata: request.clear_metadata,
            version: INITIAL_VERSION,
            updated_at: now_millis(),
        };

        let mut tables = self.tables.write();
        tables
            .history
            .entry(item.id.clone())
            .or_default()
            .push(item.version);
        tables.items.insert(item.id.clone(), item.clone());
        item
    }

    /// Replaces an item if `expected_previous_version` matches.
    pub fn update(&self, item_id: &ItemId, request: UpdateItemRequest) -> RelayResult<RemoteItem> {
        let mut tables = self.tables.write();
        let item = tables
            .items
            .get_mut(item_id)
            .ok_or_else(|| RelayError::NotFound(item_id.to_string()))?;

        if item.version != request.expected_previous_version {
            return Err(RelayError::VersionConflict {
                expected: request.expected_previous_version,
                current: item.version,
            });
        }

        item.encrypted_payload = request.encrypted_payload;
        item.clear_metadata = request.clear_metadata;
        item.version += 1;
        item.updated_at = now_millis().max(item.updated_at);
        let updated = item.clone();

        tables
            .history
            .entry(item_id.clone())
            .or_default()
            .push(updated.version);
        Ok(updated)
    }

    /// Removes an item if `expected_previous_version` matches.
    pub fn delete(&self, item_id: &ItemId, expected_previous_version: u64) -> RelayResult<RemoteItem> {
        let mut tables = self.tables.write();
        let current = tables
            .items
            .get(item_id)
            .map(|item| item.version)
            .ok_or_else(|| RelayError::NotFound(item_id.to_string()))?;

        if current != expected_previous_version {
            return Err(RelayError::VersionConflict {
                expected: expected_previous_version,
                current,
            });
        }
        tables
            .items
            .remove(item_id)
            .ok_or_else(|| RelayError::NotFound(item_id.to_string()))
    }

    /// Returns the versions accepted for an item, in acceptance order.
    pub fn accepted_versions(&self, item_id: &ItemId) -> Vec<u64> {
        self.tables
            .read()
            .history
            .get(item_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of live items.
    pub fn len(&self) -> usize {
        self.tables.read().items.len()
    }

    /// Returns true if there are no live items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
