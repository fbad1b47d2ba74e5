//! Derived, read-only sync status.

use crate::error::SyncError;
use parking_lot::RwLock;
use serde::Serialize;
use vaultsync_protocol::{now_millis, ItemId, Timestamp, VaultId};

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    /// Item the failure belongs to, or `None` for a pass-level failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    /// Description.
    pub message: String,
    /// When it was recorded.
    pub at: Timestamp,
}

impl ItemFailure {
    /// Creates a failure tied to one item.
    pub fn item(item_id: ItemId, message: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id),
            message: message.into(),
            at: now_millis(),
        }
    }

    /// Creates a pass-level failure.
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            item_id: None,
            message: message.into(),
            at: now_millis(),
        }
    }
}

/// Snapshot of the engine's sync status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Vault the status describes.
    pub vault_id: Option<VaultId>,
    /// A pass is in flight.
    pub is_syncing: bool,
    /// Completion time of the last successful pass.
    pub last_sync: Option<Timestamp>,
    /// Recent failures, oldest first.
    pub errors: Vec<ItemFailure>,
    /// Items pushed, pulled or removed by the last pass.
    pub items_updated: u64,
    /// Conflicts currently unresolved.
    pub items_conflicted: u64,
}

impl SyncStatus {
    /// Returns true if a failure is recorded for the item.
    pub fn has_error_for(&self, item_id: &ItemId) -> bool {
        self.errors
            .iter()
            .any(|failure| failure.item_id.as_ref() == Some(item_id))
    }
}

/// Counters produced by one pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct PassTally {
    pub items_updated: u64,
    pub items_conflicted: u64,
    pub failures: Vec<ItemFailure>,
}

/// Shared status cell, written only at pass boundaries.
#[derive(Debug)]
pub(crate) struct StatusCell {
    status: RwLock<SyncStatus>,
    max_errors: usize,
}

impl StatusCell {
    pub fn new(max_errors: usize) -> Self {
        Self {
            status: RwLock::new(SyncStatus::default()),
            max_errors: max_errors.max(1),
        }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn begin(&self, vault_id: &VaultId) {
        let mut status = self.status.write();
        if status.vault_id.as_ref() != Some(vault_id) {
            *status = SyncStatus {
                vault_id: Some(vault_id.clone()),
                ..SyncStatus::default()
            };
        }
        status.is_syncing = true;
    }

    pub fn complete(&self, tally: PassTally) -> SyncStatus {
        let mut status = self.status.write();
        status.is_syncing = false;
        status.last_sync = Some(now_millis());
        status.items_updated = tally.items_updated;
        status.items_conflicted = tally.items_conflicted;
        self.push_errors(&mut status, tally.failures);
        status.clone()
    }

    pub fn fail(&self, error: &SyncError) -> SyncStatus {
        let mut status = self.status.write();
        status.is_syncing = false;
        status.items_updated = 0;
        if !matches!(error, SyncError::Cancelled) {
            self.push_errors(&mut status, vec![ItemFailure::pass(error.to_string())]);
        }
        status.clone()
    }

    pub fn set_conflicted(&self, count: u64) {
        self.status.write().items_conflicted = count;
    }

    fn push_errors(&self, status: &mut SyncStatus, failures: Vec<ItemFailure>) {
        status.errors.extend(failures);
        let excess = status.errors.len().saturating_sub(self.max_errors);
        status.errors.drain(..excess);
    }
}
