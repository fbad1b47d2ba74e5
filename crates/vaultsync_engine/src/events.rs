//! Consumer-facing engine events.

use crate::conflict::Conflict;
use crate::error::SyncError;
use crate::status::SyncStatus;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;
use vaultsync_protocol::{ItemId, ItemNotice, VaultId};

/// Events emitted by the engine.
///
/// Delivered over a broadcast channel; a subscriber that falls behind loses the
/// oldest events and sees `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass started.
    SyncStart {
        /// Vault being synced.
        vault_id: VaultId,
    },
    /// A pass finished and the status was updated.
    SyncComplete(SyncStatus),
    /// A pass failed.
    SyncError {
        /// Vault being synced.
        vault_id: VaultId,
        /// The failure.
        error: SyncError,
    },
    /// A conflict was registered or refreshed.
    Conflict(Conflict),
    /// The session is authenticated and subscribed.
    Authenticated {
        /// Subscribed vault.
        vault_id: VaultId,
    },
    /// The session dropped to disconnected.
    Disconnected {
        /// Why, if known.
        reason: Option<String>,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Another device committed a change to the subscribed vault.
    RemoteUpdate(ItemNotice),
    /// The relay accepted a local creation under its own id.
    ///
    /// The provisional id keeps working for edits, deletes and reads.
    ItemIdAssigned {
        /// Vault of the item.
        vault_id: VaultId,
        /// Id returned by `create_item`.
        provisional: ItemId,
        /// Id assigned by the relay.
        id: ItemId,
    },
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Emits an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
