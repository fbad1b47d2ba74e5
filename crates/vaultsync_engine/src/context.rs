//! Collaborators shared by passes and resolutions.

use crate::config::EngineConfig;
use crate::conflict::ConflictTracker;
use crate::crypto::{CryptoGateway, KeyProvider, VaultKey};
use crate::error::{ChannelError, SyncError, SyncResult, TransportResult};
use crate::events::EventBus;
use crate::session::SessionManager;
use crate::store::ItemStore;
use crate::transport::RequestChannel;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use vaultsync_protocol::{ItemId, VaultId};

pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn ItemStore>,
    pub crypto: Arc<dyn CryptoGateway>,
    pub keys: Arc<dyn KeyProvider>,
    pub requests: Arc<dyn RequestChannel>,
    pub session: SessionManager,
    pub conflicts: ConflictTracker,
    pub events: EventBus,
    /// Provisional ids mapped to the ids the relay assigned.
    pub assigned: RwLock<HashMap<ItemId, ItemId>>,
}

impl EngineContext {
    /// Runs one network call under the request timeout.
    pub async fn call<T, F>(&self, request: F) -> TransportResult<T>
    where
        F: Future<Output = TransportResult<T>>,
    {
        tokio::time::timeout(self.config.timeout, request)
            .await
            .unwrap_or(Err(ChannelError::Timeout))
    }

    /// Fails with `Cancelled` once a disconnect or vault switch has
    /// overtaken `generation`.
    pub fn ensure_current(&self, generation: u64) -> SyncResult<()> {
        if self.session.generation() == generation {
            Ok(())
        } else {
            debug!(generation, "discarding results of a stale generation");
            Err(SyncError::Cancelled)
        }
    }

    /// Records that the relay accepted `provisional` as `id`.
    pub fn assign_id(&self, provisional: ItemId, id: ItemId) {
        self.assigned.write().insert(provisional, id);
    }

    /// Follows a provisional id to its relay id. Other ids map to themselves.
    pub fn current_id(&self, item_id: &ItemId) -> ItemId {
        if !item_id.is_provisional() {
            return item_id.clone();
        }
        self.assigned
            .read()
            .get(item_id)
            .cloned()
            .unwrap_or_else(|| item_id.clone())
    }

    pub fn vault_key(&self, vault_id: &VaultId) -> SyncResult<VaultKey> {
        Ok(self.keys.vault_key(vault_id)?)
    }
}
