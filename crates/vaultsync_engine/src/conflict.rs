//! Conflict tracking and resolution.
//!
//! A conflict is registered when both the local copy and the relay moved
//! past the last-known-synced version of an item. The tracker keeps the
//! decrypted sides for display plus the relay's encrypted record, so
//! `KeepServer` can be applied without another round trip.
//!
//! ## Resolution
//!
//! - `KeepLocal` and `Merge` push with `expectedPreviousVersion` set to the
//!   relay version recorded in the conflict, so the relay accepts the push as
//!   a resolution and rejects it if it has moved again.
//! - `KeepServer` adopts the recorded relay record (or removes the item if
//!   the relay deleted it).
//! - A push rejected with a version mismatch replaces the conflict with a
//!   fresh one against the newer relay version.

use crate::context::EngineContext;
use crate::crypto::{CryptoGateway, VaultKey};
use crate::error::{ChannelError, CryptoError, ResolveError};
use crate::events::SyncEvent;
use crate::store::LocalItem;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};
use vaultsync_protocol::{
    now_millis, CreateItemRequest, DeleteItemRequest, ItemId, RemoteItem, Timestamp,
    UpdateItemRequest, VaultId,
};

/// One side of a conflict.
#[derive(Clone, PartialEq, Eq)]
pub struct ConflictSide {
    /// Version of this side.
    pub version: u64,
    /// Last change on this side.
    pub updated_at: Timestamp,
    /// Decrypted payload, or `None` if this side deleted the item.
    pub data: Option<String>,
}

impl ConflictSide {
    /// Returns true if this side deleted the item.
    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }
}

impl fmt::Debug for ConflictSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = match &self.data {
            Some(data) => format!("[REDACTED {} bytes]", data.len()),
            None => "deleted".to_string(),
        };
        f.debug_struct("ConflictSide")
            .field("version", &self.version)
            .field("updated_at", &self.updated_at)
            .field("data", &data)
            .finish()
    }
}

/// Lifecycle of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictState {
    /// Waiting for a resolution.
    Pending,
    /// A resolution is in flight.
    Resolving,
    /// Resolved; no longer tracked.
    Resolved,
}

/// An unresolved divergence between the local copy and the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Item id.
    pub item_id: ItemId,
    /// Owning vault.
    pub vault_id: VaultId,
    /// Local working copy.
    pub local: ConflictSide,
    /// Relay copy.
    pub server: ConflictSide,
    /// Lifecycle state.
    pub state: ConflictState,
    /// When the conflict was (re)registered.
    pub detected_at: Timestamp,
}

/// How to resolve a conflict.
#[derive(Clone, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Push the local side over the relay version.
    KeepLocal,
    /// Adopt the relay version.
    KeepServer,
    /// Push a plaintext merged outside the engine.
    Merge(String),
}

impl fmt::Debug for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::KeepLocal => f.write_str("KeepLocal"),
            ResolutionStrategy::KeepServer => f.write_str("KeepServer"),
            ResolutionStrategy::Merge(_) => f.write_str("Merge([REDACTED])"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ConflictRecord {
    pub conflict: Conflict,
    /// Relay record the conflict was registered against; `None` if deleted.
    pub server_item: Option<RemoteItem>,
}

impl ConflictRecord {
    fn server_version(&self) -> Option<u64> {
        self.server_item.as_ref().map(|item| item.version)
    }
}

/// What a pass needs to know about a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tracked {
    pub server_version: Option<u64>,
    pub resolving: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    New,
    Refreshed,
    Unchanged,
}

/// Accumulates unresolved conflicts.
#[derive(Debug, Default)]
pub struct ConflictTracker {
    records: RwLock<HashMap<ItemId, ConflictRecord>>,
}

impl ConflictTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists all unresolved conflicts, ordered by item id.
    pub fn list(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self
            .records
            .read()
            .values()
            .map(|record| record.conflict.clone())
            .collect();
        conflicts.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        conflicts
    }

    /// Lists the unresolved conflicts of one vault.
    pub fn list_vault(&self, vault_id: &VaultId) -> Vec<Conflict> {
        let mut conflicts = self.list();
        conflicts.retain(|conflict| &conflict.vault_id == vault_id);
        conflicts
    }

    /// Returns the conflict for an item.
    pub fn get(&self, item_id: &ItemId) -> Option<Conflict> {
        self.records
            .read()
            .get(item_id)
            .map(|record| record.conflict.clone())
    }

    /// Returns true if the item has an unresolved conflict.
    pub fn contains(&self, item_id: &ItemId) -> bool {
        self.records.read().contains_key(item_id)
    }

    /// Counts the unresolved conflicts of a vault.
    pub fn pending_count(&self, vault_id: &VaultId) -> u64 {
        self.records
            .read()
            .values()
            .filter(|record| &record.conflict.vault_id == vault_id)
            .count() as u64
    }

    pub(crate) fn tracked(&self, vault_id: &VaultId) -> HashMap<ItemId, Tracked> {
        self.records
            .read()
            .iter()
            .filter(|(_, record)| &record.conflict.vault_id == vault_id)
            .map(|(id, record)| {
                let tracked = Tracked {
                    server_version: record.server_version(),
                    resolving: record.conflict.state == ConflictState::Resolving,
                };
                (id.clone(), tracked)
            })
            .collect()
    }

    /// Registers a conflict found by a pass. An existing pending conflict is
    /// replaced only if the relay side moved.
    pub(crate) fn register(
        &self,
        conflict: Conflict,
        server_item: Option<RemoteItem>,
    ) -> Registration {
        let mut records = self.records.write();
        let record = ConflictRecord {
            conflict,
            server_item,
        };

        match records.get(&record.conflict.item_id) {
            Some(existing) if existing.conflict.state == ConflictState::Resolving => {
                Registration::Unchanged
            }
            Some(existing) if existing.server_version() == record.server_version() => {
                Registration::Unchanged
            }
            Some(_) => {
                records.insert(record.conflict.item_id.clone(), record);
                Registration::Refreshed
            }
            None => {
                records.insert(record.conflict.item_id.clone(), record);
                Registration::New
            }
        }
    }

    /// Replaces a conflict whose resolution was overtaken by the relay.
    pub(crate) fn supersede(&self, conflict: Conflict, server_item: Option<RemoteItem>) {
        self.records.write().insert(
            conflict.item_id.clone(),
            ConflictRecord {
                conflict,
                server_item,
            },
        );
    }

    /// Drops a pending conflict whose sides turned out identical.
    pub(crate) fn discard(&self, item_id: &ItemId) {
        let mut records = self.records.write();
        if records
            .get(item_id)
            .is_some_and(|record| record.conflict.state == ConflictState::Pending)
        {
            records.remove(item_id);
        }
    }

    /// Claims a conflict for resolution.
    pub(crate) fn begin(&self, item_id: &ItemId) -> Result<ConflictRecord, ResolveError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(item_id)
            .ok_or_else(|| ResolveError::NotFound(item_id.clone()))?;

        if record.conflict.state == ConflictState::Resolving {
            return Err(ResolveError::ConflictBusy(item_id.clone()));
        }
        record.conflict.state = ConflictState::Resolving;
        Ok(record.clone())
    }

    /// Returns a claimed conflict to pending after a failed resolution.
    pub(crate) fn release(&self, item_id: &ItemId) {
        if let Some(record) = self.records.write().get_mut(item_id) {
            record.conflict.state = ConflictState::Pending;
        }
    }

    /// Marks a conflict resolved and stops tracking it.
    pub(crate) fn finish(&self, item_id: &ItemId) -> Option<Conflict> {
        self.records.write().remove(item_id).map(|record| {
            let mut conflict = record.conflict;
            conflict.state = ConflictState::Resolved;
            conflict
        })
    }
}

/// Decrypts the local side of a would-be conflict.
pub(crate) fn local_side(
    crypto: &dyn CryptoGateway,
    key: &VaultKey,
    local: &LocalItem,
) -> Result<ConflictSide, CryptoError> {
    let data = if local.deleted {
        None
    } else {
        Some(crypto.decrypt(&local.encrypted_payload, key)?)
    };
    Ok(ConflictSide {
        version: local.version,
        updated_at: local.updated_at,
        data,
    })
}

/// Decrypts the relay side; a deleted item keeps the last version this
/// device knew.
pub(crate) fn server_side(
    crypto: &dyn CryptoGateway,
    key: &VaultKey,
    server: Option<&RemoteItem>,
    last_known: u64,
) -> Result<ConflictSide, CryptoError> {
    match server {
        Some(item) => Ok(ConflictSide {
            version: item.version,
            updated_at: item.updated_at,
            data: Some(crypto.decrypt(&item.encrypted_payload, key)?),
        }),
        None => Ok(ConflictSide {
            version: last_known,
            updated_at: now_millis(),
            data: None,
        }),
    }
}

/// Applies a strategy to a claimed conflict. The caller holds the vault lock.
pub(crate) async fn apply_resolution(
    ctx: &EngineContext,
    record: &ConflictRecord,
    strategy: ResolutionStrategy,
    generation: u64,
) -> Result<(), ResolveError> {
    let item_id = &record.conflict.item_id;

    match strategy {
        ResolutionStrategy::KeepServer => {
            ctx.ensure_current(generation)?;
            match &record.server_item {
                Some(item) => ctx.store.put(LocalItem::from_remote(item.clone()))?,
                None => ctx.store.delete(item_id)?,
            }
            info!(%item_id, "conflict resolved with the relay version");
            Ok(())
        }
        ResolutionStrategy::KeepLocal => match record.conflict.local.data.clone() {
            Some(plaintext) => push_content(ctx, record, &plaintext, generation).await,
            None => push_deletion(ctx, record, generation).await,
        },
        ResolutionStrategy::Merge(plaintext) => {
            push_content(ctx, record, &plaintext, generation).await
        }
    }
}

async fn push_content(
    ctx: &EngineContext,
    record: &ConflictRecord,
    plaintext: &str,
    generation: u64,
) -> Result<(), ResolveError> {
    let conflict = &record.conflict;
    let token = ctx.session.bearer()?;
    let key = ctx.vault_key(&conflict.vault_id)?;
    let local = ctx.store.get(&conflict.item_id)?;

    let (item_type, clear_metadata) = match (local.as_ref(), record.server_item.as_ref()) {
        (Some(local), _) if !local.deleted => (local.item_type, local.clear_metadata.clone()),
        (_, Some(server)) => (server.item_type, server.clear_metadata.clone()),
        (Some(local), None) => (local.item_type, local.clear_metadata.clone()),
        (None, None) => return Err(ResolveError::NotFound(conflict.item_id.clone())),
    };
    let encrypted_payload = ctx.crypto.encrypt(plaintext, &key)?;

    let Some(server) = &record.server_item else {
        // The relay deleted the item; push the content as a new item.
        let request = CreateItemRequest {
            vault_id: conflict.vault_id.clone(),
            item_type,
            encrypted_payload: encrypted_payload.clone(),
            clear_metadata: clear_metadata.clone(),
        };
        let response = ctx.call(ctx.requests.create_item(&token, &request)).await?;
        ctx.ensure_current(generation)?;

        ctx.store.delete(&conflict.item_id)?;
        ctx.store.put(LocalItem {
            id: response.id.clone(),
            vault_id: conflict.vault_id.clone(),
            item_type,
            encrypted_payload,
            clear_metadata,
            version: response.version,
            updated_at: response.updated_at,
            dirty: false,
            synced_version: Some(response.version),
            deleted: false,
        })?;
        info!(item_id = %conflict.item_id, new_id = %response.id, "conflict resolved by re-creating the item");
        return Ok(());
    };

    let request = UpdateItemRequest {
        encrypted_payload: encrypted_payload.clone(),
        clear_metadata: clear_metadata.clone(),
        expected_previous_version: server.version,
    };
    match ctx
        .call(ctx.requests.update_item(&token, &conflict.item_id, &request))
        .await
    {
        Ok(response) => {
            ctx.ensure_current(generation)?;
            ctx.store.put(LocalItem {
                id: conflict.item_id.clone(),
                vault_id: conflict.vault_id.clone(),
                item_type,
                encrypted_payload,
                clear_metadata,
                version: response.version,
                updated_at: response.updated_at,
                dirty: false,
                synced_version: Some(response.version),
                deleted: false,
            })?;
            info!(item_id = %conflict.item_id, version = response.version, "conflict resolved by push");
            Ok(())
        }
        Err(ChannelError::VersionConflict { .. }) | Err(ChannelError::NotFound(_)) => {
            Err(supersede(ctx, record, &token, &key, generation).await)
        }
        Err(err) => Err(err.into()),
    }
}

async fn push_deletion(
    ctx: &EngineContext,
    record: &ConflictRecord,
    generation: u64,
) -> Result<(), ResolveError> {
    let item_id = &record.conflict.item_id;

    if let Some(server) = &record.server_item {
        let token = ctx.session.bearer()?;
        let request = DeleteItemRequest {
            expected_previous_version: server.version,
        };
        match ctx
            .call(ctx.requests.delete_item(&token, item_id, &request))
            .await
        {
            Ok(()) | Err(ChannelError::NotFound(_)) => {}
            Err(ChannelError::VersionConflict { .. }) => {
                let key = ctx.vault_key(&record.conflict.vault_id)?;
                return Err(supersede(ctx, record, &token, &key, generation).await);
            }
            Err(err) => return Err(err.into()),
        }
    }

    ctx.ensure_current(generation)?;
    ctx.store.delete(item_id)?;
    info!(%item_id, "conflict resolved by deleting the item");
    Ok(())
}

/// Re-raises a conflict against the relay's current record.
async fn supersede(
    ctx: &EngineContext,
    record: &ConflictRecord,
    token: &str,
    key: &VaultKey,
    generation: u64,
) -> ResolveError {
    let conflict = &record.conflict;
    let fresh = match ctx
        .call(ctx.requests.fetch_item(token, &conflict.item_id))
        .await
    {
        Ok(item) => Some(item),
        Err(ChannelError::NotFound(_)) => None,
        Err(err) => return err.into(),
    };
    if let Err(err) = ctx.ensure_current(generation) {
        return err.into();
    }

    let server = match server_side(
        ctx.crypto.as_ref(),
        key,
        fresh.as_ref(),
        conflict.server.version,
    ) {
        Ok(side) => side,
        Err(err) => return err.into(),
    };
    let server_version = fresh.as_ref().map(|item| item.version);
    let refreshed = Conflict {
        server,
        state: ConflictState::Pending,
        detected_at: now_millis(),
        ..conflict.clone()
    };

    warn!(item_id = %conflict.item_id, ?server_version, "resolution superseded by a newer relay version");
    ctx.conflicts.supersede(refreshed.clone(), fresh);
    ctx.events.emit(SyncEvent::Conflict(refreshed));

    ResolveError::Superseded {
        item_id: conflict.item_id.clone(),
        server_version,
    }
}
