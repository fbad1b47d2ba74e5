//! One sync pass.
//!
//! A pass runs in three phases:
//! 1. **Plan**: diff the local items against one manifest snapshot and pick
//!    an action per item (pure, no I/O)
//! 2. **Execute**: run the network part of every action, at most
//!    `max_concurrent_requests` at a time, each under the request timeout
//! 3. **Apply**: write the outcomes to the local store one by one, checking
//!    the generation before every write
//!
//! Nothing touches the store until every request of the pass has finished.

use crate::conflict::{local_side, server_side, Conflict, ConflictState, Registration, Tracked};
use crate::context::EngineContext;
use crate::crypto::VaultKey;
use crate::error::{ChannelError, SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::status::{ItemFailure, PassTally};
use crate::store::LocalItem;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vaultsync_protocol::{
    now_millis, CreateItemRequest, CreateItemResponse, DeleteItemRequest, ItemId, ManifestEntry,
    RemoteItem, UpdateItemRequest, UpdateItemResponse, VaultId,
};

/// What a pass decided to do with one item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    /// Push a never-synced item.
    Create(LocalItem),
    /// Push an edit on top of `expected`.
    Update { local: LocalItem, expected: u64 },
    /// Push a tombstone on top of `expected`.
    Delete { local: LocalItem, expected: u64 },
    /// Fetch and adopt the relay record.
    Pull {
        entry: ManifestEntry,
        local: Option<LocalItem>,
    },
    /// Both sides moved; fetch the relay record (if any) and compare.
    Diverged {
        local: LocalItem,
        server: Option<ManifestEntry>,
    },
    /// The relay side of a pending conflict moved.
    Refresh {
        local: LocalItem,
        server: Option<ManifestEntry>,
    },
    /// Drop the local copy without a request.
    Remove { local: LocalItem, counted: bool },
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub actions: Vec<Action>,
    pub failures: Vec<ItemFailure>,
}

/// Decides what to do with every item of a vault.
pub(crate) fn plan(
    local: Vec<LocalItem>,
    manifest: &[ManifestEntry],
    tracked: &HashMap<ItemId, Tracked>,
) -> Plan {
    let mut remote: HashMap<&ItemId, &ManifestEntry> =
        manifest.iter().map(|entry| (&entry.id, entry)).collect();
    let mut plan = Plan::default();

    for item in local {
        let entry = remote.remove(&item.id).cloned();

        if let Some(conflict) = tracked.get(&item.id) {
            let relay_version = entry.as_ref().map(|e| e.version);
            if !conflict.resolving && conflict.server_version != relay_version {
                plan.actions.push(Action::Refresh {
                    local: item,
                    server: entry,
                });
            }
            continue;
        }

        let action = if item.deleted {
            match (item.synced_version, entry) {
                (None, _) | (Some(_), None) => Action::Remove {
                    local: item,
                    counted: false,
                },
                (Some(synced), Some(e)) if e.version == synced => Action::Delete {
                    local: item,
                    expected: synced,
                },
                (Some(synced), Some(e)) if e.version > synced => Action::Diverged {
                    local: item,
                    server: Some(e),
                },
                (Some(synced), Some(e)) => {
                    plan.failures.push(regression(&item.id, e.version, synced));
                    continue;
                }
            }
        } else if item.dirty {
            match (item.synced_version, entry) {
                (None, None) => Action::Create(item),
                // Tracking lost: compare before trusting either side.
                (None, Some(e)) => Action::Diverged {
                    local: item,
                    server: Some(e),
                },
                (Some(_), None) => Action::Diverged {
                    local: item,
                    server: None,
                },
                (Some(synced), Some(e)) if e.version == synced => Action::Update {
                    local: item,
                    expected: synced,
                },
                (Some(synced), Some(e)) if e.version > synced => Action::Diverged {
                    local: item,
                    server: Some(e),
                },
                (Some(synced), Some(e)) => {
                    plan.failures.push(regression(&item.id, e.version, synced));
                    continue;
                }
            }
        } else {
            match (item.synced_version, entry) {
                (None, None) => Action::Create(item),
                (None, Some(e)) => Action::Pull {
                    entry: e,
                    local: Some(item),
                },
                (Some(_), None) => Action::Remove {
                    local: item,
                    counted: true,
                },
                (Some(synced), Some(e)) if e.version > synced => Action::Pull {
                    entry: e,
                    local: Some(item),
                },
                (Some(synced), Some(e)) if e.version == synced => continue,
                (Some(synced), Some(e)) => {
                    plan.failures.push(regression(&item.id, e.version, synced));
                    continue;
                }
            }
        };
        plan.actions.push(action);
    }

    let mut fresh: Vec<&ManifestEntry> = remote.into_values().collect();
    fresh.sort_by(|a, b| a.id.cmp(&b.id));
    for entry in fresh {
        if !tracked.contains_key(&entry.id) {
            plan.actions.push(Action::Pull {
                entry: entry.clone(),
                local: None,
            });
        }
    }

    plan
}

fn regression(item_id: &ItemId, relay: u64, synced: u64) -> ItemFailure {
    ItemFailure::item(
        item_id.clone(),
        format!("relay version {relay} is behind synced version {synced}"),
    )
}

/// Network result of one action.
#[derive(Debug)]
enum Outcome {
    Created {
        local: LocalItem,
        response: CreateItemResponse,
    },
    Updated {
        local: LocalItem,
        response: UpdateItemResponse,
    },
    Deleted {
        local: LocalItem,
    },
    Pulled {
        remote: RemoteItem,
    },
    Diverged {
        local: LocalItem,
        server: Option<RemoteItem>,
    },
    Removed {
        local: LocalItem,
        counted: bool,
    },
    Skipped,
    Failed(ItemFailure),
    Fatal(SyncError),
}

impl Outcome {
    /// True for outcomes the relay has already accepted.
    fn is_committed(&self) -> bool {
        matches!(
            self,
            Outcome::Created { .. } | Outcome::Updated { .. } | Outcome::Deleted { .. }
        )
    }
}

fn failed(item_id: &ItemId, err: ChannelError) -> Outcome {
    let err = SyncError::from(err);
    if err.is_auth() {
        Outcome::Fatal(err)
    } else {
        Outcome::Failed(ItemFailure::item(item_id.clone(), err.to_string()))
    }
}

/// Result of a completed pass.
#[derive(Debug, Default)]
pub(crate) struct PassReport {
    pub tally: PassTally,
    /// Conflicts registered or refreshed by this pass.
    pub conflicts: Vec<Conflict>,
}

/// Runs sync passes against the relay.
pub(crate) struct Reconciler {
    ctx: Arc<EngineContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Runs one pass. Results are discarded once `generation` is stale.
    pub async fn run(&self, vault_id: &VaultId, generation: u64) -> SyncResult<PassReport> {
        let ctx = &self.ctx;
        let token = ctx.session.bearer()?;
        let key = ctx.vault_key(vault_id)?;

        let manifest = ctx
            .call(ctx.requests.fetch_manifest(&token, vault_id))
            .await?;
        ctx.ensure_current(generation)?;

        let local = ctx.store.list(vault_id)?;
        let plan = plan(local, &manifest, &ctx.conflicts.tracked(vault_id));
        debug!(
            %vault_id,
            relay_items = manifest.len(),
            actions = plan.actions.len(),
            "pass planned"
        );

        let mut report = PassReport::default();
        report.tally.failures = plan.failures;

        let outcomes = self.execute_all(&token, plan.actions).await;
        let fatal = outcomes.iter().find_map(|outcome| match outcome {
            Outcome::Fatal(err) => Some(err.clone()),
            _ => None,
        });

        for outcome in outcomes {
            // After a fatal error only record what the relay already committed.
            if fatal.is_some() && !outcome.is_committed() {
                continue;
            }
            ctx.ensure_current(generation)?;
            self.apply(&key, outcome, &mut report)?;
        }
        if let Some(err) = fatal {
            warn!(
                %vault_id,
                recorded = report.tally.items_updated,
                error = %err,
                "pass aborted"
            );
            return Err(err);
        }

        report.tally.items_conflicted = ctx.conflicts.pending_count(vault_id);
        info!(
            %vault_id,
            updated = report.tally.items_updated,
            conflicted = report.tally.items_conflicted,
            failures = report.tally.failures.len(),
            "pass complete"
        );
        Ok(report)
    }

    async fn execute_all(&self, token: &str, actions: Vec<Action>) -> Vec<Outcome> {
        let permits = Arc::new(Semaphore::new(self.ctx.config.max_concurrent_requests.max(1)));
        let mut tasks = JoinSet::new();

        for action in actions {
            let ctx = self.ctx.clone();
            let permits = permits.clone();
            let token = token.to_string();
            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Outcome::Fatal(SyncError::Cancelled),
                };
                execute(&ctx, &token, action).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined.unwrap_or_else(|err| {
                Outcome::Failed(ItemFailure::pass(format!("request task failed: {err}")))
            }));
        }
        outcomes
    }

    fn apply(&self, key: &VaultKey, outcome: Outcome, report: &mut PassReport) -> SyncResult<()> {
        let ctx = &self.ctx;
        match outcome {
            Outcome::Created { local, response } => {
                debug!(provisional = %local.id, id = %response.id, version = response.version, "created");
                let provisional = local.id.clone();
                let vault_id = local.vault_id.clone();
                let mut item = LocalItem {
                    id: response.id.clone(),
                    ..local
                };
                item.mark_synced(response.version, response.updated_at);
                ctx.store.put(item)?;
                if provisional != response.id {
                    ctx.store.delete(&provisional)?;
                    ctx.assign_id(provisional.clone(), response.id.clone());
                    ctx.events.emit(SyncEvent::ItemIdAssigned {
                        vault_id,
                        provisional,
                        id: response.id,
                    });
                }
                report.tally.items_updated += 1;
            }
            Outcome::Updated { mut local, response } => {
                debug!(id = %local.id, version = response.version, "pushed");
                local.mark_synced(response.version, response.updated_at);
                ctx.store.put(local)?;
                report.tally.items_updated += 1;
            }
            Outcome::Deleted { local } => {
                debug!(id = %local.id, "delete acknowledged");
                ctx.store.delete(&local.id)?;
                report.tally.items_updated += 1;
            }
            Outcome::Pulled { remote } => {
                if let Err(err) = ctx.crypto.decrypt(&remote.encrypted_payload, key) {
                    warn!(id = %remote.id, error = %err, "skipping undecryptable item");
                    report
                        .tally
                        .failures
                        .push(ItemFailure::item(remote.id, err.to_string()));
                    return Ok(());
                }
                debug!(id = %remote.id, version = remote.version, "pulled");
                ctx.store.put(LocalItem::from_remote(remote))?;
                report.tally.items_updated += 1;
            }
            Outcome::Diverged { local, server } => self.settle(key, local, server, report)?,
            Outcome::Removed { local, counted } => {
                debug!(id = %local.id, counted, "removed locally");
                ctx.store.delete(&local.id)?;
                if counted {
                    report.tally.items_updated += 1;
                }
            }
            Outcome::Skipped => {}
            Outcome::Failed(failure) => {
                warn!(item_id = ?failure.item_id, message = %failure.message, "item failed");
                report.tally.failures.push(failure);
            }
            Outcome::Fatal(err) => return Err(err),
        }
        Ok(())
    }

    /// Collapses identical sides or registers a conflict. The local copy is
    /// left untouched when a conflict is registered.
    fn settle(
        &self,
        key: &VaultKey,
        local: LocalItem,
        server: Option<RemoteItem>,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        let ctx = &self.ctx;
        let crypto = ctx.crypto.as_ref();

        let local_side = match local_side(crypto, key, &local) {
            Ok(side) => side,
            Err(err) => {
                report.tally.failures.push(ItemFailure::item(
                    local.id,
                    format!("local copy unreadable: {err}"),
                ));
                return Ok(());
            }
        };
        let server_side = match server_side(
            crypto,
            key,
            server.as_ref(),
            local.synced_version.unwrap_or(0),
        ) {
            Ok(side) => side,
            Err(err) => {
                warn!(id = %local.id, error = %err, "skipping undecryptable item");
                report
                    .tally
                    .failures
                    .push(ItemFailure::item(local.id, err.to_string()));
                return Ok(());
            }
        };

        match (&local_side.data, server.as_ref()) {
            (None, None) => {
                debug!(id = %local.id, "deleted on both sides");
                ctx.conflicts.discard(&local.id);
                ctx.store.delete(&local.id)?;
                report.tally.items_updated += 1;
                return Ok(());
            }
            (Some(data), Some(remote))
                if server_side.data.as_deref() == Some(data.as_str())
                    && remote.clear_metadata == local.clear_metadata =>
            {
                debug!(id = %local.id, version = remote.version, "both sides identical, adopting relay version");
                ctx.conflicts.discard(&local.id);
                ctx.store.put(LocalItem::from_remote(remote.clone()))?;
                report.tally.items_updated += 1;
                return Ok(());
            }
            _ => {}
        }

        let conflict = Conflict {
            item_id: local.id.clone(),
            vault_id: local.vault_id.clone(),
            local: local_side,
            server: server_side,
            state: ConflictState::Pending,
            detected_at: now_millis(),
        };
        match ctx.conflicts.register(conflict.clone(), server) {
            Registration::New | Registration::Refreshed => {
                info!(
                    item_id = %conflict.item_id,
                    local_version = conflict.local.version,
                    server_version = conflict.server.version,
                    "conflict registered"
                );
                report.conflicts.push(conflict);
            }
            Registration::Unchanged => {}
        }
        Ok(())
    }
}

async fn execute(ctx: &EngineContext, token: &str, action: Action) -> Outcome {
    match action {
        Action::Create(local) => {
            let request = CreateItemRequest {
                vault_id: local.vault_id.clone(),
                item_type: local.item_type,
                encrypted_payload: local.encrypted_payload.clone(),
                clear_metadata: local.clear_metadata.clone(),
            };
            match ctx.call(ctx.requests.create_item(token, &request)).await {
                Ok(response) => Outcome::Created { local, response },
                Err(err) => failed(&local.id, err),
            }
        }
        Action::Update { local, expected } => {
            let request = UpdateItemRequest {
                encrypted_payload: local.encrypted_payload.clone(),
                clear_metadata: local.clear_metadata.clone(),
                expected_previous_version: expected,
            };
            match ctx
                .call(ctx.requests.update_item(token, &local.id, &request))
                .await
            {
                Ok(response) => Outcome::Updated { local, response },
                Err(ChannelError::VersionConflict { current_version }) => {
                    debug!(id = %local.id, expected, current_version, "push rejected, relay moved");
                    fetch_diverged(ctx, token, local).await
                }
                Err(ChannelError::NotFound(_)) => Outcome::Diverged {
                    local,
                    server: None,
                },
                Err(err) => failed(&local.id, err),
            }
        }
        Action::Delete { local, expected } => {
            let request = DeleteItemRequest {
                expected_previous_version: expected,
            };
            match ctx
                .call(ctx.requests.delete_item(token, &local.id, &request))
                .await
            {
                Ok(()) | Err(ChannelError::NotFound(_)) => Outcome::Deleted { local },
                Err(ChannelError::VersionConflict { .. }) => fetch_diverged(ctx, token, local).await,
                Err(err) => failed(&local.id, err),
            }
        }
        Action::Pull { entry, local } => {
            match ctx.call(ctx.requests.fetch_item(token, &entry.id)).await {
                Ok(remote) => Outcome::Pulled { remote },
                Err(ChannelError::NotFound(_)) => match local {
                    Some(local) => Outcome::Removed {
                        local,
                        counted: true,
                    },
                    None => Outcome::Skipped,
                },
                Err(err) => failed(&entry.id, err),
            }
        }
        Action::Diverged {
            local,
            server: Some(_),
        }
        | Action::Refresh {
            local,
            server: Some(_),
        } => fetch_diverged(ctx, token, local).await,
        Action::Diverged {
            local,
            server: None,
        }
        | Action::Refresh {
            local,
            server: None,
        } => Outcome::Diverged {
            local,
            server: None,
        },
        Action::Remove { local, counted } => Outcome::Removed { local, counted },
    }
}

async fn fetch_diverged(ctx: &EngineContext, token: &str, local: LocalItem) -> Outcome {
    match ctx.call(ctx.requests.fetch_item(token, &local.id)).await {
        Ok(remote) => Outcome::Diverged {
            local,
            server: Some(remote),
        },
        Err(ChannelError::NotFound(_)) => Outcome::Diverged {
            local,
            server: None,
        },
        Err(err) => failed(&local.id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_protocol::{ClearMetadata, ItemType};

    fn item(id: &str, version: u64, synced: Option<u64>, dirty: bool) -> LocalItem {
        LocalItem {
            id: ItemId::new(id),
            vault_id: VaultId::new("v"),
            item_type: ItemType::Login,
            encrypted_payload: vec![1],
            clear_metadata: ClearMetadata::named(id),
            version,
            updated_at: 0,
            dirty,
            synced_version: synced,
            deleted: false,
        }
    }

    fn entry(id: &str, version: u64) -> ManifestEntry {
        ManifestEntry {
            id: ItemId::new(id),
            version,
            updated_at: 0,
        }
    }

    fn kinds(plan: &Plan) -> Vec<&'static str> {
        plan.actions
            .iter()
            .map(|action| match action {
                Action::Create(_) => "create",
                Action::Update { .. } => "update",
                Action::Delete { .. } => "delete",
                Action::Pull { .. } => "pull",
                Action::Diverged { .. } => "diverged",
                Action::Refresh { .. } => "refresh",
                Action::Remove { .. } => "remove",
            })
            .collect()
    }

    #[test]
    fn both_sides_moved_is_divergence() {
        // Local at 2 (dirty), relay at 3, last synced 1.
        let plan = plan(
            vec![item("x", 2, Some(1), true)],
            &[entry("x", 3)],
            &HashMap::new(),
        );
        assert_eq!(plan.actions.len(), 1);
        assert!(matches!(
            &plan.actions[0],
            Action::Diverged { server: Some(e), .. } if e.version == 3
        ));
    }

    #[test]
    fn dirty_item_on_synced_version_is_pushed() {
        let plan = plan(
            vec![item("x", 2, Some(1), true)],
            &[entry("x", 1)],
            &HashMap::new(),
        );
        assert!(matches!(
            &plan.actions[0],
            Action::Update { expected: 1, .. }
        ));
    }

    #[test]
    fn creations_pulls_and_remote_deletes() {
        let mut new_item = item("new", 0, None, true);
        new_item.id = ItemId::provisional();

        let plan = plan(
            vec![
                new_item,
                item("stale", 1, Some(1), false),
                item("gone", 4, Some(4), false),
                item("same", 2, Some(2), false),
            ],
            &[entry("stale", 3), entry("same", 2), entry("remote-only", 1)],
            &HashMap::new(),
        );
        assert_eq!(kinds(&plan), vec!["create", "pull", "remove", "pull"]);
        assert!(matches!(
            &plan.actions[2],
            Action::Remove { counted: true, .. }
        ));
        assert!(matches!(
            &plan.actions[3],
            Action::Pull { local: None, entry } if entry.id == ItemId::new("remote-only")
        ));
    }

    #[test]
    fn tombstones() {
        let mut never_pushed = item("a", 0, None, true);
        never_pushed.deleted = true;
        let mut acked = item("b", 2, Some(2), true);
        acked.deleted = true;
        let mut edited_remotely = item("c", 2, Some(2), true);
        edited_remotely.deleted = true;
        let mut already_gone = item("d", 1, Some(1), true);
        already_gone.deleted = true;

        let plan = plan(
            vec![never_pushed, acked, edited_remotely, already_gone],
            &[entry("b", 2), entry("c", 3)],
            &HashMap::new(),
        );
        assert_eq!(kinds(&plan), vec!["remove", "delete", "diverged", "remove"]);
        assert!(matches!(
            &plan.actions[0],
            Action::Remove { counted: false, .. }
        ));
    }

    #[test]
    fn edit_against_remote_delete_is_divergence() {
        let plan = plan(vec![item("x", 2, Some(1), true)], &[], &HashMap::new());
        assert!(matches!(
            &plan.actions[0],
            Action::Diverged { server: None, .. }
        ));
    }

    #[test]
    fn lost_tracking_compares_before_trusting() {
        let plan = plan(
            vec![item("x", 0, None, true), item("y", 0, None, false)],
            &[entry("x", 5), entry("y", 5)],
            &HashMap::new(),
        );
        assert_eq!(kinds(&plan), vec!["diverged", "pull"]);
    }

    #[test]
    fn pending_conflicts_are_skipped_until_relay_moves() {
        let mut tracked = HashMap::new();
        tracked.insert(
            ItemId::new("x"),
            Tracked {
                server_version: Some(3),
                resolving: false,
            },
        );

        let unchanged = plan(vec![item("x", 2, Some(1), true)], &[entry("x", 3)], &tracked);
        assert!(unchanged.actions.is_empty());

        let moved = plan(vec![item("x", 2, Some(1), true)], &[entry("x", 4)], &tracked);
        assert_eq!(kinds(&moved), vec!["refresh"]);

        tracked.get_mut(&ItemId::new("x")).unwrap().resolving = true;
        let resolving = plan(vec![item("x", 2, Some(1), true)], &[entry("x", 4)], &tracked);
        assert!(resolving.actions.is_empty());
    }

    #[test]
    fn version_regression_is_reported() {
        let plan = plan(
            vec![item("x", 5, Some(5), false)],
            &[entry("x", 2)],
            &HashMap::new(),
        );
        assert!(plan.actions.is_empty());
        assert_eq!(plan.failures.len(), 1);
        assert_eq!(plan.failures[0].item_id, Some(ItemId::new("x")));
    }
}
