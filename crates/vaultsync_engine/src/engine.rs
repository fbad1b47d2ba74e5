//! The engine facade.
//!
//! [`VaultSync`] wires the session, reconciler, conflict tracker and scheduler
//! together and enforces the concurrency rules between them:
//! - one pass per vault at a time; callers arriving mid-pass share its result
//! - passes, resolutions and local edits on a vault take the same lock
//! - `item-updated` notices that arrive mid-pass are held back and replayed
//!   once the pass has finished

use crate::config::{EngineConfig, RetryConfig};
use crate::conflict::{apply_resolution, Conflict, ConflictTracker, ResolutionStrategy};
use crate::context::EngineContext;
use crate::crypto::{CryptoGateway, KeyProvider};
use crate::error::{ConfigError, ResolveError, SessionError, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::reconciler::Reconciler;
use crate::scheduler::{Scheduler, SyncTrigger};
use crate::session::{ConnectionState, SessionManager};
use crate::status::{StatusCell, SyncStatus};
use crate::store::{ItemStore, LocalItem};
use crate::transport::{NotificationChannel, RequestChannel};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use vaultsync_protocol::{ClearMetadata, DeviceId, ItemId, ItemNotice, ItemType, VaultId};

/// External capabilities the engine runs on.
#[derive(Clone)]
pub struct Collaborators {
    /// Local item store.
    pub store: Arc<dyn ItemStore>,
    /// Encryption gateway.
    pub crypto: Arc<dyn CryptoGateway>,
    /// Per-vault key lookup.
    pub keys: Arc<dyn KeyProvider>,
    /// Request channel to the relay.
    pub requests: Arc<dyn RequestChannel>,
    /// Notification channel from the relay.
    pub notifications: Arc<dyn NotificationChannel>,
}

type Flight = watch::Receiver<Option<SyncResult<SyncStatus>>>;

#[derive(Default)]
struct Flights {
    running: HashMap<VaultId, Flight>,
    buffered: Vec<ItemNotice>,
    /// Vaults edited locally while their pass was already running.
    rerun: HashSet<VaultId>,
}

/// Sync engine for one device. Cheap to clone.
#[derive(Clone)]
pub struct VaultSync {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    reconciler: Reconciler,
    scheduler: Scheduler,
    status: StatusCell,
    flights: Mutex<Flights>,
    vault_locks: Mutex<HashMap<VaultId, Arc<tokio::sync::Mutex<()>>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl VaultSync {
    /// Creates an engine.
    ///
    /// Must be called from within a tokio runtime: the engine spawns its
    /// notice dispatcher and lifecycle tasks here.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let events = EventBus::default();
        let (session, updates) = SessionManager::new(
            &config,
            collaborators.requests.clone(),
            collaborators.notifications,
            events.clone(),
        );
        let lifecycle = events.subscribe();
        let status = StatusCell::new(config.max_recent_errors);

        let ctx = Arc::new(EngineContext {
            config,
            store: collaborators.store,
            crypto: collaborators.crypto,
            keys: collaborators.keys,
            requests: collaborators.requests,
            session,
            conflicts: ConflictTracker::new(),
            events,
            assigned: RwLock::new(HashMap::new()),
        });
        let inner = Arc::new(EngineInner {
            reconciler: Reconciler::new(ctx.clone()),
            ctx,
            scheduler: Scheduler::new(),
            status,
            flights: Mutex::new(Flights::default()),
            vault_locks: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        *inner.background.lock() = vec![
            EngineInner::spawn_dispatcher(weak.clone(), updates),
            EngineInner::spawn_lifecycle(weak, lifecycle),
        ];

        info!(device_id = %inner.ctx.session.device_id(), "engine created");
        Ok(Self { inner })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.ctx.config
    }

    /// Returns this device's id.
    pub fn device_id(&self) -> DeviceId {
        self.inner.ctx.session.device_id()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.ctx.events.subscribe()
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Supplies the device token for the next handshake.
    pub fn set_token(&self, token: impl Into<String>) {
        self.inner.ctx.session.set_token(token);
    }

    /// Authenticates and subscribes to a vault.
    ///
    /// With auto-sync enabled the scheduler starts and a first pass runs once
    /// the session is authenticated.
    pub async fn connect(&self, vault_id: VaultId) -> Result<(), SessionError> {
        self.inner.ctx.session.connect(vault_id).await
    }

    /// Closes the session, stops the scheduler and cancels in-flight passes.
    pub async fn disconnect(&self) {
        self.inner.scheduler.stop();
        self.inner.ctx.session.disconnect().await;
        let mut flights = self.inner.flights.lock();
        flights.buffered.clear();
        flights.rerun.clear();
    }

    /// Moves the session to another vault.
    ///
    /// In-flight passes are cancelled and held-back notices for other vaults
    /// are dropped. The scheduler restarts once the new subscription is
    /// authenticated.
    pub async fn switch_vault(&self, vault_id: VaultId) -> Result<(), SessionError> {
        self.inner.scheduler.stop();
        self.inner
            .flights
            .lock()
            .buffered
            .retain(|notice| notice.vault_id == vault_id);
        self.inner.ctx.session.switch_vault(vault_id).await
    }

    /// Returns the connection state.
    pub fn session_state(&self) -> ConnectionState {
        self.inner.ctx.session.state()
    }

    /// Returns the subscribed vault.
    pub fn vault_id(&self) -> Option<VaultId> {
        self.inner.ctx.session.vault_id()
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Runs a pass for `vault_id`, or waits for the one already in flight.
    ///
    /// Never retries; see [`VaultSync::sync_with_retry`].
    pub async fn sync_vault(&self, vault_id: &VaultId) -> SyncResult<SyncStatus> {
        let (flight, _) = self.inner.launch(vault_id.clone(), RetryConfig::no_retry());
        wait_for(flight).await
    }

    /// Like [`VaultSync::sync_vault`], retrying retryable failures with the
    /// configured backoff.
    pub async fn sync_with_retry(&self, vault_id: &VaultId) -> SyncResult<SyncStatus> {
        let retry = self.inner.ctx.config.retry.clone();
        let (flight, _) = self.inner.launch(vault_id.clone(), retry);
        wait_for(flight).await
    }

    /// Starts a pass for the subscribed vault in the background.
    ///
    /// A no-op (returning false) while a pass is in flight or the session is
    /// not authenticated.
    pub fn trigger_now(&self) -> bool {
        self.inner.trigger_now()
    }

    /// Starts periodic passes, regardless of the auto-sync setting.
    pub fn start(&self, interval: Duration) {
        self.inner.start_scheduler(interval);
    }

    /// Stops periodic passes.
    pub fn stop(&self) {
        self.inner.scheduler.stop();
    }

    /// Returns true while periodic passes are scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.snapshot()
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Returns the conflict tracker.
    pub fn conflict_tracker(&self) -> &ConflictTracker {
        &self.inner.ctx.conflicts
    }

    /// Lists unresolved conflicts.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.inner.ctx.conflicts.list()
    }

    /// Resolves a conflict.
    ///
    /// Fails with `ConflictBusy` while another resolution of the same item is
    /// running, without touching any state. Fails with `Superseded` if the
    /// relay moved again; the conflict is then pending again with the fresh
    /// relay side.
    pub async fn resolve(
        &self,
        item_id: &ItemId,
        strategy: ResolutionStrategy,
    ) -> Result<(), ResolveError> {
        let ctx = &self.inner.ctx;
        let generation = ctx.session.generation();
        let record = ctx.conflicts.begin(item_id)?;
        let vault_id = record.conflict.vault_id.clone();
        debug!(%item_id, ?strategy, "resolving conflict");

        let lock = self.inner.vault_lock(&vault_id);
        let result = {
            let _guard = lock.lock().await;
            apply_resolution(ctx, &record, strategy, generation).await
        };

        match &result {
            Ok(()) => {
                ctx.conflicts.finish(item_id);
            }
            Err(ResolveError::Superseded { .. }) => {}
            Err(err) => {
                warn!(%item_id, error = %err, "resolution failed");
                ctx.conflicts.release(item_id);
            }
        }
        self.inner
            .status
            .set_conflicted(ctx.conflicts.pending_count(&vault_id));
        result
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    /// Creates an item locally and returns its provisional id.
    ///
    /// The relay assigns the permanent id on the next pass and
    /// [`SyncEvent::ItemIdAssigned`] reports it. The provisional id stays
    /// valid for this engine's edits, deletes and reads.
    pub async fn create_item(
        &self,
        vault_id: &VaultId,
        item_type: ItemType,
        clear_metadata: ClearMetadata,
        plaintext: &str,
    ) -> SyncResult<ItemId> {
        let ctx = &self.inner.ctx;
        let key = ctx.vault_key(vault_id)?;
        let payload = ctx.crypto.encrypt(plaintext, &key)?;
        let item = LocalItem::new_local(vault_id.clone(), item_type, clear_metadata, payload);
        let item_id = item.id.clone();

        {
            let lock = self.inner.vault_lock(vault_id);
            let _guard = lock.lock().await;
            ctx.store.put(item)?;
        }
        debug!(%item_id, %vault_id, "item created locally");
        self.inner.after_local_change(vault_id);
        Ok(item_id)
    }

    /// Replaces an item's content. Rejected while the item is in conflict.
    pub async fn edit_item(
        &self,
        item_id: &ItemId,
        clear_metadata: ClearMetadata,
        plaintext: &str,
    ) -> SyncResult<()> {
        let ctx = &self.inner.ctx;
        let vault_id = self.live_item(item_id)?.vault_id;
        let key = ctx.vault_key(&vault_id)?;
        let payload = ctx.crypto.encrypt(plaintext, &key)?;

        {
            let lock = self.inner.vault_lock(&vault_id);
            let _guard = lock.lock().await;
            let mut item = self.live_item(item_id)?;
            item.record_edit(payload, clear_metadata);
            debug!(%item_id, version = item.version, "item edited locally");
            ctx.store.put(item)?;
        }
        self.inner.after_local_change(&vault_id);
        Ok(())
    }

    /// Deletes an item.
    ///
    /// Never-pushed items disappear immediately; anything else becomes a
    /// tombstone until the relay acknowledges the delete.
    pub async fn delete_item(&self, item_id: &ItemId) -> SyncResult<()> {
        let ctx = &self.inner.ctx;
        let vault_id = self.live_item(item_id)?.vault_id;

        {
            let lock = self.inner.vault_lock(&vault_id);
            let _guard = lock.lock().await;
            let mut item = self.live_item(item_id)?;
            if item.synced_version.is_none() {
                debug!(%item_id, "dropping never-synced item");
                ctx.store.delete(&item.id)?;
                return Ok(());
            }
            item.mark_deleted();
            debug!(%item_id, "item tombstoned");
            ctx.store.put(item)?;
        }
        self.inner.after_local_change(&vault_id);
        Ok(())
    }

    /// Lists the live (non-deleted) local items of a vault.
    pub fn items(&self, vault_id: &VaultId) -> SyncResult<Vec<LocalItem>> {
        let mut items = self.inner.ctx.store.list(vault_id)?;
        items.retain(|item| !item.deleted);
        Ok(items)
    }

    /// Returns the relay id for an id returned by [`VaultSync::create_item`],
    /// once the relay has accepted the item. Other ids are returned unchanged.
    pub fn current_id(&self, item_id: &ItemId) -> ItemId {
        self.inner.ctx.current_id(item_id)
    }

    /// Decrypts an item's local payload.
    pub fn read_plaintext(&self, item_id: &ItemId) -> SyncResult<String> {
        let ctx = &self.inner.ctx;
        let item = ctx
            .store
            .get(&ctx.current_id(item_id))?
            .filter(|item| !item.deleted)
            .ok_or_else(|| SyncError::UnknownItem(item_id.clone()))?;
        let key = ctx.vault_key(&item.vault_id)?;
        Ok(ctx.crypto.decrypt(&item.encrypted_payload, &key)?)
    }

    /// Looks up a live item, following provisional ids the relay has
    /// replaced since they were handed out.
    fn live_item(&self, item_id: &ItemId) -> SyncResult<LocalItem> {
        let ctx = &self.inner.ctx;
        let current = ctx.current_id(item_id);
        if ctx.conflicts.contains(&current) {
            return Err(SyncError::ItemInConflict(item_id.clone()));
        }
        ctx.store
            .get(&current)?
            .filter(|item| !item.deleted)
            .ok_or_else(|| SyncError::UnknownItem(item_id.clone()))
    }
}

impl std::fmt::Debug for VaultSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSync")
            .field("session", &self.inner.ctx.session)
            .field("status", &self.status())
            .finish()
    }
}

/// Waits until a flight publishes its result.
async fn wait_for(mut flight: Flight) -> SyncResult<SyncStatus> {
    loop {
        let published = flight.borrow_and_update().clone();
        if let Some(result) = published {
            return result;
        }
        if flight.changed().await.is_err() {
            let published = flight.borrow().clone();
            return published.unwrap_or(Err(SyncError::Cancelled));
        }
    }
}

/// Scheduler hook. Holds the engine weakly so a running timer never keeps
/// a dropped engine alive.
struct EngineTrigger(Weak<EngineInner>);

impl SyncTrigger for EngineTrigger {
    fn trigger(&self) -> bool {
        self.0.upgrade().is_some_and(|inner| inner.trigger_now())
    }
}

impl EngineInner {
    fn vault_lock(&self, vault_id: &VaultId) -> Arc<tokio::sync::Mutex<()>> {
        self.vault_locks
            .lock()
            .entry(vault_id.clone())
            .or_default()
            .clone()
    }

    /// Joins the flight for `vault_id` or starts one. Returns true if a new
    /// pass was started.
    fn launch(self: &Arc<Self>, vault_id: VaultId, retry: RetryConfig) -> (Flight, bool) {
        let (sender, flight) = {
            let mut flights = self.flights.lock();
            if let Some(flight) = flights.running.get(&vault_id) {
                trace!(%vault_id, "joining in-flight pass");
                return (flight.clone(), false);
            }
            let (sender, flight) = watch::channel(None);
            flights.running.insert(vault_id.clone(), flight.clone());
            (sender, flight)
        };

        // A disconnect or vault switch after this point cancels the pass,
        // even while it is still queued on the vault lock.
        let generation = self.ctx.session.generation();
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.run_with_retry(&vault_id, &retry, generation).await;
            inner.land(&vault_id);
            if sender.send(Some(result)).is_err() {
                trace!(%vault_id, "pass finished with no one waiting");
            }
        });
        (flight, true)
    }

    fn trigger_now(self: &Arc<Self>) -> bool {
        match self.ctx.session.vault_id() {
            Some(vault_id) => self.trigger_vault(&vault_id),
            None => false,
        }
    }

    fn trigger_vault(self: &Arc<Self>, vault_id: &VaultId) -> bool {
        if self.ctx.session.state() != ConnectionState::Authenticated {
            trace!(%vault_id, "trigger ignored, session not authenticated");
            return false;
        }
        let (_, started) = self.launch(vault_id.clone(), self.ctx.config.retry.clone());
        started
    }

    fn after_local_change(self: &Arc<Self>, vault_id: &VaultId) {
        if !self.ctx.config.auto_sync {
            return;
        }
        let mut flights = self.flights.lock();
        if flights.running.contains_key(vault_id) {
            // The running pass may have listed the store already.
            flights.rerun.insert(vault_id.clone());
            return;
        }
        drop(flights);
        self.trigger_vault(vault_id);
    }

    fn start_scheduler(self: &Arc<Self>, interval: Duration) {
        let trigger = Arc::new(EngineTrigger(Arc::downgrade(self)));
        self.scheduler.start(interval, trigger);
    }

    async fn run_with_retry(
        &self,
        vault_id: &VaultId,
        retry: &RetryConfig,
        generation: u64,
    ) -> SyncResult<SyncStatus> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                self.ctx.ensure_current(generation)?;
            }
            match self.run_pass(vault_id, generation).await {
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    debug!(%vault_id, attempt, error = %err, "retrying pass");
                }
                result => return result,
            }
        }
    }

    async fn run_pass(&self, vault_id: &VaultId, generation: u64) -> SyncResult<SyncStatus> {
        let lock = self.vault_lock(vault_id);
        let _guard = lock.lock().await;
        if let Err(err) = self.ctx.ensure_current(generation) {
            debug!(%vault_id, "pass overtaken while waiting for the vault");
            return Err(err);
        }

        self.status.begin(vault_id);
        self.ctx.events.emit(SyncEvent::SyncStart {
            vault_id: vault_id.clone(),
        });
        debug!(%vault_id, generation, "pass started");

        match self.reconciler.run(vault_id, generation).await {
            Ok(report) => {
                for conflict in report.conflicts {
                    self.ctx.events.emit(SyncEvent::Conflict(conflict));
                }
                let status = self.status.complete(report.tally);
                self.ctx.events.emit(SyncEvent::SyncComplete(status.clone()));
                Ok(status)
            }
            Err(SyncError::Cancelled) => {
                debug!(%vault_id, "pass cancelled");
                self.status.fail(&SyncError::Cancelled);
                Err(SyncError::Cancelled)
            }
            Err(err) => {
                warn!(%vault_id, error = %err, "pass failed");
                if err.is_auth() {
                    self.ctx.session.invalidate(err.to_string()).await;
                }
                self.status.fail(&err);
                self.ctx.events.emit(SyncEvent::SyncError {
                    vault_id: vault_id.clone(),
                    error: err.clone(),
                });
                Err(err)
            }
        }
    }

    /// Clears the flight and replays notices held back during the pass.
    fn land(self: &Arc<Self>, vault_id: &VaultId) {
        let (held, rerun): (Vec<ItemNotice>, bool) = {
            let mut flights = self.flights.lock();
            flights.running.remove(vault_id);
            let (held, rest) = std::mem::take(&mut flights.buffered)
                .into_iter()
                .partition(|notice| &notice.vault_id == vault_id);
            flights.buffered = rest;
            let rerun = flights.rerun.remove(vault_id);
            (held, rerun)
        };
        if held.is_empty() && !rerun {
            return;
        }

        if !held.is_empty() {
            debug!(%vault_id, count = held.len(), "replaying held-back remote updates");
        }
        for notice in held {
            self.ctx.events.emit(SyncEvent::RemoteUpdate(notice));
        }
        if self.ctx.config.auto_sync {
            self.trigger_vault(vault_id);
        }
    }

    fn on_remote_update(self: &Arc<Self>, notice: ItemNotice) {
        {
            let mut flights = self.flights.lock();
            if flights.running.contains_key(&notice.vault_id) {
                trace!(item_id = %notice.id, "pass in flight, holding back remote update");
                flights.buffered.push(notice);
                return;
            }
        }

        let vault_id = notice.vault_id.clone();
        self.ctx.events.emit(SyncEvent::RemoteUpdate(notice));
        if self.ctx.config.auto_sync {
            self.trigger_vault(&vault_id);
        }
    }

    fn on_authenticated(self: &Arc<Self>) {
        if !self.ctx.config.auto_sync
            || self.ctx.session.state() != ConnectionState::Authenticated
        {
            return;
        }
        self.start_scheduler(self.ctx.config.sync_interval());
        self.trigger_now();
    }

    /// Starts or stops the scheduler to match the session when lifecycle
    /// events may have been missed.
    fn sync_scheduler_with_session(self: &Arc<Self>) {
        let authenticated = self.ctx.session.state() == ConnectionState::Authenticated;
        match (authenticated, self.scheduler.is_running()) {
            (true, false) => self.on_authenticated(),
            (false, true) => self.scheduler.stop(),
            _ => {}
        }
    }

    fn spawn_dispatcher(
        weak: Weak<Self>,
        mut updates: mpsc::UnboundedReceiver<ItemNotice>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(notice) = updates.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.on_remote_update(notice);
            }
        })
    }

    fn spawn_lifecycle(
        weak: Weak<Self>,
        mut events: broadcast::Receiver<SyncEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "lifecycle listener lagged");
                        let Some(inner) = weak.upgrade() else { return };
                        inner.sync_scheduler_with_session();
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else { return };
                match event {
                    SyncEvent::Authenticated { .. } => inner.on_authenticated(),
                    SyncEvent::Disconnected { .. } => inner.scheduler.stop(),
                    _ => {}
                }
            }
        })
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
    }
}
