//! Session manager.
//!
//! Owns the authentication state and the notification channel lifecycle:
//! - `connect` runs the handshake on the request channel, then opens the
//!   notification channel with the same token
//! - a failed notification channel drops the session to `Disconnected`,
//!   emits `Disconnected` and reconnects with exponential backoff
//! - a rejected token drops the session and clears the token; only the host
//!   can recover by supplying a fresh one
//!
//! Every disconnect, vault switch and auth loss bumps the generation counter.
//! Passes compare their generation before each local write.

use crate::config::{EngineConfig, ReconnectPolicy};
use crate::error::{SessionError, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::transport::{NotificationChannel, RequestChannel};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use vaultsync_protocol::{AuthRequest, DeviceId, ItemNotice, Notification, VaultId};

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Handshake done and notification channel open.
    Authenticated,
}

/// Handle to the session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    device_id: DeviceId,
    requests: Arc<dyn RequestChannel>,
    notifications: Arc<dyn NotificationChannel>,
    events: EventBus,
    reconnect: ReconnectPolicy,
    timeout: Duration,
    state: RwLock<ConnectionState>,
    token: RwLock<Option<String>>,
    vault_id: RwLock<Option<VaultId>>,
    generation: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    reconnector: Mutex<Option<JoinHandle<()>>>,
    updates: mpsc::UnboundedSender<ItemNotice>,
}

impl SessionManager {
    /// Creates a disconnected session.
    ///
    /// `item-updated` notices from other devices for the subscribed vault
    /// are delivered on the returned receiver.
    pub fn new(
        config: &EngineConfig,
        requests: Arc<dyn RequestChannel>,
        notifications: Arc<dyn NotificationChannel>,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<ItemNotice>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let inner = SessionInner {
            device_id: config.device_id,
            requests,
            notifications,
            events,
            reconnect: config.reconnect.clone(),
            timeout: config.timeout,
            state: RwLock::new(ConnectionState::Disconnected),
            token: RwLock::new(None),
            vault_id: RwLock::new(None),
            generation: AtomicU64::new(0),
            listener: Mutex::new(None),
            reconnector: Mutex::new(None),
            updates,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Supplies the device token used by the next handshake.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.inner.token.write() = Some(token.into());
    }

    /// Returns the device id.
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Returns the connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Returns the subscribed (or last requested) vault.
    pub fn vault_id(&self) -> Option<VaultId> {
        self.inner.vault_id.read().clone()
    }

    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    /// Returns the bearer token if the session is authenticated.
    pub fn bearer(&self) -> SyncResult<String> {
        if self.state() != ConnectionState::Authenticated {
            return Err(SyncError::NotConnected);
        }
        self.inner.token.read().clone().ok_or(SyncError::NotConnected)
    }

    /// Authenticates and subscribes to `vault_id`.
    ///
    /// A no-op while already connecting or authenticated.
    pub async fn connect(&self, vault_id: VaultId) -> Result<(), SessionError> {
        vault_id
            .validate()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        {
            let mut state = self.inner.state.write();
            if *state != ConnectionState::Disconnected {
                debug!(state = ?*state, "connect ignored, session already active");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        *self.inner.vault_id.write() = Some(vault_id.clone());
        let generation = self.inner.generation();
        info!(%vault_id, device_id = %self.inner.device_id, "connecting");

        match self.inner.establish(&vault_id).await {
            Ok(()) if self.inner.generation() == generation => {
                SessionInner::on_established(&self.inner, vault_id);
                Ok(())
            }
            Ok(()) => {
                self.inner.notifications.close().await;
                Err(SessionError::Cancelled)
            }
            Err(err) => {
                if self.inner.generation() == generation {
                    *self.inner.state.write() = ConnectionState::Disconnected;
                }
                if err.is_auth() {
                    self.inner.token.write().take();
                }
                warn!(%vault_id, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    /// Closes the session and cancels in-flight passes.
    pub async fn disconnect(&self) {
        self.inner.bump_generation();
        self.inner.abort_tasks();
        let previous = std::mem::replace(
            &mut *self.inner.state.write(),
            ConnectionState::Disconnected,
        );
        self.inner.notifications.close().await;

        if previous != ConnectionState::Disconnected {
            info!("disconnected");
            self.inner
                .events
                .emit(SyncEvent::Disconnected { reason: None });
        }
    }

    /// Moves the subscription to another vault.
    ///
    /// In-flight passes for the previous vault are cancelled. A disconnected
    /// session only records the vault (and keeps any reconnect going).
    pub async fn switch_vault(&self, vault_id: VaultId) -> Result<(), SessionError> {
        vault_id
            .validate()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.inner.bump_generation();
        *self.inner.vault_id.write() = Some(vault_id.clone());

        let reconnecting = self
            .inner
            .reconnector
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        self.inner.abort_tasks();

        {
            let mut state = self.inner.state.write();
            if *state == ConnectionState::Disconnected {
                drop(state);
                if reconnecting {
                    SessionInner::spawn_reconnect(&self.inner);
                }
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        info!(%vault_id, "switching vault");
        self.inner.notifications.close().await;
        let generation = self.inner.generation();

        match self.inner.establish(&vault_id).await {
            Ok(()) if self.inner.generation() == generation => {
                SessionInner::on_established(&self.inner, vault_id);
                Ok(())
            }
            Ok(()) => Err(SessionError::Cancelled),
            Err(err) => {
                *self.inner.state.write() = ConnectionState::Disconnected;
                if err.is_auth() {
                    self.inner.token.write().take();
                }
                self.inner.events.emit(SyncEvent::Disconnected {
                    reason: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    /// Drops the session after the relay rejected the token.
    ///
    /// The token is cleared and no reconnect is scheduled.
    pub async fn invalidate(&self, reason: impl Into<String>) {
        self.inner.abort_tasks();
        SessionInner::lose_auth(&self.inner, reason.into()).await;
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.state())
            .field("vault_id", &self.vault_id())
            .field("generation", &self.generation())
            .finish()
    }
}

impl SessionInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_tasks(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        if let Some(task) = self.reconnector.lock().take() {
            task.abort();
        }
    }

    async fn establish(&self, vault_id: &VaultId) -> Result<(), SessionError> {
        let token = self.token.read().clone().ok_or(SessionError::MissingToken)?;
        let auth = AuthRequest {
            device_id: self.device_id,
            token,
        };

        let response = tokio::time::timeout(self.timeout, self.requests.authenticate(&auth))
            .await
            .map_err(|_| SessionError::Transport("handshake timed out".into()))??;
        if response.device_id != self.device_id {
            return Err(SessionError::Auth("token belongs to another device".into()));
        }

        tokio::time::timeout(self.timeout, self.notifications.open(&auth, vault_id))
            .await
            .map_err(|_| SessionError::Transport("notification channel timed out".into()))??;
        Ok(())
    }

    fn on_established(inner: &Arc<Self>, vault_id: VaultId) {
        *inner.state.write() = ConnectionState::Authenticated;
        info!(%vault_id, "authenticated");
        Self::spawn_listener(inner);
        inner.events.emit(SyncEvent::Authenticated { vault_id });
    }

    fn spawn_listener(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let notifications = inner.notifications.clone();
        let generation = inner.generation();

        let task = tokio::spawn(async move {
            loop {
                let frame = notifications.next().await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.generation() != generation {
                    return;
                }
                match frame {
                    Ok(Notification::ItemUpdated { item }) => inner.forward(item),
                    Ok(Notification::Subscribed { vault_id, .. }) => {
                        debug!(%vault_id, "subscription confirmed");
                    }
                    Ok(Notification::AuthRevoked { reason }) => {
                        inner.listener.lock().take();
                        Self::lose_auth(&inner, reason).await;
                        return;
                    }
                    Err(err) => {
                        inner.listener.lock().take();
                        Self::channel_failed(&inner, err.to_string());
                        return;
                    }
                }
            }
        });

        if let Some(previous) = inner.listener.lock().replace(task) {
            previous.abort();
        }
    }

    fn forward(&self, notice: ItemNotice) {
        if notice.origin == self.device_id {
            trace!(item_id = %notice.id, "ignoring echo of own commit");
            return;
        }
        if self.vault_id.read().as_ref() != Some(&notice.vault_id) {
            trace!(vault_id = %notice.vault_id, "ignoring notice for another vault");
            return;
        }
        debug!(item_id = %notice.id, version = notice.version, "remote update");
        if self.updates.send(notice).is_err() {
            trace!("remote update dropped, engine gone");
        }
    }

    fn channel_failed(inner: &Arc<Self>, reason: String) {
        {
            let mut state = inner.state.write();
            if *state != ConnectionState::Authenticated {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        warn!(%reason, "notification channel failed");
        inner.events.emit(SyncEvent::Disconnected {
            reason: Some(reason),
        });
        Self::spawn_reconnect(inner);
    }

    async fn lose_auth(inner: &Arc<Self>, reason: String) {
        inner.bump_generation();
        if let Some(task) = inner.reconnector.lock().take() {
            task.abort();
        }
        inner.token.write().take();
        *inner.state.write() = ConnectionState::Disconnected;
        inner.notifications.close().await;

        warn!(%reason, "authentication lost, waiting for a fresh token");
        inner.events.emit(SyncEvent::Disconnected {
            reason: Some(format!("authentication failed: {reason}")),
        });
    }

    fn spawn_reconnect(inner: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let generation = inner.generation();
        let policy = inner.reconnect.clone();

        let task = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if !policy.allows(attempt) {
                    if let Some(inner) = weak.upgrade() {
                        warn!(attempts = attempt, "giving up reconnecting");
                        inner.events.emit(SyncEvent::Disconnected {
                            reason: Some("reconnect attempts exhausted".into()),
                        });
                    }
                    return;
                }

                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                match weak.upgrade() {
                    Some(inner) => inner
                        .events
                        .emit(SyncEvent::Reconnecting { attempt, delay }),
                    None => return,
                }
                tokio::time::sleep(delay).await;

                let Some(inner) = weak.upgrade() else { return };
                if inner.generation() != generation {
                    return;
                }
                let Some(vault_id) = inner.vault_id.read().clone() else {
                    return;
                };
                {
                    let mut state = inner.state.write();
                    if *state != ConnectionState::Disconnected {
                        return;
                    }
                    *state = ConnectionState::Connecting;
                }

                info!(attempt, %vault_id, "reconnecting");
                let result = inner.establish(&vault_id).await;
                if inner.generation() != generation {
                    if result.is_ok() {
                        inner.notifications.close().await;
                    }
                    return;
                }
                match result {
                    Ok(()) => {
                        inner.reconnector.lock().take();
                        Self::on_established(&inner, vault_id);
                        return;
                    }
                    Err(err) => {
                        *inner.state.write() = ConnectionState::Disconnected;
                        if err.is_auth() {
                            inner.reconnector.lock().take();
                            Self::lose_auth(&inner, err.to_string()).await;
                            return;
                        }
                        debug!(attempt, error = %err, "reconnect attempt failed");
                    }
                }
            }
        });

        if let Some(previous) = inner.reconnector.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
