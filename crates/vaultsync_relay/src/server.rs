//! Main relay server.

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::handler::{HandlerContext, RequestHandler};
use tokio::sync::broadcast;
use tracing::info;
use vaultsync_protocol::{AuthRequest, DeviceId, HttpRequest, HttpResponse, ItemId, RemoteItem, VaultId};

/// The relay.
///
/// Serves the REST surface through [`RelayServer::handle`] and the
/// notification channel through [`RelayServer::subscribe`]. Both are plain
/// method calls, so an HTTP or WebSocket front end (or an in-process
/// loopback) can sit on top.
///
/// # Example
///
/// ```
/// use vaultsync_protocol::DeviceId;
/// use vaultsync_relay::{RelayConfig, RelayServer};
///
/// let relay = RelayServer::new(RelayConfig::new(b"relay-secret".to_vec()));
/// let token = relay.issue_token(&DeviceId::generate()).unwrap();
/// assert!(!token.is_empty());
/// ```
pub struct RelayServer {
    context: HandlerContext,
}

impl RelayServer {
    /// Creates a new relay.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            context: HandlerContext::new(config),
        }
    }

    /// Handles one REST request.
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        RequestHandler::new(&self.context).handle(request)
    }

    /// Opens a notification subscription after checking the handshake.
    pub fn subscribe(
        &self,
        auth: &AuthRequest,
        vault_id: &VaultId,
    ) -> RelayResult<broadcast::Receiver<Vec<u8>>> {
        self.context.authenticate(auth)?;
        vault_id.validate()?;
        Ok(self.context.hub.subscribe(auth.device_id, vault_id.clone()))
    }

    /// Issues a device token.
    pub fn issue_token(&self, device_id: &DeviceId) -> RelayResult<String> {
        self.context.validator().create_token(device_id)
    }

    /// Revokes a device: its tokens stop working and its notification channel
    /// receives `auth-revoked`.
    pub fn revoke_device(&self, device_id: &DeviceId, reason: &str) {
        info!(%device_id, %reason, "revoking device");
        self.context.revoke(*device_id);
        self.context.hub.revoke(device_id, reason);
    }

    /// Makes the relay accept or refuse (503) all traffic.
    pub fn set_available(&self, available: bool) {
        self.context.set_available(available);
    }

    /// Closes every notification channel, as a relay restart would.
    pub fn drop_subscriptions(&self) {
        self.context.hub.drop_all();
    }

    /// Returns the current record of an item.
    pub fn item(&self, item_id: &ItemId) -> Option<RemoteItem> {
        self.context.items.get(item_id)
    }

    /// Returns the versions accepted for an item, in acceptance order.
    pub fn accepted_versions(&self, item_id: &ItemId) -> Vec<u64> {
        self.context.items.accepted_versions(item_id)
    }

    /// Returns the number of live items.
    pub fn item_count(&self) -> usize {
        self.context.items.len()
    }

    /// Returns the number of live notification subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.context.hub.subscriber_count()
    }
}
