//! Transport layer abstraction.
//!
//! The engine talks to the relay over two independent channels:
//! - a request channel (logical REST) for the handshake, manifest and item calls
//! - a notification channel pushing `item-updated` frames from the relay

use crate::error::{ChannelError, TransportResult};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use vaultsync_protocol::{
    AuthRequest, AuthResponse, CreateItemRequest, CreateItemResponse, DeleteItemRequest, ItemId,
    ManifestEntry, Notification, RemoteItem, UpdateItemRequest, UpdateItemResponse, VaultId,
};

/// The request/response channel.
///
/// Every call except `authenticate` carries the bearer token.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Validates the device token.
    async fn authenticate(&self, request: &AuthRequest) -> TransportResult<AuthResponse>;

    /// Fetches `{id, version, updatedAt}` for every live item of a vault.
    async fn fetch_manifest(
        &self,
        token: &str,
        vault_id: &VaultId,
    ) -> TransportResult<Vec<ManifestEntry>>;

    /// Creates an item; the relay assigns its id and first version.
    async fn create_item(
        &self,
        token: &str,
        request: &CreateItemRequest,
    ) -> TransportResult<CreateItemResponse>;

    /// Updates an item. Fails with [`ChannelError::VersionConflict`] when
    /// `expected_previous_version` is stale.
    async fn update_item(
        &self,
        token: &str,
        item_id: &ItemId,
        request: &UpdateItemRequest,
    ) -> TransportResult<UpdateItemResponse>;

    /// Fetches the full encrypted record.
    async fn fetch_item(&self, token: &str, item_id: &ItemId) -> TransportResult<RemoteItem>;

    /// Deletes an item, with the same version check as `update_item`.
    async fn delete_item(
        &self,
        token: &str,
        item_id: &ItemId,
        request: &DeleteItemRequest,
    ) -> TransportResult<()>;
}

/// The server-to-client notification channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Opens the channel, authenticated with the device token and
    /// subscribed to one vault. Replaces any previous subscription.
    async fn open(&self, auth: &AuthRequest, vault_id: &VaultId) -> TransportResult<()>;

    /// Waits for the next frame. An error means the channel is gone.
    async fn next(&self) -> TransportResult<Notification>;

    /// Closes the channel.
    async fn close(&self);
}

/// A notification channel fed by an in-process broadcast of CBOR frames.
///
/// `subscribe` is called on every `open` and returns the frame receiver for
/// the vault; a closed sender surfaces as [`ChannelError::Closed`].
pub struct LoopbackNotifications<F> {
    subscribe: F,
    receiver: Mutex<Option<broadcast::Receiver<Vec<u8>>>>,
}

impl<F> LoopbackNotifications<F>
where
    F: Fn(&AuthRequest, &VaultId) -> TransportResult<broadcast::Receiver<Vec<u8>>> + Send + Sync,
{
    /// Creates a closed channel.
    pub fn new(subscribe: F) -> Self {
        Self {
            subscribe,
            receiver: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<F> NotificationChannel for LoopbackNotifications<F>
where
    F: Fn(&AuthRequest, &VaultId) -> TransportResult<broadcast::Receiver<Vec<u8>>> + Send + Sync,
{
    async fn open(&self, auth: &AuthRequest, vault_id: &VaultId) -> TransportResult<()> {
        let receiver = (self.subscribe)(auth, vault_id)?;
        *self.receiver.lock().await = Some(receiver);
        Ok(())
    }

    async fn next(&self) -> TransportResult<Notification> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or(ChannelError::Closed)?;

        loop {
            match receiver.recv().await {
                Ok(frame) => return Notification::decode(&frame).map_err(ChannelError::from),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    *guard = None;
                    return Err(ChannelError::Closed);
                }
            }
        }
    }

    async fn close(&self) {
        *self.receiver.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_protocol::{DeviceId, ItemNotice};

    fn auth() -> AuthRequest {
        AuthRequest {
            device_id: DeviceId::from_bytes([1u8; 16]),
            token: "t".into(),
        }
    }

    #[tokio::test]
    async fn loopback_delivers_frames() {
        let (sender, _) = broadcast::channel::<Vec<u8>>(8);
        let tx = sender.clone();
        let channel = LoopbackNotifications::new(move |_: &AuthRequest, _: &VaultId| Ok(tx.subscribe()));

        channel.open(&auth(), &VaultId::new("v")).await.unwrap();

        let frame = Notification::ItemUpdated {
            item: ItemNotice {
                id: ItemId::new("x"),
                vault_id: VaultId::new("v"),
                version: 2,
                updated_at: 5,
                deleted: false,
                origin: DeviceId::from_bytes([9u8; 16]),
            },
        };
        sender.send(frame.encode().unwrap()).unwrap();

        assert_eq!(channel.next().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn closed_sender_ends_channel() {
        let (sender, _) = broadcast::channel::<Vec<u8>>(8);
        let receiver = std::sync::Mutex::new(Some(sender.subscribe()));
        let channel = LoopbackNotifications::new(move |_: &AuthRequest, _: &VaultId| {
            receiver.lock().unwrap().take().ok_or(ChannelError::Closed)
        });

        channel.open(&auth(), &VaultId::new("v")).await.unwrap();
        drop(sender);

        assert_eq!(channel.next().await, Err(ChannelError::Closed));
        assert_eq!(channel.next().await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn rejected_subscription() {
        let channel = LoopbackNotifications::new(|_: &AuthRequest, _: &VaultId| {
            Err(ChannelError::Unauthorized("bad token".into()))
        });
        assert!(matches!(
            channel.open(&auth(), &VaultId::new("v")).await,
            Err(ChannelError::Unauthorized(_))
        ));
        assert_eq!(channel.next().await, Err(ChannelError::Closed));
    }
}
