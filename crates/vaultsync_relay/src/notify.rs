//! Notification fan-out.
//!
//! Each device holds at most one subscription. Frames are CBOR-encoded
//! [`Notification`]s, delivered over a per-subscriber broadcast channel so a
//! slow device lags on its own.

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use vaultsync_protocol::{DeviceId, ItemNotice, Notification, VaultId};

struct Subscriber {
    device_id: DeviceId,
    vault_id: VaultId,
    sender: broadcast::Sender<Vec<u8>>,
}

/// Delivers `item-updated` frames to subscribed devices.
pub struct NotificationHub {
    subscribers: Mutex<Vec<Subscriber>>,
    buffer: usize,
}

impl NotificationHub {
    /// Creates a hub buffering `buffer` frames per subscriber.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    /// Subscribes a device to a vault, replacing its previous subscription.
    pub fn subscribe(&self, device_id: DeviceId, vault_id: VaultId) -> broadcast::Receiver<Vec<u8>> {
        let (sender, receiver) = broadcast::channel(self.buffer);
        send(
            &sender,
            &Notification::Subscribed {
                vault_id: vault_id.clone(),
                device_id,
            },
        );

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.device_id != device_id);
        subscribers.push(Subscriber {
            device_id,
            vault_id,
            sender,
        });
        debug!(%device_id, subscribers = subscribers.len(), "device subscribed");
        receiver
    }

    /// Sends a notice to every device subscribed to its vault, the
    /// originating device included.
    pub fn publish(&self, notice: &ItemNotice) {
        let frame = Notification::ItemUpdated {
            item: notice.clone(),
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.sender.receiver_count() > 0);
        for subscriber in subscribers.iter().filter(|s| s.vault_id == notice.vault_id) {
            send(&subscriber.sender, &frame);
        }
    }

    /// Sends `auth-revoked` to a device and drops its subscription.
    pub fn revoke(&self, device_id: &DeviceId, reason: &str) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| {
            if &s.device_id != device_id {
                return true;
            }
            send(
                &s.sender,
                &Notification::AuthRevoked {
                    reason: reason.to_string(),
                },
            );
            false
        });
    }

    /// Drops every subscription; subscribers see their channel close.
    pub fn drop_all(&self) {
        let dropped = std::mem::take(&mut *self.subscribers.lock());
        debug!(count = dropped.len(), "dropped all subscriptions");
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.sender.receiver_count() > 0);
        subscribers.len()
    }
}

fn send(sender: &broadcast::Sender<Vec<u8>>, frame: &Notification) {
    match frame.encode() {
        Ok(bytes) => {
            // No receiver means the device is gone; pruned on the next publish.
            let _ = sender.send(bytes);
        }
        Err(e) => warn!(error = %e, "failed to encode notification"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_protocol::ItemId;

    fn notice(vault: &str, origin: DeviceId) -> ItemNotice {
        ItemNotice {
            id: ItemId::new("x"),
            vault_id: VaultId::new(vault),
            version: 2,
            updated_at: 1,
            deleted: false,
            origin,
        }
    }

    fn next(receiver: &mut broadcast::Receiver<Vec<u8>>) -> Notification {
        Notification::decode(&receiver.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn fan_out_by_vault() {
        let hub = NotificationHub::new(8);
        let a = DeviceId::from_bytes([1; 16]);
        let b = DeviceId::from_bytes([2; 16]);
        let mut rx_a = hub.subscribe(a, VaultId::new("home"));
        let mut rx_b = hub.subscribe(b, VaultId::new("work"));
        assert!(matches!(next(&mut rx_a), Notification::Subscribed { .. }));
        assert!(matches!(next(&mut rx_b), Notification::Subscribed { .. }));

        hub.publish(&notice("home", b));
        assert!(matches!(next(&mut rx_a), Notification::ItemUpdated { .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn resubscribe_replaces() {
        let hub = NotificationHub::new(8);
        let a = DeviceId::from_bytes([1; 16]);
        let mut old = hub.subscribe(a, VaultId::new("home"));
        let _new = hub.subscribe(a, VaultId::new("work"));
        assert_eq!(hub.subscriber_count(), 1);

        let _ = old.try_recv();
        assert!(matches!(
            old.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn revoke_notifies_and_drops() {
        let hub = NotificationHub::new(8);
        let a = DeviceId::from_bytes([1; 16]);
        let mut rx = hub.subscribe(a, VaultId::new("home"));
        let _ = next(&mut rx);

        hub.revoke(&a, "device removed");
        assert_eq!(
            next(&mut rx),
            Notification::AuthRevoked {
                reason: "device removed".into()
            }
        );
        assert_eq!(hub.subscriber_count(), 0);
    }
}
