//! In-process devices wired to a shared relay.

use std::sync::Arc;
use vaultsync_engine::{
    AesGcmGateway, ChannelError, Collaborators, CryptoGateway, EngineConfig, HttpTransport,
    Keyring, LoopbackClient, LoopbackNotifications, MemoryItemStore, VaultKey, VaultSync,
};
use vaultsync_protocol::{AuthRequest, HttpRequest, Vault, VaultId};
use vaultsync_relay::{RelayError, RelayServer};

/// One simulated device: an engine talking to the relay through the HTTP
/// adapter and the notification channel.
pub struct Device {
    /// Label used in output.
    pub name: &'static str,
    /// The device's engine.
    pub engine: VaultSync,
    relay: Arc<RelayServer>,
}

impl Device {
    /// Builds a device holding the account key, with `vault` registered.
    pub fn new(
        name: &'static str,
        relay: Arc<RelayServer>,
        account_key: VaultKey,
        vault: &Vault,
        config: EngineConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let gateway: Arc<dyn CryptoGateway> = Arc::new(AesGcmGateway::new());
        let keys = Arc::new(Keyring::new(gateway.clone(), account_key));
        keys.register(vault)?;

        let server = relay.clone();
        let client = LoopbackClient::new(move |request: &HttpRequest| server.handle(request));
        let hub = relay.clone();
        let notifications = LoopbackNotifications::new(move |auth: &AuthRequest, vault_id: &VaultId| {
            hub.subscribe(auth, vault_id).map_err(channel_error)
        });

        let requests = Arc::new(HttpTransport::new(config.api_url.clone(), client));
        let engine = VaultSync::new(
            config,
            Collaborators {
                store: Arc::new(MemoryItemStore::new()),
                crypto: gateway,
                keys,
                requests,
                notifications: Arc::new(notifications),
            },
        )?;

        Ok(Self {
            name,
            engine,
            relay,
        })
    }

    /// Obtains a token from the relay and connects to `vault_id`.
    pub async fn connect(&self, vault_id: &VaultId) -> Result<(), Box<dyn std::error::Error>> {
        let token = self.relay.issue_token(&self.engine.device_id())?;
        self.engine.set_token(token);
        self.engine.connect(vault_id.clone()).await?;
        Ok(())
    }
}

fn channel_error(err: RelayError) -> ChannelError {
    if err.is_auth() {
        ChannelError::Unauthorized(err.to_string())
    } else {
        ChannelError::transport_retryable(err.to_string())
    }
}
