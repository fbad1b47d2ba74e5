//! Shared wiring for engine integration tests: devices talking to an
//! in-process relay through the HTTP adapter and the CBOR notification
//! channel.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use vaultsync_engine::{
    AesGcmGateway, ChannelError, Collaborators, CryptoGateway, EngineConfig, HttpClient,
    HttpTransport, ItemStore, Keyring, LocalItem, LoopbackClient, LoopbackNotifications,
    MemoryItemStore, ReconnectPolicy, RetryConfig, SyncEvent, VaultKey, VaultSync,
};
use vaultsync_protocol::{
    AuthRequest, ClearMetadata, DeviceId, HttpRequest, HttpResponse, ItemId, ItemType, Method,
    Vault, VaultId, VaultType,
};
use vaultsync_relay::{RelayConfig, RelayServer};

pub const HOME: &str = "home";
pub const WORK: &str = "work";

/// Routes requests to the relay, optionally slowed down, and records paths.
struct RelayClient {
    inner: Box<dyn HttpClient>,
    latency: Duration,
    log: Arc<Mutex<Vec<String>>>,
    unauthenticated_create: Option<usize>,
    creates: AtomicUsize,
}

#[async_trait]
impl HttpClient for RelayClient {
    async fn send(&self, url: &str, mut request: HttpRequest) -> Result<HttpResponse, String> {
        self.log.lock().push(request.path.clone());
        if matches!(request.method, Method::Post) && request.path == "/items" {
            let nth = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            if self.unauthenticated_create == Some(nth) {
                request.bearer = None;
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.inner.send(url, request).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub auto_sync: bool,
    pub latency: Duration,
    /// Use a key for `home` that no other device shares.
    pub foreign_key: bool,
    /// Send the n-th create (1-based) without a token.
    pub unauthenticated_create: Option<usize>,
}

impl Options {
    pub fn auto() -> Self {
        Self {
            auto_sync: true,
            ..Self::default()
        }
    }

    pub fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }
}

pub struct Harness {
    pub relay: Arc<RelayServer>,
    account_key: VaultKey,
    vaults: Vec<Vault>,
}

impl Harness {
    pub fn new() -> Self {
        let relay = Arc::new(RelayServer::new(RelayConfig::new(
            b"integration-test-secret".to_vec(),
        )));
        let account_key = VaultKey::generate();
        let wrapper = Keyring::new(Arc::new(AesGcmGateway::new()), account_key.clone());
        let vaults = [(HOME, VaultType::Personal), (WORK, VaultType::Work)]
            .into_iter()
            .map(|(id, vault_type)| Vault {
                id: VaultId::new(id),
                name: id.to_string(),
                vault_type,
                encrypted_key: wrapper.wrap(&VaultKey::generate()).unwrap(),
                team_id: None,
            })
            .collect();
        Self {
            relay,
            account_key,
            vaults,
        }
    }

    pub fn home(&self) -> VaultId {
        VaultId::new(HOME)
    }

    pub fn work(&self) -> VaultId {
        VaultId::new(WORK)
    }

    pub fn device(&self) -> Device {
        self.device_with(Options::default())
    }

    pub fn device_with(&self, options: Options) -> Device {
        let gateway: Arc<dyn CryptoGateway> = Arc::new(AesGcmGateway::new());
        let keys = Arc::new(Keyring::new(gateway.clone(), self.account_key.clone()));
        for vault in &self.vaults {
            keys.register(vault).unwrap();
        }
        if options.foreign_key {
            keys.insert(self.home(), VaultKey::generate());
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let relay = self.relay.clone();
        let client = RelayClient {
            inner: Box::new(LoopbackClient::new(move |request: &HttpRequest| {
                relay.handle(request)
            })),
            latency: options.latency,
            log: log.clone(),
            unauthenticated_create: options.unauthenticated_create,
            creates: AtomicUsize::new(0),
        };

        let relay = self.relay.clone();
        let notifications = LoopbackNotifications::new(move |auth: &AuthRequest, vault: &VaultId| {
            relay.subscribe(auth, vault).map_err(|e| {
                if e.is_auth() {
                    ChannelError::Unauthorized(e.to_string())
                } else {
                    ChannelError::transport_retryable(e.to_string())
                }
            })
        });

        let config = EngineConfig::new("http://relay.test")
            .with_auto_sync(options.auto_sync)
            .with_timeout(Duration::from_secs(5))
            .with_reconnect(ReconnectPolicy::new(
                Duration::from_millis(5),
                Duration::from_millis(20),
            ))
            .with_retry(RetryConfig::new(3).with_initial_delay(Duration::from_millis(5)));

        let store = Arc::new(MemoryItemStore::new());
        let engine = VaultSync::new(
            config,
            Collaborators {
                store: store.clone(),
                crypto: gateway.clone(),
                keys: keys.clone(),
                requests: Arc::new(HttpTransport::new("http://relay.test", client)),
                notifications: Arc::new(notifications),
            },
        )
        .unwrap();

        Device {
            device_id: engine.device_id(),
            engine,
            store,
            keys,
            gateway,
            relay: self.relay.clone(),
            log,
        }
    }

    /// Decrypts the relay's copy of an item with the shared `home` key.
    pub fn relay_plaintext(&self, device: &Device, item_id: &ItemId) -> String {
        let item = self.relay.item(item_id).expect("item on relay");
        device.decrypt(&item.encrypted_payload)
    }
}

pub struct Device {
    pub engine: VaultSync,
    pub store: Arc<MemoryItemStore>,
    pub keys: Arc<Keyring>,
    pub gateway: Arc<dyn CryptoGateway>,
    pub device_id: DeviceId,
    relay: Arc<RelayServer>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Device {
    pub async fn connect(&self, vault_id: &VaultId) {
        let token = self.relay.issue_token(&self.device_id).unwrap();
        self.engine.set_token(token);
        self.engine.connect(vault_id.clone()).await.unwrap();
    }

    pub async fn create(&self, vault_id: &VaultId, name: &str, secret: &str) -> ItemId {
        self.engine
            .create_item(vault_id, ItemType::Login, ClearMetadata::named(name), secret)
            .await
            .unwrap()
    }

    pub async fn edit(&self, item_id: &ItemId, name: &str, secret: &str) {
        self.engine
            .edit_item(item_id, ClearMetadata::named(name), secret)
            .await
            .unwrap();
    }

    /// The single live item of a vault.
    pub fn only_item(&self, vault_id: &VaultId) -> LocalItem {
        let mut items = self.engine.items(vault_id).unwrap();
        assert_eq!(items.len(), 1, "expected exactly one item");
        items.remove(0)
    }

    pub fn stored(&self, item_id: &ItemId) -> Option<LocalItem> {
        self.store.get(item_id).unwrap()
    }

    pub fn encrypt(&self, plaintext: &str) -> Vec<u8> {
        let key = vaultsync_engine::KeyProvider::vault_key(self.keys.as_ref(), &VaultId::new(HOME))
            .unwrap();
        self.gateway.encrypt(plaintext, &key).unwrap()
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> String {
        let key = vaultsync_engine::KeyProvider::vault_key(self.keys.as_ref(), &VaultId::new(HOME))
            .unwrap();
        self.gateway.decrypt(ciphertext, &key).unwrap()
    }

    pub fn manifest_requests(&self) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|path| path.ends_with("/manifest"))
            .count()
    }
}

/// Waits for the first event matching `predicate`.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<SyncEvent>, mut predicate: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event bus closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Polls `condition` until it holds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
