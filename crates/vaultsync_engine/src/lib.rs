//! # VaultSync Engine
//!
//! Client-side synchronization engine for an end-to-end encrypted vault.
//!
//! This crate provides:
//! - Session management (handshake, notification channel, reconnect with backoff)
//! - A reconciler that diffs the local store against the relay manifest
//! - A conflict tracker with keep-local / keep-server / merge resolutions
//! - A scheduler for periodic and event-driven passes
//! - Transport, encryption and storage seams with reference implementations
//!
//! ## Architecture
//!
//! The relay is a blind store: it only sees ciphertext, versions and
//! cleartext listing metadata. Every pass works against one manifest snapshot:
//! 1. Fetch the vault manifest (ids and versions, no ciphertext)
//! 2. Push dirty items whose base version still matches the relay
//! 3. Pull items the relay has advanced while the local copy is clean
//! 4. Register a conflict when both sides moved
//!
//! ## Key Invariants
//!
//! - At most one pass per vault runs at a time; concurrent callers share its result
//! - Passes, resolutions and local edits on a vault are mutually exclusive
//! - A stale pass (after disconnect or vault switch) never writes to the store
//! - A decrypt failure skips one item, never the whole pass
//! - Versions accepted by the relay for an item only increase

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod context;
mod crypto;
mod engine;
mod error;
mod events;
mod http;
mod reconciler;
mod scheduler;
mod session;
mod status;
mod store;
mod transport;

pub use config::{EngineConfig, ReconnectPolicy, RetryConfig};
pub use conflict::{Conflict, ConflictSide, ConflictState, ConflictTracker, ResolutionStrategy};
pub use crypto::{AesGcmGateway, CryptoGateway, KeyProvider, Keyring, VaultKey, KEY_SIZE, NONCE_SIZE};
pub use engine::{Collaborators, VaultSync};
pub use error::{
    ChannelError, ConfigError, CryptoError, ResolveError, SessionError, StoreError, SyncError,
    SyncResult, TransportResult,
};
pub use events::{EventBus, SyncEvent};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use scheduler::{Scheduler, SyncTrigger};
pub use session::{ConnectionState, SessionManager};
pub use status::{ItemFailure, SyncStatus};
pub use store::{ItemStore, LocalItem, MemoryItemStore};
pub use transport::{LoopbackNotifications, NotificationChannel, RequestChannel};

/// Engine crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
