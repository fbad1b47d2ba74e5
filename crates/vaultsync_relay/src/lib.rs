//! # VaultSync Relay
//!
//! Reference in-memory relay for VaultSync.
//!
//! This crate provides:
//! - The REST surface (handshake, manifest, create/update/get/delete)
//! - Optimistic version checks with `409 Conflict`
//! - Authentication (HMAC-SHA256 device tokens)
//! - `item-updated` fan-out to subscribed devices
//!
//! # Architecture
//!
//! The relay is blind: it stores opaque ciphertext next to the small
//! cleartext listing metadata and never holds a key. It maintains:
//! - The current record of every live item, keyed by id
//! - The history of versions accepted per item
//! - One notification subscription per device
//!
//! # Authentication
//!
//! ```rust,ignore
//! use vaultsync_relay::{RelayConfig, RelayServer};
//!
//! let relay = RelayServer::new(RelayConfig::new(b"relay-secret".to_vec()));
//! let token = relay.issue_token(&device_id);
//! ```
//!
//! # Versions
//!
//! A create is stored at version 1. An update or delete names the version it
//! was based on; anything else is rejected with the current version so the
//! client can raise a conflict.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod notify;
mod server;
mod store;

pub use auth::TokenValidator;
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use handler::{HandlerContext, RequestHandler};
pub use notify::NotificationHub;
pub use server::RelayServer;
pub use store::ItemTable;
