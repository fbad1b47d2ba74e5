//! # VaultSync Protocol
//!
//! Wire types shared by the VaultSync client engine and the relay.
//!
//! This crate provides:
//! - Identifiers (`ItemId`, `VaultId`, `DeviceId`) and the item/vault data model
//! - The metadata-only manifest used to diff local and remote state
//! - REST request/response bodies and endpoint routing
//! - Notification frames pushed by the relay (canonical CBOR)
//!
//! This is a pure protocol crate with no I/O operations. Payloads are opaque
//! ciphertext everywhere; nothing here can see plaintext.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod model;
mod notification;
mod rest;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AuthRequest, AuthResponse, CreateItemRequest, CreateItemResponse, DeleteItemRequest,
    ErrorBody, ManifestResponse, UpdateItemRequest, UpdateItemResponse,
};
pub use model::{
    now_millis, ClearMetadata, DeviceId, ItemId, ItemNotice, ItemType, ManifestEntry,
    RemoteItem, Timestamp, Vault, VaultId, VaultType,
};
pub use notification::Notification;
pub use rest::{decode_body, encode_body, status, Endpoint, HttpRequest, HttpResponse, Method};
