//! Device token authentication.
//!
//! Tokens are HMAC-SHA256 signed and carry their issue time for expiration
//! checking.
//!
//! ## Token Format
//!
//! - 16 bytes: device_id
//! - 8 bytes: issue timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature
//!
//! Total: 56 bytes, hex-encoded for transport.

use crate::error::{RelayError, RelayResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use vaultsync_protocol::{now_millis, DeviceId, Timestamp};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 56;
const SIGNED_LEN: usize = 24;

/// Issues and checks device tokens.
#[derive(Clone)]
pub struct TokenValidator {
    secret: Vec<u8>,
    expiry: Duration,
}

impl TokenValidator {
    /// Creates a validator.
    pub fn new(secret: Vec<u8>, expiry: Duration) -> Self {
        Self { secret, expiry }
    }

    /// Creates a token for a device.
    pub fn create_token(&self, device_id: &DeviceId) -> RelayResult<String> {
        self.create_token_at(device_id, now_millis())
    }

    fn create_token_at(&self, device_id: &DeviceId, issued_at: Timestamp) -> RelayResult<String> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(device_id.as_bytes());
        token.extend_from_slice(&issued_at.to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(hex::encode(token))
    }

    /// Validates a token and returns the device it was issued to.
    pub fn validate(&self, token: &str) -> RelayResult<DeviceId> {
        self.decode(token).map(|(device_id, _)| device_id)
    }

    /// Validates a token for `device_id` and returns its expiry time.
    pub fn validate_for(&self, token: &str, device_id: &DeviceId) -> RelayResult<Timestamp> {
        let (owner, expires_at) = self.decode(token)?;
        if &owner != device_id {
            return Err(RelayError::NotAuthorized("device id mismatch".into()));
        }
        Ok(expires_at)
    }

    fn decode(&self, token: &str) -> RelayResult<(DeviceId, Timestamp)> {
        let token = hex::decode(token)
            .map_err(|_| RelayError::NotAuthorized("malformed token".into()))?;
        if token.len() != TOKEN_LEN {
            return Err(RelayError::NotAuthorized("invalid token length".into()));
        }

        let (signed, signature) = token.split_at(SIGNED_LEN);
        self.mac(signed)?
            .verify_slice(signature)
            .map_err(|_| RelayError::NotAuthorized("invalid signature".into()))?;

        let mut device = [0u8; 16];
        device.copy_from_slice(&signed[..16]);
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&signed[16..]);

        let expires_at = self.expires_at(u64::from_be_bytes(issued));
        if now_millis() > expires_at {
            return Err(RelayError::NotAuthorized("token expired".into()));
        }
        Ok((DeviceId::from_bytes(device), expires_at))
    }

    fn expires_at(&self, issued_at: Timestamp) -> Timestamp {
        issued_at.saturating_add(self.expiry.as_millis() as u64)
    }

    fn mac(&self, data: &[u8]) -> RelayResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| RelayError::Internal(format!("hmac key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}
