//! Relay configuration.

use std::time::Duration;

/// Configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Secret key for device token signatures.
    pub auth_secret: Vec<u8>,
    /// Token lifetime.
    pub token_expiry: Duration,
    /// Frames buffered per subscriber before it starts lagging.
    pub notification_buffer: usize,
    /// Largest accepted ciphertext.
    pub max_payload_bytes: usize,
}

impl RelayConfig {
    /// Creates a configuration with the given token secret.
    pub fn new(auth_secret: Vec<u8>) -> Self {
        Self {
            auth_secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
            notification_buffer: 256,
            max_payload_bytes: 1024 * 1024,
        }
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Sets the per-subscriber frame buffer.
    pub fn with_notification_buffer(mut self, frames: usize) -> Self {
        self.notification_buffer = frames.max(1);
        self
    }

    /// Sets the largest accepted ciphertext.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }
}
