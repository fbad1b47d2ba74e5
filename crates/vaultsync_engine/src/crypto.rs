//! Encryption gateway and per-vault key management.
//!
//! The engine never inspects key material. It asks a [`KeyProvider`] for the
//! key of a vault and hands it to a [`CryptoGateway`].
//!
//! ## Ciphertext format
//!
//! [`AesGcmGateway`] produces `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//! with a fresh random nonce per call.

use crate::error::CryptoError;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use vaultsync_protocol::{Vault, VaultId};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Symmetric key of a vault (or of an account, when wrapping vault keys).
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Returns the raw key bytes. Never log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Opaque encrypt/decrypt capability.
pub trait CryptoGateway: Send + Sync {
    /// Encrypts a plaintext under `key`.
    fn encrypt(&self, plaintext: &str, key: &VaultKey) -> Result<Vec<u8>, CryptoError>;

    /// Decrypts a ciphertext under `key`.
    ///
    /// Fails with [`CryptoError::DecryptionFailed`] on tamper or wrong key.
    fn decrypt(&self, ciphertext: &[u8], key: &VaultKey) -> Result<String, CryptoError>;
}

/// AES-256-GCM gateway.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmGateway;

impl AesGcmGateway {
    /// Creates the gateway.
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &VaultKey) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()))
    }
}

impl CryptoGateway for AesGcmGateway {
    fn encrypt(&self, plaintext: &str, key: &VaultKey) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = Self::cipher(key)
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed("aead encryption error".into()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &VaultKey) -> Result<String, CryptoError> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("ciphertext too short".into()));
        }

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);
        let plaintext = Self::cipher(key)
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::DecryptionFailed("plaintext is not UTF-8".into()))
    }
}

/// Source of per-vault keys.
pub trait KeyProvider: Send + Sync {
    /// Returns the key of a vault.
    fn vault_key(&self, vault_id: &VaultId) -> Result<VaultKey, CryptoError>;
}

/// In-memory key provider that unwraps vault keys with the account key.
///
/// A wrapped vault key is the gateway ciphertext of the hex-encoded key bytes.
pub struct Keyring {
    gateway: Arc<dyn CryptoGateway>,
    account_key: VaultKey,
    keys: RwLock<HashMap<VaultId, VaultKey>>,
}

impl Keyring {
    /// Creates an empty keyring.
    pub fn new(gateway: Arc<dyn CryptoGateway>, account_key: VaultKey) -> Self {
        Self {
            gateway,
            account_key,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Wraps a vault key for storage in [`Vault::encrypted_key`].
    pub fn wrap(&self, key: &VaultKey) -> Result<Vec<u8>, CryptoError> {
        let encoded = Zeroizing::new(hex::encode(key.as_bytes()));
        self.gateway.encrypt(&encoded, &self.account_key)
    }

    /// Unwraps and registers the key of a vault.
    pub fn register(&self, vault: &Vault) -> Result<(), CryptoError> {
        let encoded = Zeroizing::new(self.gateway.decrypt(&vault.encrypted_key, &self.account_key)?);
        let bytes = Zeroizing::new(
            hex::decode(encoded.as_str())
                .map_err(|_| CryptoError::DecryptionFailed("wrapped key is not hex".into()))?,
        );
        let key = VaultKey::from_bytes(&bytes)?;

        debug!(vault_id = %vault.id, "registered vault key");
        self.keys.write().insert(vault.id.clone(), key);
        Ok(())
    }

    /// Registers an already unwrapped key.
    pub fn insert(&self, vault_id: VaultId, key: VaultKey) {
        self.keys.write().insert(vault_id, key);
    }

    /// Forgets the key of a vault.
    pub fn remove(&self, vault_id: &VaultId) {
        self.keys.write().remove(vault_id);
    }
}

impl KeyProvider for Keyring {
    fn vault_key(&self, vault_id: &VaultId) -> Result<VaultKey, CryptoError> {
        self.keys
            .read()
            .get(vault_id)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownVault(vault_id.clone()))
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("vaults", &self.keys.read().len())
            .finish_non_exhaustive()
    }
}
