//! Credential vault using AES-256-GCM
//!
//! Seals credential data maps at rest. Keys are derived from an out-of-band
//! master secret and a key id, so several key generations can be loaded at
//! once and rows sealed under an older key id stay readable after the default
//! moves on. The integration id is bound as additional authenticated data so
//! a ciphertext cannot be replayed onto another integration.

#![allow(deprecated)]

use std::collections::HashMap;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::VaultConfig;
use crate::models::CredentialData;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;
const KEY_DERIVATION_LABEL: &str = "integration-credentials:";
const MIN_MASTER_SECRET_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("encryption key '{0}' is not loaded")]
    UnknownKey(String),
    #[error("invalid vault configuration: {0}")]
    InvalidConfiguration(String),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidConfiguration(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Derive the key for `key_id` from the master secret
    pub fn derive(master_secret: &[u8], key_id: &str) -> Result<Self, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(master_secret)
            .map_err(|e| CryptoError::InvalidConfiguration(e.to_string()))?;
        mac.update(KEY_DERIVATION_LABEL.as_bytes());
        mac.update(key_id.as_bytes());
        Self::new(mac.finalize().into_bytes().to_vec())
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // Layout: version byte | nonce | ciphertext+tag
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED || ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// Determine if a payload is using the encrypted format
pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

/// Holds every loadable key generation. Read-only after construction, so it
/// can be shared across connector tasks behind an `Arc` without locking.
#[derive(Clone)]
pub struct CredentialVault {
    keys: HashMap<String, CryptoKey>,
    default_key_id: String,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut key_ids: Vec<_> = self.keys.keys().collect();
        key_ids.sort();
        f.debug_struct("CredentialVault")
            .field("default_key_id", &self.default_key_id)
            .field("key_ids", &key_ids)
            .finish()
    }
}

impl CredentialVault {
    /// Load the default key generation plus any older generations still in use.
    pub fn new<I, S>(
        master_secret: &[u8],
        default_key_id: &str,
        previous_key_ids: I,
    ) -> Result<Self, CryptoError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if master_secret.len() < MIN_MASTER_SECRET_LEN {
            return Err(CryptoError::InvalidConfiguration(format!(
                "master secret must be at least {} bytes",
                MIN_MASTER_SECRET_LEN
            )));
        }
        if default_key_id.trim().is_empty() {
            return Err(CryptoError::InvalidConfiguration(
                "default key id must not be empty".to_string(),
            ));
        }

        let mut keys = HashMap::new();
        keys.insert(
            default_key_id.to_string(),
            CryptoKey::derive(master_secret, default_key_id)?,
        );
        for key_id in previous_key_ids {
            let key_id = key_id.as_ref().trim();
            if key_id.is_empty() || keys.contains_key(key_id) {
                continue;
            }
            keys.insert(key_id.to_string(), CryptoKey::derive(master_secret, key_id)?);
        }

        Ok(Self {
            keys,
            default_key_id: default_key_id.to_string(),
        })
    }

    /// Load every key generation named in configuration
    pub fn from_config(config: &VaultConfig) -> Result<Self, CryptoError> {
        let master_secret = config.master_secret.as_deref().ok_or_else(|| {
            CryptoError::InvalidConfiguration("master secret is not configured".to_string())
        })?;
        Self::new(
            master_secret,
            &config.default_key_id,
            &config.previous_key_ids,
        )
    }

    /// Key id new credentials are sealed under
    pub fn default_key_id(&self) -> &str {
        &self.default_key_id
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Seal `data` for `integration_id` under `key_id` (or the default key).
    /// Returns the ciphertext and the key id actually used.
    pub fn encrypt(
        &self,
        data: &CredentialData,
        key_id: Option<&str>,
        integration_id: Uuid,
    ) -> Result<(Vec<u8>, String), CryptoError> {
        let key_id = key_id.unwrap_or(&self.default_key_id);
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;

        let plaintext =
            serde_json::to_vec(data).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        let ciphertext = encrypt_bytes(key, aad(integration_id, key_id).as_bytes(), &plaintext)?;

        Ok((ciphertext, key_id.to_string()))
    }

    /// Open a ciphertext sealed by [`CredentialVault::encrypt`].
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        integration_id: Uuid,
    ) -> Result<CredentialData, CryptoError> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;

        let plaintext = decrypt_bytes(key, aad(integration_id, key_id).as_bytes(), ciphertext)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("invalid payload: {}", e)))
    }
}

fn aad(integration_id: Uuid, key_id: &str) -> String {
    format!("{}|{}", integration_id, key_id)
}
