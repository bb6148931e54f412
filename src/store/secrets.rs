// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Credential sealing and the provider interface the sync engine reads
//! through.
//!
//! Account secrets are stored AES-256-GCM sealed under a service key. The
//! rest of the system never touches `auth_secret` directly; it asks a
//! [`CredentialProvider`].

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::AccountRow;

const SEALED_PREFIX: &str = "ENC:v1:";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("credential key not configured")]
    KeyNotConfigured,
    #[error("invalid credential key: must be 32 bytes (64 hex characters)")]
    InvalidKey,
    #[error("sealing failed: {0}")]
    SealFailed(String),
    #[error("unsealing failed: {0}")]
    OpenFailed(String),
    #[error("invalid sealed data: {0}")]
    InvalidFormat(String),
}

/// Nonce and ciphertext stored together, both base64.
#[derive(Debug, Serialize, Deserialize)]
struct SealedData {
    nonce: String,
    ciphertext: String,
}

/// AES-256-GCM sealer for credentials at rest. Without a key it degrades to
/// plaintext passthrough so development setups keep working.
pub struct CredentialCipher {
    cipher: Option<Aes256Gcm>,
}

impl CredentialCipher {
    /// Build from a hex-encoded 32-byte key. `None` disables sealing.
    pub fn new(key_hex: Option<&str>) -> Result<Self, SecretError> {
        let key_hex = match key_hex {
            Some(k) if !k.is_empty() => k,
            _ => {
                warn!("credential key not set, account secrets will be stored in plaintext");
                return Ok(Self { cipher: None });
            }
        };
        if key_hex.len() != 64 {
            return Err(SecretError::InvalidKey);
        }
        let key_bytes = hex::decode(key_hex).map_err(|_| SecretError::InvalidKey)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| SecretError::InvalidKey)?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal a plaintext secret into `ENC:v1:<base64-json>`.
    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = match &self.cipher {
            Some(c) => c,
            None => return Ok(plaintext.to_string()),
        };

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::SealFailed(e.to_string()))?;

        let sealed = SealedData {
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        };
        let json =
            serde_json::to_string(&sealed).map_err(|e| SecretError::SealFailed(e.to_string()))?;
        Ok(format!("{}{}", SEALED_PREFIX, BASE64.encode(json.as_bytes())))
    }

    /// Unseal. Unprefixed values pass through unchanged so plaintext rows
    /// from key-less deployments stay readable.
    pub fn open(&self, stored: &str) -> Result<String, SecretError> {
        let encoded = match stored.strip_prefix(SEALED_PREFIX) {
            Some(e) => e,
            None => return Ok(stored.to_string()),
        };

        let cipher = self.cipher.as_ref().ok_or(SecretError::KeyNotConfigured)?;

        let json_bytes = BASE64
            .decode(encoded)
            .map_err(|e| SecretError::InvalidFormat(format!("base64: {}", e)))?;
        let sealed: SealedData = serde_json::from_slice(&json_bytes)
            .map_err(|e| SecretError::InvalidFormat(format!("json: {}", e)))?;

        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| SecretError::InvalidFormat(format!("nonce: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(SecretError::InvalidFormat(format!(
                "nonce length {} (expected 12)",
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|e| SecretError::InvalidFormat(format!("ciphertext: {}", e)))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| SecretError::OpenFailed(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| SecretError::OpenFailed(format!("utf8: {}", e)))
    }
}

/// What the session factory needs to log in.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

/// Resolves login material for an account. The core treats secrets as
/// opaque; this is the only reader.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, account: &AccountRow) -> Result<Credentials, SecretError>;
}

/// Default provider: unseals the secret stored on the account row.
pub struct SealedCredentialProvider {
    cipher: CredentialCipher,
}

impl SealedCredentialProvider {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl CredentialProvider for SealedCredentialProvider {
    async fn credentials(&self, account: &AccountRow) -> Result<Credentials, SecretError> {
        let secret = self.cipher.open(&account.auth_secret)?;
        Ok(Credentials {
            user: account.auth_user.clone(),
            secret,
        })
    }
}
