// =============================================================================
// Master key lifecycle and credential encryption
// =============================================================================
//
// SECURITY: API credentials are persisted only as AES-256-GCM ciphertext. The
// master key comes from the environment, else the key file, else is generated
// once and written with owner-only permissions. Losing the key invalidates
// every stored credential, so generation logs an unmissable warning.
//
// Decryption failures deliberately degrade to an empty string: callers treat
// "no credential" and "unreadable credential" the same way and must never
// crash on a rotated key.
// =============================================================================

use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{error, info, warn};

use crate::error::{RebalancerError, Result};

/// Environment override for the master key (base64 of 32 raw bytes).
pub const MASTER_KEY_ENV: &str = "MERIDIAN_MASTER_KEY";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Symmetric cipher wrapping the master key. One instance lives inside the
/// settings store for the process lifetime.
pub struct SecretCipher {
    key_bytes: Vec<u8>,
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Resolve the master key: environment variable first, then the key file,
    /// else generate a fresh key and persist it at `key_path`.
    pub fn load_or_generate(key_path: &Path) -> Result<Self> {
        if let Ok(encoded) = std::env::var(MASTER_KEY_ENV) {
            let key_bytes = BASE64.decode(encoded.trim()).map_err(|e| {
                RebalancerError::InvalidInput(format!("{MASTER_KEY_ENV} is not valid base64: {e}"))
            })?;
            info!("master key loaded from {MASTER_KEY_ENV}");
            return Self::from_key_bytes(key_bytes);
        }

        if key_path.exists() {
            let key_bytes = std::fs::read(key_path).map_err(|e| {
                RebalancerError::Unexpected(format!(
                    "failed to read master key from {}: {e}",
                    key_path.display()
                ))
            })?;
            info!(path = %key_path.display(), "master key loaded from key file");
            return Self::from_key_bytes(key_bytes);
        }

        let key = Aes256Gcm::generate_key(&mut OsRng);
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RebalancerError::Unexpected(format!(
                    "failed to create data directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        std::fs::write(key_path, key.as_slice()).map_err(|e| {
            RebalancerError::Unexpected(format!(
                "failed to write master key to {}: {e}",
                key_path.display()
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            {
                warn!(error = %e, "failed to restrict key file permissions to 0600");
            }
        }

        warn!("{}", "=".repeat(80));
        warn!("!!! NEW MASTER KEY GENERATED !!!");
        warn!(
            "A new master key has been generated and saved to: {}",
            key_path.display()
        );
        warn!("Back up this key and set it as the {MASTER_KEY_ENV} environment variable.");
        warn!("If you lose this key, you lose access to your encrypted API credentials.");
        warn!("{}", "=".repeat(80));

        Self::from_key_bytes(key.to_vec())
    }

    /// Build a cipher from raw key bytes. The key must be exactly 32 bytes.
    pub fn from_key_bytes(key_bytes: Vec<u8>) -> Result<Self> {
        if key_bytes.len() != KEY_LEN {
            return Err(RebalancerError::InvalidInput(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Ok(Self { key_bytes, cipher })
    }

    /// Encrypt a plaintext credential. Output is `nonce || ciphertext` with a
    /// fresh random 96-bit nonce per call.
    pub fn encrypt(&self, plaintext: &str) -> Vec<u8> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption of an in-memory buffer cannot fail");
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt a stored credential. Returns an empty string on any failure;
    /// this must never propagate an error to callers.
    pub fn decrypt(&self, ciphertext: &[u8]) -> String {
        if ciphertext.is_empty() {
            return String::new();
        }
        if ciphertext.len() <= NONCE_LEN {
            error!("stored ciphertext is too short to contain a nonce");
            return String::new();
        }

        let (nonce, payload) = ciphertext.split_at(NONCE_LEN);
        match self.cipher.decrypt(Nonce::from_slice(nonce), payload) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(s) => s,
                Err(_) => {
                    error!("decrypted credential is not valid UTF-8");
                    String::new()
                }
            },
            Err(_) => {
                error!("failed to decrypt credential; the master key may have changed");
                String::new()
            }
        }
    }

    /// Signing key for the session layer, derived from the master key so all
    /// application secrets hang off one backup artefact. Read contract only.
    pub fn jwt_signing_key(&self) -> String {
        BASE64.encode(&self.key_bytes)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key_bytes", &"<redacted>")
            .finish()
    }
}

/// Hash an operator password with bcrypt.
pub fn hash_password(password: &str) -> Result<Vec<u8>> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map(String::into_bytes)
        .map_err(|e| RebalancerError::Unexpected(format!("password hashing failed: {e}")))
}

/// Verify an operator password against the stored bcrypt hash.
pub fn verify_password(password: &str, stored_hash: &[u8]) -> bool {
    let Ok(hash) = std::str::from_utf8(stored_hash) else {
        return false;
    };
    bcrypt::verify(password, hash).unwrap_or(false)
}
