use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::rand_core::OsRng as SaltRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// AES-GCM nonce length; prepended to every sealed blob.
const NONCE_LEN: usize = 12;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SecretsError {
    #[error("failed to hash secret")]
    Hash,
    #[error("encryption key is malformed")]
    Key,
    #[error("failed to seal configuration")]
    Seal,
    #[error("ciphertext is malformed or was sealed under another key")]
    Unseal,
}

/// Hash an application secret for storage. The plaintext only ever exists in
/// the creation or rotation response.
pub fn hash_app_secret(secret: &str) -> Result<String, SecretsError> {
    let salt = SaltString::generate(&mut SaltRng);

    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| SecretsError::Hash)
}

/// Verify a candidate secret against a stored hash. A malformed stored hash
/// verifies as false rather than erroring: to the caller it is just a
/// credential that does not match.
pub fn verify_app_secret(secret: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

/// Symmetric cipher for configuration blobs (OAuth client credentials).
///
/// The store and the cache only ever see the sealed form; decryption happens
/// at the point of use and the plaintext is never logged.
#[derive(Clone)]
pub struct ConfigCipher {
    cipher: Aes256Gcm,
}

impl ConfigCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Load the cipher from a base64 encoded 32 byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, SecretsError> {
        let raw = BASE64.decode(encoded).map_err(|_| SecretsError::Key)?;
        let key: [u8; 32] = raw.try_into().map_err(|_| SecretsError::Key)?;

        Ok(Self::new(&key))
    }

    /// Serialize and encrypt `value`, returning base64(nonce ‖ ciphertext).
    pub fn seal<T: Serialize>(&self, value: &T) -> Result<String, SecretsError> {
        let plaintext = serde_json::to_vec(value).map_err(|_| SecretsError::Seal)?;
        let nonce = Aes256Gcm::generate_nonce(&mut AeadRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| SecretsError::Seal)?;

        let mut raw = nonce.to_vec();
        raw.extend(sealed);

        Ok(BASE64.encode(raw))
    }

    /// Decrypt and deserialize a blob produced by [`Self::seal`].
    ///
    /// An [`SecretsError::Unseal`] result on a cached blob means the cache
    /// entry is corrupt or the key has rotated; callers evict and fall back
    /// to the store.
    pub fn unseal<T: DeserializeOwned>(&self, blob: &str) -> Result<T, SecretsError> {
        let raw = BASE64.decode(blob).map_err(|_| SecretsError::Unseal)?;
        if raw.len() <= NONCE_LEN {
            return Err(SecretsError::Unseal);
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SecretsError::Unseal)?;

        serde_json::from_slice(&plaintext).map_err(|_| SecretsError::Unseal)
    }
}
