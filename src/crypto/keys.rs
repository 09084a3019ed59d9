use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::CryptoError;
use super::encryption::EncryptedEnvelope;
use crate::backend::{BackendError, KvBackend};

pub const PBKDF2_ITERATIONS: u32 = 600_000;
pub const KEY_LENGTH: usize = 32; // AES-256
pub const SALT_LENGTH: usize = 32;

/// Reserved backend key holding the per-installation salt.
pub const SALT_KEY: &str = "vault_salt";

/// Record encryption key, zeroed on drop
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct RecordKey {
    key_bytes: [u8; KEY_LENGTH],
}

impl RecordKey {
    /// Derive from passphrase + salt using PBKDF2-SHA256
    pub fn derive(passphrase: &str, salt: &[u8; SALT_LENGTH]) -> Self {
        Self::derive_with_iterations(passphrase, salt, PBKDF2_ITERATIONS)
    }

    /// Same as [`RecordKey::derive`] with an explicit iteration count.
    pub fn derive_with_iterations(passphrase: &str, salt: &[u8; SALT_LENGTH], iterations: u32) -> Self {
        let mut key_bytes = [0u8; KEY_LENGTH];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key_bytes);
        Self { key_bytes }
    }

    /// Derive off the async executor. PBKDF2 at full strength takes hundreds
    /// of milliseconds and must not stall other tasks.
    pub async fn derive_blocking(
        passphrase: Zeroizing<String>,
        salt: [u8; SALT_LENGTH],
        iterations: u32,
    ) -> Result<Self, CryptoError> {
        tokio::task::spawn_blocking(move || {
            Self::derive_with_iterations(passphrase.as_str(), &salt, iterations)
        })
        .await
        .map_err(|_| CryptoError::DerivationAborted)
    }

    /// AES-256-GCM with `context` as associated data.
    pub fn encrypt(&self, plaintext: &[u8], context: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
        EncryptedEnvelope::seal(&self.key_bytes, plaintext, context)
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope, context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        envelope.open(&self.key_bytes, context)
    }
}

impl std::fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordKey(..)")
    }
}

/// Generate a cryptographically random salt
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    use rand::RngCore;
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Read the installation salt from the backend, creating it on first use.
///
/// The salt is never rotated. Losing it makes every stored record
/// permanently undecryptable.
pub async fn load_or_create_salt<B: KvBackend>(
    backend: &B,
) -> Result<[u8; SALT_LENGTH], SaltError> {
    if let Some(bytes) = backend.get(SALT_KEY).await? {
        if bytes.len() != SALT_LENGTH {
            return Err(CryptoError::InvalidSalt(bytes.len()).into());
        }
        let mut salt = [0u8; SALT_LENGTH];
        salt.copy_from_slice(&bytes);
        return Ok(salt);
    }

    let salt = generate_salt();
    backend.set(SALT_KEY, salt.to_vec()).await?;
    tracing::info!(backend = backend.name(), "Generated new installation salt");
    Ok(salt)
}

#[derive(thiserror::Error, Debug)]
pub enum SaltError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn derive_produces_deterministic_key() {
        let salt = [42u8; SALT_LENGTH];
        let key1 = RecordKey::derive_with_iterations("pin1234", &salt, 1_000);
        let key2 = RecordKey::derive_with_iterations("pin1234", &salt, 1_000);
        assert_eq!(key1.key_bytes, key2.key_bytes);
    }

    #[test]
    fn different_passphrases_produce_different_keys() {
        let salt = [42u8; SALT_LENGTH];
        let key1 = RecordKey::derive_with_iterations("pin1234", &salt, 1_000);
        let key2 = RecordKey::derive_with_iterations("pin4321", &salt, 1_000);
        assert_ne!(key1.key_bytes, key2.key_bytes);
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let key1 = RecordKey::derive_with_iterations("pin1234", &[1u8; SALT_LENGTH], 1_000);
        let key2 = RecordKey::derive_with_iterations("pin1234", &[2u8; SALT_LENGTH], 1_000);
        assert_ne!(key1.key_bytes, key2.key_bytes);
    }

    #[test]
    fn generate_salt_is_random() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = RecordKey::derive_with_iterations("pin1234", &[7u8; SALT_LENGTH], 1_000);
        assert_eq!(format!("{key:?}"), "RecordKey(..)");
    }

    #[tokio::test]
    async fn blocking_derivation_matches_inline() {
        let salt = [9u8; SALT_LENGTH];
        let inline = RecordKey::derive_with_iterations("pin1234", &salt, 1_000);
        let offloaded = RecordKey::derive_blocking(Zeroizing::new("pin1234".into()), salt, 1_000)
            .await
            .unwrap();
        assert_eq!(inline.key_bytes, offloaded.key_bytes);
    }

    #[tokio::test]
    async fn salt_is_created_once_and_reused() {
        let backend = MemoryBackend::new();
        let first = load_or_create_salt(&backend).await.unwrap();
        let second = load_or_create_salt(&backend).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.get(SALT_KEY).await.unwrap().unwrap(), first.to_vec());
    }

    #[tokio::test]
    async fn truncated_salt_is_rejected() {
        let backend = MemoryBackend::new();
        backend.set(SALT_KEY, vec![1, 2, 3]).await.unwrap();
        let err = load_or_create_salt(&backend).await.unwrap_err();
        assert!(matches!(err, SaltError::Crypto(CryptoError::InvalidSalt(3))));
    }

    #[test]
    fn pbkdf2_takes_meaningful_time() {
        let start = std::time::Instant::now();
        let _key = RecordKey::derive("test_passphrase", &[0u8; SALT_LENGTH]);
        let elapsed = start.elapsed();
        assert!(
            elapsed.as_millis() > 20,
            "PBKDF2 too fast: {}ms, brute force protection insufficient",
            elapsed.as_millis()
        );
    }
}
