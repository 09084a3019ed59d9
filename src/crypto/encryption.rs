use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use super::CryptoError;
use super::keys::KEY_LENGTH;

pub const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// AES-256-GCM output as stored: `[iv][ciphertext + tag]`.
///
/// Each envelope is sealed under a context (a record id, or a sealed
/// export's header) passed as associated data. Opening it under another
/// context fails exactly like a wrong key, so a ciphertext copied to a
/// different record id is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub iv: [u8; IV_LENGTH],
    pub ciphertext: Vec<u8>,
}

fn cipher(key_bytes: &[u8; KEY_LENGTH]) -> Aes256Gcm {
    Aes256Gcm::new(key_bytes.into())
}

impl EncryptedEnvelope {
    pub(crate) fn seal(
        key_bytes: &[u8; KEY_LENGTH],
        plaintext: &[u8],
        context: &[u8],
    ) -> Result<Self, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher(key_bytes)
            .encrypt(&nonce, Payload { msg: plaintext, aad: context })
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut iv = [0u8; IV_LENGTH];
        iv.copy_from_slice(&nonce);
        Ok(Self { iv, ciphertext })
    }

    pub(crate) fn open(&self, key_bytes: &[u8; KEY_LENGTH], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        cipher(key_bytes)
            .decrypt(
                Nonce::from_slice(&self.iv),
                Payload { msg: &self.ciphertext, aad: context },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        [self.iv.as_slice(), self.ciphertext.as_slice()].concat()
    }

    /// Split stored bytes back into iv and ciphertext. Anything shorter than
    /// an iv plus a tag cannot be an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < IV_LENGTH + TAG_LENGTH {
            return Err(CryptoError::MalformedEnvelope);
        }
        let (iv, ciphertext) = bytes.split_at(IV_LENGTH);
        let iv = iv.try_into().map_err(|_| CryptoError::MalformedEnvelope)?;
        Ok(Self { iv, ciphertext: ciphertext.to_vec() })
    }
}
