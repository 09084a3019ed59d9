pub mod keys;
pub mod encryption;
mod phi_audit;

pub use keys::*;
pub use encryption::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Wrong key and tampered ciphertext are deliberately the same variant.
    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Malformed encrypted envelope")]
    MalformedEnvelope,

    #[error("Stored salt is invalid ({0} bytes)")]
    InvalidSalt(usize),

    #[error("Key derivation task failed")]
    DerivationAborted,
}
