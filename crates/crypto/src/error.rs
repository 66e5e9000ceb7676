use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ratchet state error: {0}")]
    Ratchet(String),

    #[error("unsupported crypto version: {0}")]
    UnsupportedVersion(u8),
}
