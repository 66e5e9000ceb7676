//! XChaCha20-Poly1305 authenticated encryption.
//!
//! The 24-byte extended nonce is generated randomly per message and
//! prepended to the ciphertext: `nonce(24) || ciphertext || tag(16)`.
//! Random nonces of that size are collision-safe without counters, which
//! is why the protocol uses the X variant over plain ChaCha20-Poly1305.

use {
    chacha20poly1305::{
        XChaCha20Poly1305, XNonce,
        aead::{Aead, KeyInit, Payload},
    },
    rand::RngCore,
};

use crate::error::CryptoError;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`, binding `aad`.
///
/// Returns `nonce || ciphertext || tag`.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload {
            msg: plaintext,
            aad,
        })
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext || tag` under `key`, checking `aad`.
pub fn decrypt(key: &[u8; KEY_SIZE], data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decryption(
            "data too short to contain nonce and tag".into(),
        ));
    }

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    let nonce = XNonce::from_slice(&data[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, Payload {
            msg: &data[NONCE_SIZE..],
            aad,
        })
        .map_err(|e| CryptoError::Decryption(e.to_string()))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_SIZE] {
        let mut k = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut k);
        k
    }

    #[test]
    fn round_trip() {
        let k = key();
        let sealed = encrypt(&k, b"attack at dawn", b"header").unwrap();
        let opened = decrypt(&k, &sealed, b"header").unwrap();
        assert_eq!(opened, b"attack at dawn");
    }

    #[test]
    fn nonce_is_random_per_message() {
        let k = key();
        let a = encrypt(&k, b"x", b"").unwrap();
        let b = encrypt(&k, b"x", b"").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn bit_flip_in_ciphertext_fails() {
        let k = key();
        let mut sealed = encrypt(&k, b"payload", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt(&k, &sealed, b"").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt(&key(), b"payload", b"").unwrap();
        assert!(decrypt(&key(), &sealed, b"").is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let k = key();
        let sealed = encrypt(&k, b"payload", b"right").unwrap();
        assert!(decrypt(&k, &sealed, b"wrong").is_err());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let k = key();
        assert!(decrypt(&k, &[0u8; NONCE_SIZE + TAG_SIZE - 1], b"").is_err());
    }
}
