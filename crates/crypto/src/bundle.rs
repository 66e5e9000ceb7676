//! Key bundle material: version-aware length validation, signed-prekey
//! generation and verification.
//!
//! Version 1 bundles carry Ed448/X448 keys (57/56-byte raw public keys);
//! version 2 carries Ed25519/X25519 (32-byte keys, 64-byte signatures).
//! Both versions verify the signed-prekey signature against the claimed
//! identity key, and a failure rejects the whole upload. The v1 wire
//! format embeds the signing timestamp in the first 8 bytes of the
//! signature blob; v2 carries it as a separate field.

use {
    ed448_goldilocks::{Signature as Ed448Signature, VerifyingKey as Ed448VerifyingKey},
    ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey},
    rand::rngs::OsRng,
    x25519_dalek::{PublicKey as X25519Public, StaticSecret},
};

use crate::error::CryptoError;

/// Ed448 identity keypair type, re-exported so clients and tests can mint
/// v1 material against [`sign_prekey_v1`].
pub use ed448_goldilocks::SigningKey as Ed448IdentityKey;

/// Maximum accepted age for a signed prekey at verification time.
const SIGNED_PREKEY_MAX_AGE_SECS: i64 = 30 * 86_400;
/// Clock-skew tolerance for freshly signed prekeys.
const CLOCK_SKEW_SECS: i64 = 300;
/// Domain prefix the v1 protocol signs under.
const V1_SIGN_DOMAIN: &[u8] = b"SCP_SIGNED_PREKEY_v1";
/// Raw Ed448 signature length; the v1 wire blob prepends 8 timestamp bytes.
const ED448_SIGNATURE_LEN: usize = 114;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoVersion {
    /// Ed448 signing, X448 DH.
    V1,
    /// Ed25519 signing, X25519 DH.
    V2,
}

impl CryptoVersion {
    pub fn from_u8(v: u8) -> Result<Self, CryptoError> {
        match v {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(CryptoError::UnsupportedVersion(other)),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Raw signing public key length (Ed448 / Ed25519).
    #[must_use]
    pub fn signing_key_len(self) -> usize {
        match self {
            Self::V1 => 57,
            Self::V2 => 32,
        }
    }

    /// Raw DH public key length (X448 / X25519).
    #[must_use]
    pub fn dh_key_len(self) -> usize {
        match self {
            Self::V1 => 56,
            Self::V2 => 32,
        }
    }

    /// Signature blob length. v1 carries `timestamp_be8 ‖ Ed448 signature`.
    #[must_use]
    pub fn signature_len(self) -> usize {
        match self {
            Self::V1 => 8 + ED448_SIGNATURE_LEN,
            Self::V2 => 64,
        }
    }
}

/// An uploaded bundle's public material, already base64-decoded.
#[derive(Debug, Clone)]
pub struct PublicBundle {
    pub version: CryptoVersion,
    pub identity_key: Vec<u8>,
    pub identity_dh_key: Vec<u8>,
    pub signed_prekey: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_timestamp: i64,
}

impl PublicBundle {
    /// Validate key lengths for the claimed version and verify the signed
    /// prekey signature against the identity key. A failure rejects the
    /// whole upload. Returns the authoritative signing timestamp: the one
    /// embedded in the blob for v1, the declared field for v2.
    pub fn validate(&self, now_secs: i64) -> Result<i64, CryptoError> {
        let v = self.version;
        check_len("identity_key", &self.identity_key, v.signing_key_len())?;
        check_len("identity_dh_key", &self.identity_dh_key, v.dh_key_len())?;
        check_len("signed_prekey", &self.signed_prekey, v.dh_key_len())?;
        check_len(
            "signed_prekey_signature",
            &self.signed_prekey_signature,
            v.signature_len(),
        )?;

        match v {
            CryptoVersion::V1 => verify_signed_prekey_v1(
                &self.identity_key,
                &self.signed_prekey,
                &self.signed_prekey_signature,
                now_secs,
            ),
            CryptoVersion::V2 => {
                verify_signed_prekey_v2(
                    &self.identity_key,
                    &self.signed_prekey,
                    &self.signed_prekey_signature,
                    self.signed_prekey_timestamp,
                    now_secs,
                )?;
                Ok(self.signed_prekey_timestamp)
            }
        }
    }
}

fn check_len(field: &str, value: &[u8], expected: usize) -> Result<(), CryptoError> {
    if value.len() == expected {
        Ok(())
    } else {
        Err(CryptoError::InvalidKey(format!(
            "{field}: expected {expected} bytes, got {}",
            value.len()
        )))
    }
}

fn check_age(timestamp: i64, now_secs: i64) -> Result<(), CryptoError> {
    let age = now_secs - timestamp;
    if age > SIGNED_PREKEY_MAX_AGE_SECS {
        return Err(CryptoError::Verification("signed prekey too old".into()));
    }
    if age < -CLOCK_SKEW_SECS {
        return Err(CryptoError::Verification(
            "signed prekey timestamp is in the future".into(),
        ));
    }
    Ok(())
}

/// Verify a v1 blob: `timestamp_be8 ‖ Ed448 signature` over
/// `"SCP_SIGNED_PREKEY_v1" ‖ prekey_public ‖ timestamp_be8`.
///
/// Returns the embedded timestamp on success.
pub fn verify_signed_prekey_v1(
    identity_public: &[u8],
    signed_prekey_public: &[u8],
    full_signature: &[u8],
    now_secs: i64,
) -> Result<i64, CryptoError> {
    if full_signature.len() != 8 + ED448_SIGNATURE_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "v1 signature blob must be {} bytes",
            8 + ED448_SIGNATURE_LEN
        )));
    }
    let (timestamp_bytes, signature_bytes) = full_signature.split_at(8);
    let timestamp = u64::from_be_bytes(
        timestamp_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("truncated v1 timestamp".into()))?,
    ) as i64;
    check_age(timestamp, now_secs)?;

    let identity_public_arr: [u8; 57] = identity_public
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("identity key is not a valid Ed448 point".into()))?;
    let verifying = Ed448VerifyingKey::from_bytes(&identity_public_arr)
        .map_err(|_| CryptoError::InvalidKey("identity key is not a valid Ed448 point".into()))?;
    let signature = Ed448Signature::try_from(signature_bytes)
        .map_err(|_| CryptoError::InvalidKey("malformed Ed448 signature".into()))?;

    let mut message =
        Vec::with_capacity(V1_SIGN_DOMAIN.len() + signed_prekey_public.len() + 8);
    message.extend_from_slice(V1_SIGN_DOMAIN);
    message.extend_from_slice(signed_prekey_public);
    message.extend_from_slice(timestamp_bytes);

    verifying
        .verify_raw(&signature, &message)
        .map_err(|e| CryptoError::Verification(e.to_string()))?;
    Ok(timestamp)
}

/// Sign a v1 prekey the way [`verify_signed_prekey_v1`] expects: the
/// returned blob is `timestamp_be8 ‖ Ed448 signature`.
#[must_use]
pub fn sign_prekey_v1(
    identity: &Ed448IdentityKey,
    signed_prekey_public: &[u8],
    timestamp: i64,
) -> Vec<u8> {
    let timestamp_bytes = (timestamp as u64).to_be_bytes();
    let mut message =
        Vec::with_capacity(V1_SIGN_DOMAIN.len() + signed_prekey_public.len() + 8);
    message.extend_from_slice(V1_SIGN_DOMAIN);
    message.extend_from_slice(signed_prekey_public);
    message.extend_from_slice(&timestamp_bytes);

    let signature = identity.sign_raw(&message);
    let signature_bytes = signature.to_bytes();

    let mut blob = Vec::with_capacity(8 + ED448_SIGNATURE_LEN);
    blob.extend_from_slice(&timestamp_bytes);
    blob.extend_from_slice(signature_bytes.as_ref());
    blob
}

/// Verify an Ed25519 signature over `prekey_public ‖ timestamp_be8`.
pub fn verify_signed_prekey_v2(
    identity_public: &[u8],
    signed_prekey_public: &[u8],
    signature: &[u8],
    timestamp: i64,
    now_secs: i64,
) -> Result<(), CryptoError> {
    check_age(timestamp, now_secs)?;

    let key_bytes: [u8; 32] = identity_public
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut message = Vec::with_capacity(signed_prekey_public.len() + 8);
    message.extend_from_slice(signed_prekey_public);
    message.extend_from_slice(&timestamp.to_be_bytes());

    verifying
        .verify(&message, &sig)
        .map_err(|e| CryptoError::Verification(e.to_string()))
}

// ── v2 key generation (client side and tests) ───────────────────────────────

/// An Ed25519 identity keypair plus the X25519 identity DH keypair.
pub struct IdentityKeys {
    pub signing: SigningKey,
    pub dh_secret: StaticSecret,
}

impl IdentityKeys {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            dh_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    #[must_use]
    pub fn signing_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    #[must_use]
    pub fn dh_public(&self) -> [u8; 32] {
        X25519Public::from(&self.dh_secret).to_bytes()
    }

    /// Generate and sign a fresh signed prekey.
    #[must_use]
    pub fn signed_prekey(&self, timestamp: i64) -> SignedPreKey {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();

        let mut message = Vec::with_capacity(40);
        message.extend_from_slice(&public);
        message.extend_from_slice(&timestamp.to_be_bytes());
        let signature = self.signing.sign(&message).to_bytes();

        SignedPreKey {
            secret,
            public,
            signature,
            timestamp,
        }
    }
}

pub struct SignedPreKey {
    pub secret: StaticSecret,
    pub public: [u8; 32],
    pub signature: [u8; 64],
    pub timestamp: i64,
}

/// Generate a batch of X25519 one-time prekeys keyed by sequential ids.
#[must_use]
pub fn generate_one_time_prekeys(count: u32, start_id: u32) -> Vec<(u32, StaticSecret, [u8; 32])> {
    (0..count)
        .map(|i| {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret).to_bytes();
            (start_id + i, secret, public)
        })
        .collect()
}
