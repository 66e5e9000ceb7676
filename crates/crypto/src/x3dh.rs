//! X3DH key agreement (crypto version 2: X25519 throughout).
//!
//! Three or four DH operations depending on whether a one-time prekey was
//! consumed, concatenated and run through HKDF-SHA-512 with the protocol's
//! domain-separation string. Sender and receiver must derive the same
//! 32-byte shared secret.

use {
    hkdf::Hkdf,
    sha2::Sha512,
    x25519_dalek::{PublicKey as X25519Public, StaticSecret},
};

use crate::error::CryptoError;

const DOMAIN_INFO: &[u8] = b"SCP_X3DH_SharedSecret_v1";
pub const SHARED_SECRET_LEN: usize = 32;

fn derive(ikm: &[u8]) -> Result<[u8; SHARED_SECRET_LEN], CryptoError> {
    let zero_salt = [0u8; 32];
    let hk = Hkdf::<Sha512>::new(Some(&zero_salt), ikm);
    let mut okm = [0u8; SHARED_SECRET_LEN];
    hk.expand(DOMAIN_INFO, &mut okm)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand: {e}")))?;
    Ok(okm)
}

fn dh(secret: &StaticSecret, public: &[u8; 32]) -> [u8; 32] {
    secret
        .diffie_hellman(&X25519Public::from(*public))
        .to_bytes()
}

/// Sender-side agreement against the receiver's published bundle.
pub fn sender_shared_secret(
    sender_identity_dh: &StaticSecret,
    sender_ephemeral: &StaticSecret,
    receiver_identity_dh_public: &[u8; 32],
    receiver_signed_prekey_public: &[u8; 32],
    receiver_one_time_prekey_public: Option<&[u8; 32]>,
) -> Result<[u8; SHARED_SECRET_LEN], CryptoError> {
    let dh1 = dh(sender_identity_dh, receiver_signed_prekey_public);
    let dh2 = dh(sender_ephemeral, receiver_identity_dh_public);
    let dh3 = dh(sender_ephemeral, receiver_signed_prekey_public);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(otpk) = receiver_one_time_prekey_public {
        ikm.extend_from_slice(&dh(sender_ephemeral, otpk));
    }

    derive(&ikm)
}

/// Receiver-side agreement; the mirror of [`sender_shared_secret`].
pub fn receiver_shared_secret(
    receiver_identity_dh: &StaticSecret,
    receiver_signed_prekey: &StaticSecret,
    sender_identity_dh_public: &[u8; 32],
    sender_ephemeral_public: &[u8; 32],
    receiver_one_time_prekey: Option<&StaticSecret>,
) -> Result<[u8; SHARED_SECRET_LEN], CryptoError> {
    let dh1 = dh(receiver_signed_prekey, sender_identity_dh_public);
    let dh2 = dh(receiver_identity_dh, sender_ephemeral_public);
    let dh3 = dh(receiver_signed_prekey, sender_ephemeral_public);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(otpk) = receiver_one_time_prekey {
        ikm.extend_from_slice(&dh(otpk, sender_ephemeral_public));
    }

    derive(&ikm)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {super::*, rand::rngs::OsRng};

    fn keypair() -> (StaticSecret, [u8; 32]) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        (secret, public)
    }

    #[test]
    fn shared_secret_matches_without_one_time_prekey() {
        let (a_id, a_id_pub) = keypair();
        let (a_eph, a_eph_pub) = keypair();
        let (b_id, b_id_pub) = keypair();
        let (b_spk, b_spk_pub) = keypair();

        let sender = sender_shared_secret(&a_id, &a_eph, &b_id_pub, &b_spk_pub, None).unwrap();
        let receiver =
            receiver_shared_secret(&b_id, &b_spk, &a_id_pub, &a_eph_pub, None).unwrap();
        assert_eq!(sender, receiver);
    }

    #[test]
    fn shared_secret_matches_with_one_time_prekey() {
        let (a_id, a_id_pub) = keypair();
        let (a_eph, a_eph_pub) = keypair();
        let (b_id, b_id_pub) = keypair();
        let (b_spk, b_spk_pub) = keypair();
        let (b_otpk, b_otpk_pub) = keypair();

        let sender =
            sender_shared_secret(&a_id, &a_eph, &b_id_pub, &b_spk_pub, Some(&b_otpk_pub)).unwrap();
        let receiver =
            receiver_shared_secret(&b_id, &b_spk, &a_id_pub, &a_eph_pub, Some(&b_otpk)).unwrap();
        assert_eq!(sender, receiver);
    }

    #[test]
    fn one_time_prekey_changes_the_secret() {
        let (a_id, _) = keypair();
        let (a_eph, _) = keypair();
        let (_, b_id_pub) = keypair();
        let (_, b_spk_pub) = keypair();
        let (_, b_otpk_pub) = keypair();

        let without = sender_shared_secret(&a_id, &a_eph, &b_id_pub, &b_spk_pub, None).unwrap();
        let with =
            sender_shared_secret(&a_id, &a_eph, &b_id_pub, &b_spk_pub, Some(&b_otpk_pub)).unwrap();
        assert_ne!(without, with);
    }
}
