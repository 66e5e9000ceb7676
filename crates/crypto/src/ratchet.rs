//! Double Ratchet state machine for a single peer session.
//!
//! Root-chain steps use HKDF-SHA-512 keyed by the current root key; the
//! symmetric chains advance with HMAC-SHA-512 under distinct constants so
//! chain keys and message keys stay independent. Message keys are consumed
//! once; keys for skipped (out-of-order) messages are retained up to
//! [`MAX_SKIP`] per chain, and exceeding the cap aborts decryption.
//!
//! Serialized state is sensitive key material. The server never calls into
//! this module for stored sessions — it persists the blob opaquely.

use {
    hkdf::Hkdf,
    hmac::{Hmac, Mac},
    rand::rngs::OsRng,
    serde::{Deserialize, Serialize},
    sha2::Sha512,
    std::collections::HashMap,
    x25519_dalek::{PublicKey as X25519Public, StaticSecret},
    zeroize::Zeroize,
};

use crate::{aead, error::CryptoError};

/// Max messages that may be skipped within a single receiving chain.
pub const MAX_SKIP: u32 = 1000;

const HEADER_PREFIX: &[u8] = b"SCP_HDR_v1";
const ROOT_CHAIN_INFO: &[u8] = b"SCP_ROOT_CHAIN_v1";
const CHAIN_CONST: &[u8] = b"\x01SCP_CHAIN";
const MSG_CONST: &[u8] = b"\x02SCP_MSG";

type HmacSha512 = Hmac<Sha512>;

// ── Message header ───────────────────────────────────────────────────────────

/// Plaintext header sent with each message and bound as AAD, so header
/// tampering fails authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub dh_public: [u8; 32],
    pub previous_chain_length: u32,
    pub message_number: u32,
}

impl MessageHeader {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_PREFIX.len() + 32 + 8);
        out.extend_from_slice(HEADER_PREFIX);
        out.extend_from_slice(&self.dh_public);
        out.extend_from_slice(&self.previous_chain_length.to_be_bytes());
        out.extend_from_slice(&self.message_number.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        let expected = HEADER_PREFIX.len() + 32 + 8;
        if data.len() < expected || &data[..HEADER_PREFIX.len()] != HEADER_PREFIX {
            return Err(CryptoError::Ratchet("invalid message header".into()));
        }
        let mut dh_public = [0u8; 32];
        dh_public.copy_from_slice(&data[10..42]);
        let pn = u32::from_be_bytes(
            data[42..46]
                .try_into()
                .map_err(|_| CryptoError::Ratchet("truncated header".into()))?,
        );
        let n = u32::from_be_bytes(
            data[46..50]
                .try_into()
                .map_err(|_| CryptoError::Ratchet("truncated header".into()))?,
        );
        Ok(Self {
            dh_public,
            previous_chain_length: pn,
            message_number: n,
        })
    }
}

// ── KDFs ─────────────────────────────────────────────────────────────────────

fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha512>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(ROOT_CHAIN_INFO, &mut okm)
        .map_err(|e| CryptoError::Ratchet(format!("HKDF expand: {e}")))?;
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((new_root, chain))
}

fn kdf_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let prf = |constant: &[u8]| -> Result<[u8; 32], CryptoError> {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(chain_key)
            .map_err(|e| CryptoError::Ratchet(e.to_string()))?;
        mac.update(constant);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);
        Ok(out)
    };
    Ok((prf(CHAIN_CONST)?, prf(MSG_CONST)?))
}

// ── Ratchet state ────────────────────────────────────────────────────────────

pub struct DoubleRatchet {
    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    sending_ratchet: StaticSecret,
    sending_ratchet_pub: [u8; 32],
    receiving_ratchet_pub: Option<[u8; 32]>,
    send_count: u32,
    recv_count: u32,
    previous_send_count: u32,
    /// (remote ratchet key hex, message number) → message key.
    skipped: HashMap<(String, u32), [u8; 32]>,
}

impl DoubleRatchet {
    /// Initialize as the session initiator, ratcheting against the
    /// receiver's signed prekey.
    pub fn init_sender(
        shared_secret: &[u8; 32],
        receiver_ratchet_pub: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let sending_ratchet = StaticSecret::random_from_rng(OsRng);
        let sending_ratchet_pub = X25519Public::from(&sending_ratchet).to_bytes();

        let dh_out = sending_ratchet
            .diffie_hellman(&X25519Public::from(*receiver_ratchet_pub))
            .to_bytes();
        let (root_key, sending_chain_key) = kdf_root(shared_secret, &dh_out)?;

        Ok(Self {
            root_key,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            sending_ratchet,
            sending_ratchet_pub,
            receiving_ratchet_pub: Some(*receiver_ratchet_pub),
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped: HashMap::new(),
        })
    }

    /// Initialize as the responder, seeding the ratchet with our signed
    /// prekey secret. Chains start on the first received message.
    #[must_use]
    pub fn init_receiver(shared_secret: &[u8; 32], our_ratchet_secret: StaticSecret) -> Self {
        let sending_ratchet_pub = X25519Public::from(&our_ratchet_secret).to_bytes();
        Self {
            root_key: *shared_secret,
            sending_chain_key: None,
            receiving_chain_key: None,
            sending_ratchet: our_ratchet_secret,
            sending_ratchet_pub,
            receiving_ratchet_pub: None,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped: HashMap::new(),
        }
    }

    /// Encrypt a message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(MessageHeader, Vec<u8>), CryptoError> {
        let chain = self
            .sending_chain_key
            .ok_or_else(|| CryptoError::Ratchet("sending chain not initialized".into()))?;
        let (next_chain, mut message_key) = kdf_chain(&chain)?;
        self.sending_chain_key = Some(next_chain);

        let header = MessageHeader {
            dh_public: self.sending_ratchet_pub,
            previous_chain_length: self.previous_send_count,
            message_number: self.send_count,
        };
        self.send_count += 1;

        let ciphertext = aead::encrypt(&message_key, plaintext, &header.encode())?;
        message_key.zeroize();
        Ok((header, ciphertext))
    }

    /// Decrypt a received message, performing DH ratchet steps and skipped-key
    /// bookkeeping as needed.
    pub fn decrypt(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        // Out-of-order message whose key was already derived.
        let skip_key = (hex::encode(header.dh_public), header.message_number);
        if let Some(mut message_key) = self.skipped.remove(&skip_key) {
            let plaintext = aead::decrypt(&message_key, ciphertext, &header.encode())?;
            message_key.zeroize();
            return Ok(plaintext);
        }

        if self.receiving_ratchet_pub != Some(header.dh_public) {
            self.skip_messages(header.previous_chain_length)?;
            self.dh_ratchet(&header.dh_public)?;
        }

        self.skip_messages(header.message_number)?;

        let chain = self
            .receiving_chain_key
            .ok_or_else(|| CryptoError::Ratchet("receiving chain not initialized".into()))?;
        let (next_chain, mut message_key) = kdf_chain(&chain)?;
        self.receiving_chain_key = Some(next_chain);
        self.recv_count += 1;

        let plaintext = aead::decrypt(&message_key, ciphertext, &header.encode())?;
        message_key.zeroize();
        Ok(plaintext)
    }

    fn dh_ratchet(&mut self, new_remote_public: &[u8; 32]) -> Result<(), CryptoError> {
        self.previous_send_count = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;
        self.receiving_ratchet_pub = Some(*new_remote_public);

        let dh_recv = self
            .sending_ratchet
            .diffie_hellman(&X25519Public::from(*new_remote_public))
            .to_bytes();
        let (root, recv_chain) = kdf_root(&self.root_key, &dh_recv)?;
        self.root_key = root;
        self.receiving_chain_key = Some(recv_chain);

        self.sending_ratchet = StaticSecret::random_from_rng(OsRng);
        self.sending_ratchet_pub = X25519Public::from(&self.sending_ratchet).to_bytes();

        let dh_send = self
            .sending_ratchet
            .diffie_hellman(&X25519Public::from(*new_remote_public))
            .to_bytes();
        let (root, send_chain) = kdf_root(&self.root_key, &dh_send)?;
        self.root_key = root;
        self.sending_chain_key = Some(send_chain);
        Ok(())
    }

    fn skip_messages(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(mut chain) = self.receiving_chain_key else {
            return Ok(());
        };
        let Some(remote_pub) = self.receiving_ratchet_pub else {
            return Ok(());
        };

        if until > self.recv_count && until - self.recv_count > MAX_SKIP {
            return Err(CryptoError::Ratchet(format!(
                "cannot skip {} messages (max {MAX_SKIP})",
                until - self.recv_count
            )));
        }

        let remote_hex = hex::encode(remote_pub);
        while self.recv_count < until {
            let (next_chain, message_key) = kdf_chain(&chain)?;
            self.skipped
                .insert((remote_hex.clone(), self.recv_count), message_key);
            chain = next_chain;
            self.recv_count += 1;
        }
        self.receiving_chain_key = Some(chain);
        Ok(())
    }

    /// Serialize state for client-side encrypted storage.
    ///
    /// The output is key material; callers must seal it before persisting.
    pub fn serialize(&self) -> Result<Vec<u8>, CryptoError> {
        let state = SerializedState {
            v: 1,
            rk: hex::encode(self.root_key),
            sck: self.sending_chain_key.map(hex::encode),
            rck: self.receiving_chain_key.map(hex::encode),
            srp: hex::encode(self.sending_ratchet.to_bytes()),
            sru: hex::encode(self.sending_ratchet_pub),
            rrp: self.receiving_ratchet_pub.map(hex::encode),
            sc: self.send_count,
            rc: self.recv_count,
            psc: self.previous_send_count,
            sk: self
                .skipped
                .iter()
                .map(|((pub_hex, n), mk)| (format!("{pub_hex}:{n}"), hex::encode(mk)))
                .collect(),
        };
        serde_json::to_vec(&state).map_err(|e| CryptoError::Ratchet(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, CryptoError> {
        let state: SerializedState =
            serde_json::from_slice(data).map_err(|e| CryptoError::Ratchet(e.to_string()))?;
        if state.v != 1 {
            return Err(CryptoError::Ratchet(format!(
                "unsupported ratchet serialization version: {}",
                state.v
            )));
        }

        let secret_bytes = decode_key32(&state.srp)?;
        let mut skipped = HashMap::new();
        for (key, mk_hex) in &state.sk {
            let (pub_hex, n) = key
                .rsplit_once(':')
                .ok_or_else(|| CryptoError::Ratchet("corrupt skipped-key entry".into()))?;
            let n: u32 = n
                .parse()
                .map_err(|_| CryptoError::Ratchet("corrupt skipped-key index".into()))?;
            skipped.insert((pub_hex.to_string(), n), decode_key32(mk_hex)?);
        }

        Ok(Self {
            root_key: decode_key32(&state.rk)?,
            sending_chain_key: state.sck.as_deref().map(decode_key32).transpose()?,
            receiving_chain_key: state.rck.as_deref().map(decode_key32).transpose()?,
            sending_ratchet: StaticSecret::from(secret_bytes),
            sending_ratchet_pub: decode_key32(&state.sru)?,
            receiving_ratchet_pub: state.rrp.as_deref().map(decode_key32).transpose()?,
            send_count: state.sc,
            recv_count: state.rc,
            previous_send_count: state.psc,
            skipped,
        })
    }

    #[must_use]
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }
}

fn decode_key32(hex_str: impl AsRef<[u8]>) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|e| CryptoError::Ratchet(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| CryptoError::Ratchet("key is not 32 bytes".into()))
}

#[derive(Serialize, Deserialize)]
struct SerializedState {
    v: u8,
    rk: String,
    sck: Option<String>,
    rck: Option<String>,
    srp: String,
    sru: String,
    rrp: Option<String>,
    sc: u32,
    rc: u32,
    psc: u32,
    sk: HashMap<String, String>,
}
