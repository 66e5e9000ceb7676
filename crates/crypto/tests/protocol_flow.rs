//! Full protocol flow: X3DH agreement feeding a Double Ratchet session,
//! the way two clients would establish and run a conversation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use {
    rand::rngs::OsRng,
    sotto_crypto::{
        DoubleRatchet,
        bundle::IdentityKeys,
        x3dh,
    },
    x25519_dalek::{PublicKey as X25519Public, StaticSecret},
};

struct Party {
    identity: IdentityKeys,
    signed_prekey: StaticSecret,
    signed_prekey_pub: [u8; 32],
    one_time_prekey: StaticSecret,
    one_time_prekey_pub: [u8; 32],
}

impl Party {
    fn new() -> Self {
        let identity = IdentityKeys::generate();
        let signed_prekey = StaticSecret::random_from_rng(OsRng);
        let signed_prekey_pub = X25519Public::from(&signed_prekey).to_bytes();
        let one_time_prekey = StaticSecret::random_from_rng(OsRng);
        let one_time_prekey_pub = X25519Public::from(&one_time_prekey).to_bytes();
        Self {
            identity,
            signed_prekey,
            signed_prekey_pub,
            one_time_prekey,
            one_time_prekey_pub,
        }
    }
}

/// X3DH on both sides, then ratchet init: Alice as initiator against Bob's
/// published bundle.
fn establish(with_one_time_prekey: bool) -> (DoubleRatchet, DoubleRatchet) {
    let alice = Party::new();
    let bob = Party::new();

    let alice_ephemeral = StaticSecret::random_from_rng(OsRng);
    let alice_ephemeral_pub = X25519Public::from(&alice_ephemeral).to_bytes();

    let sender_secret = x3dh::sender_shared_secret(
        &alice.identity.dh_secret,
        &alice_ephemeral,
        &bob.identity.dh_public(),
        &bob.signed_prekey_pub,
        with_one_time_prekey.then_some(&bob.one_time_prekey_pub),
    )
    .unwrap();

    let receiver_secret = x3dh::receiver_shared_secret(
        &bob.identity.dh_secret,
        &bob.signed_prekey,
        &alice.identity.dh_public(),
        &alice_ephemeral_pub,
        with_one_time_prekey.then_some(&bob.one_time_prekey),
    )
    .unwrap();

    assert_eq!(sender_secret, receiver_secret);

    let alice_ratchet = DoubleRatchet::init_sender(&sender_secret, &bob.signed_prekey_pub).unwrap();
    let bob_ratchet = DoubleRatchet::init_receiver(&receiver_secret, bob.signed_prekey);
    (alice_ratchet, bob_ratchet)
}

#[test]
fn conversation_with_one_time_prekey() {
    let (mut alice, mut bob) = establish(true);

    let (h, ct) = alice.encrypt(b"ciao bob").unwrap();
    assert_eq!(bob.decrypt(&h, &ct).unwrap(), b"ciao bob");

    let (h, ct) = bob.encrypt(b"ciao alice").unwrap();
    assert_eq!(alice.decrypt(&h, &ct).unwrap(), b"ciao alice");
}

#[test]
fn conversation_without_one_time_prekey() {
    let (mut alice, mut bob) = establish(false);

    for round in 0..3 {
        let message = format!("round {round}");
        let (h, ct) = alice.encrypt(message.as_bytes()).unwrap();
        assert_eq!(bob.decrypt(&h, &ct).unwrap(), message.as_bytes());
        let (h, ct) = bob.encrypt(message.as_bytes()).unwrap();
        assert_eq!(alice.decrypt(&h, &ct).unwrap(), message.as_bytes());
    }
}

#[test]
fn per_sender_order_survives_interleaving() {
    let (mut alice, mut bob) = establish(true);

    // Alice sends a burst; Bob replies before reading all of it. Deliveries
    // within each sender stay in order, which is all the protocol promises.
    let (h1, ct1) = alice.encrypt(b"one").unwrap();
    let (h2, ct2) = alice.encrypt(b"two").unwrap();
    assert_eq!(bob.decrypt(&h1, &ct1).unwrap(), b"one");

    let (hr, ctr) = bob.encrypt(b"reply").unwrap();
    assert_eq!(alice.decrypt(&hr, &ctr).unwrap(), b"reply");

    // The second burst message still decrypts after the ratchet turned.
    assert_eq!(bob.decrypt(&h2, &ct2).unwrap(), b"two");

    let (h3, ct3) = alice.encrypt(b"three").unwrap();
    assert_eq!(bob.decrypt(&h3, &ct3).unwrap(), b"three");
}

#[test]
fn distinct_sessions_cannot_read_each_other() {
    let (mut alice, _) = establish(true);
    let (_, mut mallory) = establish(true);

    let (h, ct) = alice.encrypt(b"secret").unwrap();
    assert!(mallory.decrypt(&h, &ct).is_err());
}
