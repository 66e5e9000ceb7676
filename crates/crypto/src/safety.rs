//! Safety numbers: a deterministic, symmetric fingerprint over two users'
//! identity keys.
//!
//! The keys are sorted before hashing so either party computes the same
//! value, then stretched through 5200 rounds of SHA-512. The first 30
//! digest bytes become a 60-digit decimal string rendered as 12 groups
//! of 5.

use {
    base64::Engine,
    serde::Serialize,
    sha2::{Digest, Sha512},
};

const DOMAIN: &[u8] = b"SCP_SAFETY_NUMBER_v1";
const ROUNDS: u32 = 5200;

/// Compute the safety number for a pair of identity keys.
///
/// Returns `(formatted, raw_digits)` — `formatted` is the 12×5 grouping of
/// `raw_digits`.
#[must_use]
pub fn safety_number(identity_key_a: &[u8], identity_key_b: &[u8]) -> (String, String) {
    let (first, second) = if identity_key_a <= identity_key_b {
        (identity_key_a, identity_key_b)
    } else {
        (identity_key_b, identity_key_a)
    };

    let mut combined = Vec::with_capacity(DOMAIN.len() + first.len() + second.len());
    combined.extend_from_slice(DOMAIN);
    combined.extend_from_slice(first);
    combined.extend_from_slice(second);

    let mut digest = combined.clone();
    for i in 0..ROUNDS {
        let mut hasher = Sha512::new();
        hasher.update(&digest);
        hasher.update(&combined);
        hasher.update(i.to_be_bytes());
        digest = hasher.finalize().to_vec();
    }

    let raw = digits_60(&digest[..30]);
    let formatted = raw
        .as_bytes()
        .chunks(5)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ");

    (formatted, raw)
}

/// Render a big-endian integer as its first 60 decimal digits,
/// left-padded with zeros when shorter.
fn digits_60(bytes: &[u8]) -> String {
    let mut quotient = bytes.to_vec();
    let mut digits = Vec::new();

    while quotient.iter().any(|&b| b != 0) {
        let mut remainder: u32 = 0;
        for byte in &mut quotient {
            let acc = remainder * 256 + u32::from(*byte);
            *byte = (acc / 10) as u8;
            remainder = acc % 10;
        }
        digits.push(b'0' + remainder as u8);
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    digits.reverse();

    let mut s = String::from_utf8(digits).unwrap_or_default();
    if s.len() < 60 {
        s = format!("{}{s}", "0".repeat(60 - s.len()));
    } else {
        s.truncate(60);
    }
    s
}

#[derive(Serialize)]
struct QrUser {
    id: i64,
    ik: String,
}

#[derive(Serialize)]
struct QrPayload {
    v: u8,
    users: Vec<QrUser>,
}

/// Compact JSON payload for QR-code verification, sorted by user id.
#[must_use]
pub fn safety_qr_data(
    identity_key_a: &[u8],
    user_id_a: i64,
    identity_key_b: &[u8],
    user_id_b: i64,
) -> String {
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut users = vec![
        QrUser {
            id: user_id_a,
            ik: b64.encode(identity_key_a),
        },
        QrUser {
            id: user_id_b,
            ik: b64.encode(identity_key_b),
        },
    ];
    users.sort_by_key(|u| u.id);
    serde_json::to_string(&QrPayload { v: 1, users }).unwrap_or_default()
}
