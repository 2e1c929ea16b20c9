//! PBKDF2 password encoding and verification.
//!
//! Encoded form: `pbkdf2$<hash>$<iterations>$<saltLen>$<salt>$<digest>` with
//! salt and digest hex-encoded. New hashes use HMAC-SHA256; `sha1` and
//! `sha512` digests verify for compatibility with imported rows.

use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;

const ALGORITHM: &str = "sha256";
const ITERATIONS: u32 = 10_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Hash a plaintext password into the encoded form.
pub fn hash(plaintext: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = derive(ALGORITHM, plaintext.as_bytes(), &salt, ITERATIONS, KEY_LEN)
        .expect("default algorithm is always available");
    format!(
        "pbkdf2${ALGORITHM}${ITERATIONS}${SALT_LEN}${}${}",
        hex::encode(salt),
        hex::encode(digest)
    )
}

/// Re-derive and compare in constant time. Any malformed input is invalid,
/// never an error.
pub fn is_valid(encoded: &str, plaintext: &str) -> bool {
    let Some((algorithm, iterations, salt, digest)) = parse(encoded) else {
        return false;
    };
    let Some(candidate) = derive(algorithm, plaintext.as_bytes(), &salt, iterations, digest.len())
    else {
        return false;
    };
    constant_time_eq(&candidate, &digest)
}

fn parse(encoded: &str) -> Option<(&str, u32, Vec<u8>, Vec<u8>)> {
    let mut parts = encoded.split('$');
    if parts.next()? != "pbkdf2" {
        return None;
    }
    let algorithm = parts.next()?;
    let iterations: u32 = parts.next()?.parse().ok()?;
    let salt_len: usize = parts.next()?.parse().ok()?;
    let salt = hex::decode(parts.next()?).ok()?;
    if salt.len() != salt_len {
        return None;
    }
    let digest = hex::decode(parts.next()?).ok()?;
    if digest.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((algorithm, iterations, salt, digest))
}

fn derive(
    algorithm: &str,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    key_len: usize,
) -> Option<Vec<u8>> {
    let mut out = vec![0u8; key_len];
    match algorithm {
        "sha1" => pbkdf2_hmac::<sha1::Sha1>(password, salt, iterations, &mut out),
        "sha256" => pbkdf2_hmac::<sha2::Sha256>(password, salt, iterations, &mut out),
        "sha512" => pbkdf2_hmac::<sha2::Sha512>(password, salt, iterations, &mut out),
        _ => return None,
    }
    Some(out)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let encoded = hash("Welcome!");
        assert!(encoded.starts_with("pbkdf2$sha256$10000$16$"));
        assert!(is_valid(&encoded, "Welcome!"));
        assert!(!is_valid(&encoded, "welcome!"));
    }

    #[test]
    fn salts_differ_between_hashes() {
        assert_ne!(hash("same"), hash("same"));
    }

    #[test]
    fn malformed_encodings_are_invalid() {
        assert!(!is_valid("", "x"));
        assert!(!is_valid("plaintext", "plaintext"));
        assert!(!is_valid("pbkdf2$sha256$notanumber$16$00$00", "x"));
        assert!(!is_valid("pbkdf2$whirlpool$1$1$00$00", "x"));
    }

    #[test]
    fn tampered_digest_fails() {
        let encoded = hash("secret");
        let mut tampered = encoded.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(!is_valid(&tampered, "secret"));
    }
}
