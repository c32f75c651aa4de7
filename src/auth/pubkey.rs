//! The Android public-key blob (`AUTH_RSAPUBLICKEY` payload), a
//! non-standard encoding carrying the Montgomery metadata the device
//! needs to verify signatures quickly (spec §4.C).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use num_bigint::BigUint;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;

/// 2048-bit modulus, in bytes.
const MODULUS_SIZE: usize = 256;
/// Modulus size in 32-bit words, as stored in the blob's `len` field.
const MODULUS_WORDS: u32 = (MODULUS_SIZE / 4) as u32;

/// `n0inv`: the 32-bit integer with `n[0] * n0inv ≡ -1 (mod 2^32)`,
/// computed via the extended Euclidean algorithm on the low word of the
/// modulus (spec §4.C, invariant 6).
fn n0inv(n0: u32) -> u32 {
    0u32.wrapping_sub(mod_inverse_u32(n0))
}

/// Modular inverse of `a` modulo 2^32, via the extended Euclidean
/// algorithm over `i64` (wide enough to hold 2^32 without overflow).
fn mod_inverse_u32(a: u32) -> u32 {
    let modulus: i64 = 1i64 << 32;
    let (mut old_r, mut r) = (a as i64, modulus);
    let (mut old_s, mut s) = (1i64, 0i64);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_s, s) = (s, old_s - q * s);
    }
    debug_assert_eq!(old_r, 1, "modulus low word must be odd (it's the low word of an RSA modulus)");
    (old_s.rem_euclid(modulus)) as u32
}

/// Build the 524-byte Android public-key blob for a 2048-bit key, then
/// base64-encode it and append the space-separated identifier and NUL
/// terminator the device expects in the AUTH payload (spec §4.C).
pub fn encode(key: &RsaPrivateKey) -> String {
    // `rsa::BigUint` is a distinct (num-bigint-dig) type from the
    // `num-bigint` crate used for the Montgomery constants below; cross
    // the boundary once via big-endian bytes.
    let n = BigUint::from_bytes_be(&key.n().to_bytes_be());
    let e_val: u32 = key.e().to_bytes_be().iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);

    let n_bytes_le = {
        let mut bytes = n.to_bytes_le();
        bytes.resize(MODULUS_SIZE, 0);
        bytes
    };
    let n0 = u32::from_le_bytes(n_bytes_le[0..4].try_into().unwrap());

    // R = 2^(modulus bits); rr = R^2 mod n.
    let exponent = BigUint::from((MODULUS_SIZE * 8 * 2) as u32);
    let rr = BigUint::from(2u32).modpow(&exponent, &n);
    let rr_bytes_le = {
        let mut bytes = rr.to_bytes_le();
        bytes.resize(MODULUS_SIZE, 0);
        bytes
    };

    let mut blob = Vec::with_capacity(4 + 4 + MODULUS_SIZE + MODULUS_SIZE + 4);
    blob.extend_from_slice(&MODULUS_WORDS.to_le_bytes());
    blob.extend_from_slice(&n0inv(n0).to_le_bytes());
    blob.extend_from_slice(&n_bytes_le);
    blob.extend_from_slice(&rr_bytes_le);
    blob.extend_from_slice(&e_val.to_le_bytes());

    format!("{} adb@webusb\0", BASE64_STANDARD.encode(&blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn test_key() -> RsaPrivateKey {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 2048).unwrap()
    }

    #[test]
    fn blob_length_is_524_bytes() {
        let key = test_key();
        let blob = encode(&key);
        let encoded = blob.strip_suffix(" adb@webusb\0").unwrap();
        let raw = BASE64_STANDARD.decode(encoded).unwrap();
        assert_eq!(raw.len(), 4 + 4 + MODULUS_SIZE + MODULUS_SIZE + 4);
    }

    #[test]
    fn n0inv_satisfies_invariant() {
        let key = test_key();
        let n = key.n();
        let mut n_bytes = n.to_bytes_le();
        n_bytes.resize(MODULUS_SIZE, 0);
        let n0 = u32::from_le_bytes(n_bytes[0..4].try_into().unwrap());
        let inv = n0inv(n0);
        // n[0] * n0inv mod 2^32 == 2^32 - 1, i.e. -1.
        let product = (n0 as u64).wrapping_mul(inv as u64) as u32;
        assert_eq!(product, u32::MAX);
    }

    #[test]
    fn blob_ends_with_identifier_and_nul() {
        let key = test_key();
        let blob = encode(&key);
        assert!(blob.ends_with(" adb@webusb\0"));
    }
}
