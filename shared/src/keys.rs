//! Session key ladder.
//!
//! Both ends of a connection derive a shared 16-byte key through a
//! Diffie-Hellman-style exchange over 128-bit integers: each side picks a
//! private exponent, publishes `3^private mod 0x10001`, and raises the
//! peer's public key to its own exponent. The arithmetic runs on
//! [`BigInt128`] with the exact double-and-add / square-and-multiply loops
//! the protocol uses, 128 rounds each, truncation and all.

use crate::bigint::BigInt128;

/// Fixed modulus of the ladder, as an ASCII hex string (0x10001 = 65537).
pub const MODULUS_HEX: &[u8] = b"10001";

/// Generator used when creating our own public key.
pub const BASE_HEX: &[u8] = b"3";

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Generates a fresh private key: 16 uppercase hex ASCII digits.
///
/// The generator is the same linear-congruential sequence the challenge
/// codec uses; production callers seed it from the wall clock.
pub fn create_randhash(mut seed: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    for byte in out.iter_mut() {
        seed = seed.wrapping_mul(0x343FD).wrapping_add(0x269EC3);
        *byte = HEX_DIGITS[((seed >> 16) & 15) as usize];
    }
    out
}

/// Modular multiply: `a = a * b mod modulus`, 128 double-and-add rounds.
///
/// Relies on `fix_check` keeping intermediate values below twice the
/// modulus; both inputs must already be reduced.
fn key_scramble(a: &mut BigInt128, b: &BigInt128, modulus: &BigInt128) {
    let mut bits = *a;
    let mut addend = *b;
    *a = BigInt128::ZERO;

    for _ in 0..128 {
        if bits.low_bit() {
            a.add_assign(&addend);
            a.fix_check(modulus);
        }
        bits.shr1_assign();
        addend.shl1_assign();
        addend.fix_check(modulus);
    }
}

/// Modular exponentiation: `base ^ exponent mod modulus` over hex inputs.
///
/// Square-and-multiply with the multiply above; the result starts at one
/// and every round squares the running base.
pub fn create_key(base_hex: &[u8], exponent_hex: &[u8], modulus_hex: &[u8]) -> [u8; 16] {
    let mut base = BigInt128::from_hex(base_hex);
    let mut exponent = BigInt128::from_hex(exponent_hex);
    let modulus = BigInt128::from_hex(modulus_hex);

    let mut out = BigInt128::ONE;
    for _ in 0..128 {
        if exponent.low_bit() {
            let multiplier = base;
            key_scramble(&mut out, &multiplier, &modulus);
        }
        let square = base;
        key_scramble(&mut base, &square, &modulus);
        exponent.shr1_assign();
    }
    out.to_bytes()
}

/// Our own public key for a private key: `3 ^ private mod 0x10001`.
pub fn derive_public_key(private_key: &[u8; 16]) -> [u8; 16] {
    create_key(BASE_HEX, private_key, MODULUS_HEX)
}

/// Shared key from our private key and the peer's raw public key.
///
/// The peer key goes through its big-endian hex encoding first; that is how
/// the ladder consumes it on the wire, leading zero bytes dropped.
pub fn derive_shared_key(private_key: &[u8; 16], peer_public: &[u8; 16]) -> [u8; 16] {
    let peer_hex = BigInt128::from_bytes(*peer_public).to_hex();
    create_key(peer_hex.as_bytes(), private_key, MODULUS_HEX)
}

/// Full key material for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// 16 uppercase hex ASCII digits; never leaves the process.
    pub private_key: [u8; 16],
    /// Raw big-endian bytes of `3 ^ private mod 0x10001`, sent to the peer.
    pub public_key: [u8; 16],
    /// Key used to encrypt outbound payloads.
    pub enc_key: [u8; 16],
    /// Key used to decrypt inbound payloads.
    pub dec_key: [u8; 16],
}

impl SessionKeys {
    /// Derives the whole key set from the peer's public key.
    ///
    /// The protocol runs the ladder twice for the two directions but the
    /// inputs are identical, so the shared key is computed once and copied
    /// into both fields.
    pub fn derive(peer_public: &[u8; 16], seed: u32) -> Self {
        let private_key = create_randhash(seed);
        let public_key = derive_public_key(&private_key);
        let shared = derive_shared_key(&private_key, peer_public);
        Self {
            private_key,
            public_key,
            enc_key: shared,
            dec_key: shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_u128(bytes: [u8; 16]) -> u128 {
        u128::from_be_bytes(bytes)
    }

    #[test]
    fn test_randhash_is_uppercase_hex() {
        let hash = create_randhash(42);
        for &byte in &hash {
            assert!(byte.is_ascii_hexdigit());
            assert!(!byte.is_ascii_lowercase());
        }
    }

    #[test]
    fn test_randhash_is_deterministic_per_seed() {
        assert_eq!(create_randhash(7), create_randhash(7));
        assert_ne!(create_randhash(7), create_randhash(8));
    }

    #[test]
    fn test_create_key_small_powers() {
        // 3^4 mod 0x10001 = 81
        assert_eq!(to_u128(create_key(b"3", b"4", MODULUS_HEX)), 81);
        // 3^0 = 1
        assert_eq!(to_u128(create_key(b"3", b"", MODULUS_HEX)), 1);
        // 2^16 mod 0x10001 = 65536
        assert_eq!(to_u128(create_key(b"2", b"10", MODULUS_HEX)), 0x10000);
        // 2^17 mod 0x10001 = 65535 (wraps past the modulus once)
        assert_eq!(to_u128(create_key(b"2", b"11", MODULUS_HEX)), 0xFFFF);
    }

    #[test]
    fn test_public_key_fits_modulus() {
        for seed in 0..16u32 {
            let private = create_randhash(seed);
            let public = to_u128(derive_public_key(&private));
            assert!(public < 0x10001, "public key {public:#x} exceeds the modulus");
        }
    }

    #[test]
    fn test_shared_key_agreement() {
        // Two independent sides must land on the same shared key; this is
        // the property the whole exchange exists for.
        let private_a = create_randhash(1000);
        let private_b = create_randhash(2000);
        let public_a = derive_public_key(&private_a);
        let public_b = derive_public_key(&private_b);

        let shared_a = derive_shared_key(&private_a, &public_b);
        let shared_b = derive_shared_key(&private_b, &public_a);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn test_session_keys_match_both_directions() {
        let peer_private = create_randhash(31337);
        let peer_public = derive_public_key(&peer_private);

        let keys = SessionKeys::derive(&peer_public, 555);
        assert_eq!(keys.enc_key, keys.dec_key);
        assert_eq!(keys.public_key, derive_public_key(&keys.private_key));
        assert_eq!(keys.enc_key, derive_shared_key(&keys.private_key, &peer_public));
    }
}
