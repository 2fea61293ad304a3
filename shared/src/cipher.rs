//! Application packet cipher.
//!
//! A 32-round Feistel cipher over 64-bit blocks with a 128-bit key, applied
//! to packet payloads after the handshake. The buffer-level wrapper carries
//! a protocol quirk that must be kept as-is: buffers that are not a multiple
//! of eight bytes get one extra block pass over the *overlapping* tail at
//! `len - 8`, rather than any standard padding. Peers depend on that exact
//! behavior.

const DELTA: u32 = 0x9E37_79B9;
const DECRYPT_SUM: u32 = 0xC6EF_3720;

/// Key bytes as the four little-endian words the rounds consume.
fn key_words(key: &[u8; 16]) -> [u32; 4] {
    [
        u32::from_le_bytes([key[0], key[1], key[2], key[3]]),
        u32::from_le_bytes([key[4], key[5], key[6], key[7]]),
        u32::from_le_bytes([key[8], key[9], key[10], key[11]]),
        u32::from_le_bytes([key[12], key[13], key[14], key[15]]),
    ]
}

fn load_block(block: &[u8]) -> (u32, u32) {
    (
        u32::from_le_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_le_bytes([block[4], block[5], block[6], block[7]]),
    )
}

fn store_block(block: &mut [u8], y: u32, z: u32) {
    block[..4].copy_from_slice(&y.to_le_bytes());
    block[4..8].copy_from_slice(&z.to_le_bytes());
}

fn encrypt_block(block: &mut [u8], k: &[u32; 4]) {
    let (mut y, mut z) = load_block(block);
    let mut sum = 0u32;
    for _ in 0..32 {
        sum = sum.wrapping_add(DELTA);
        y = y.wrapping_add(
            (z << 4).wrapping_add(k[0]) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k[1]),
        );
        z = z.wrapping_add(
            (y << 4).wrapping_add(k[2]) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k[3]),
        );
    }
    store_block(block, y, z);
}

fn decrypt_block(block: &mut [u8], k: &[u32; 4]) {
    let (mut y, mut z) = load_block(block);
    let mut sum = DECRYPT_SUM;
    for _ in 0..32 {
        z = z.wrapping_sub(
            (y << 4).wrapping_add(k[2]) ^ y.wrapping_add(sum) ^ (y >> 5).wrapping_add(k[3]),
        );
        y = y.wrapping_sub(
            (z << 4).wrapping_add(k[0]) ^ z.wrapping_add(sum) ^ (z >> 5).wrapping_add(k[1]),
        );
        sum = sum.wrapping_sub(DELTA);
    }
    store_block(block, y, z);
}

/// Encrypts a buffer in place.
///
/// Whole blocks run front to back; a non-multiple length then gets one
/// overlapping block pass at `len - 8`, re-encrypting the tail of the last
/// whole block together with the leftover bytes. Buffers shorter than one
/// block are left untouched.
pub fn encrypt(data: &mut [u8], key: &[u8; 16]) {
    let k = key_words(key);
    let len = data.len();

    for chunk in data.chunks_exact_mut(8) {
        encrypt_block(chunk, &k);
    }
    if len % 8 != 0 && len >= 8 {
        encrypt_block(&mut data[len - 8..], &k);
    }
}

/// Decrypts a buffer in place; exact inverse of [`encrypt`].
///
/// The overlapping tail block is undone first, then the whole blocks.
pub fn decrypt(data: &mut [u8], key: &[u8; 16]) {
    let k = key_words(key);
    let len = data.len();

    if len % 8 != 0 && len >= 8 {
        decrypt_block(&mut data[len - 8..], &k);
    }
    for chunk in data.chunks_exact_mut(8) {
        decrypt_block(chunk, &k);
    }
}
