//! AES-128-CTR stream cipher for WAL segments.
//!
//! Each segment gets its own counter block derived from the internal key's
//! base IV, the timeline and the segment number. The keystream is seeked to
//! the byte offset inside the segment, so any block-aligned slice of a
//! segment can be processed on its own and encryption equals decryption.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

/// Internal key length.
pub const INTERNAL_KEY_LEN: usize = 16;

/// Base IV length.
pub const BASE_IV_LEN: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Derives the counter block of segment `(tli, segno)`.
#[must_use]
pub fn segment_iv(base_iv: &[u8; BASE_IV_LEN], tli: u32, segno: u64) -> [u8; BASE_IV_LEN] {
    let mut iv = *base_iv;
    for (byte, mask) in iv[..4].iter_mut().zip(tli.to_be_bytes()) {
        *byte ^= mask;
    }
    for (byte, mask) in iv[4..12].iter_mut().zip(segno.to_be_bytes()) {
        *byte ^= mask;
    }
    iv
}

/// Encrypts or decrypts `data` in place, where `data` starts at byte
/// `offset` of segment `(tli, segno)`.
pub fn crypt_segment(
    key: &[u8; INTERNAL_KEY_LEN],
    base_iv: &[u8; BASE_IV_LEN],
    tli: u32,
    segno: u64,
    offset: u64,
    data: &mut [u8],
) {
    let iv = segment_iv(base_iv, tli, segno);
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.seek(offset);
    cipher.apply_keystream(data);
}
