//! 7-in-8 sentinel framing for the data plane.
//!
//! Every group of 7 raw bytes (56 bits) is repacked into 8 septets, each
//! carried in a byte whose top bit is clear, and prefixed with the sentinel:
//!
//! ```text
//! ┌──────┬────────┬────────┬─────┬────────┐
//! │ 0xFF │ 0bbbbbbb│ 0bbbbbbb│ ... │ 0bbbbbbb│   9 bytes per 7 raw bytes
//! │ sent │ bits 0-6│ bits 7-13│    │ bits 49-55│
//! └──────┴────────┴────────┴─────┴────────┘
//! ```
//!
//! Bits are taken most significant first. Because no septet byte can reach
//! `0x80`, the sentinel `0xFF` marks group starts on a channel that has no
//! escaping of its own.
//!
//! # Example
//!
//! ```
//! use blueteeth::codec::{decode, encode, SENTINEL};
//!
//! let raw = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
//! let framed = encode(&raw).unwrap();
//! assert_eq!(framed.len(), 9);
//! assert_eq!(framed[0], SENTINEL);
//! assert_eq!(decode(&framed).unwrap(), raw);
//! ```

use crate::error::{BlueteethError, Result};

/// Frame start marker. Never appears inside an encoded group.
pub const SENTINEL: u8 = 0xFF;

/// Raw bytes carried by one group.
pub const RAW_GROUP_SIZE: usize = 7;

/// Septets emitted per group (excluding the sentinel).
pub const SEPTETS_PER_GROUP: usize = 8;

/// Encoded size of one group (sentinel + septets).
pub const ENCODED_GROUP_SIZE: usize = 1 + SEPTETS_PER_GROUP;

const SEPTET_MASK: u8 = 0x7F;

/// Repack one 7-byte group into 8 septets.
#[inline]
pub fn encode_group(raw: &[u8; RAW_GROUP_SIZE]) -> [u8; SEPTETS_PER_GROUP] {
    let mut bits = [0u8; 8];
    bits[1..].copy_from_slice(raw);
    let acc = u64::from_be_bytes(bits);

    let mut out = [0u8; SEPTETS_PER_GROUP];
    for (i, septet) in out.iter_mut().enumerate() {
        let shift = 7 * (SEPTETS_PER_GROUP - 1 - i);
        *septet = ((acc >> shift) as u8) & SEPTET_MASK;
    }
    out
}

/// Reassemble 7 raw bytes from 8 septets.
///
/// Returns `None` if any septet has its top bit set.
#[inline]
pub fn decode_group(septets: &[u8; SEPTETS_PER_GROUP]) -> Option<[u8; RAW_GROUP_SIZE]> {
    let mut acc = 0u64;
    for &septet in septets {
        if septet & !SEPTET_MASK != 0 {
            return None;
        }
        acc = (acc << 7) | u64::from(septet);
    }

    let bytes = acc.to_be_bytes();
    let mut raw = [0u8; RAW_GROUP_SIZE];
    raw.copy_from_slice(&bytes[1..]);
    Some(raw)
}

/// Encoded length for `raw_len` input bytes (`raw_len` must be a multiple of 7).
#[inline]
pub fn encoded_len(raw_len: usize) -> usize {
    ENCODED_GROUP_SIZE * (raw_len / RAW_GROUP_SIZE)
}

/// Zero-pad `data` up to the next multiple of 7.
///
/// Padding bytes are carried to the receiver as ordinary data. For audio
/// streams they decode as a few samples of silence.
pub fn pad_to_group(data: &[u8]) -> Vec<u8> {
    let padded_len = data.len().div_ceil(RAW_GROUP_SIZE) * RAW_GROUP_SIZE;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(data);
    padded.resize(padded_len, 0);
    padded
}

/// Encode `data` into sentinel-delimited groups.
///
/// # Errors
///
/// Returns [`BlueteethError::Framing`] if `data.len()` is not a multiple of 7.
/// Use [`pad_to_group`] first for arbitrary lengths.
pub fn encode(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % RAW_GROUP_SIZE != 0 {
        return Err(BlueteethError::Framing(format!(
            "Input length {} is not a multiple of {}",
            data.len(),
            RAW_GROUP_SIZE
        )));
    }

    let mut out = Vec::with_capacity(encoded_len(data.len()));
    for group in data.chunks_exact(RAW_GROUP_SIZE) {
        let mut raw = [0u8; RAW_GROUP_SIZE];
        raw.copy_from_slice(group);
        out.push(SENTINEL);
        out.extend_from_slice(&encode_group(&raw));
    }
    Ok(out)
}

/// Decode a well-formed sequence of groups.
///
/// This is the strict inverse of [`encode`]. Streams read off a lossy link
/// should go through [`FrameDecoder`](super::FrameDecoder) instead, which
/// resynchronises on the next sentinel.
///
/// # Errors
///
/// Returns [`BlueteethError::Framing`] if the length is not a multiple of 9,
/// a sentinel slot holds another value, or a septet has its top bit set.
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % ENCODED_GROUP_SIZE != 0 {
        return Err(BlueteethError::Framing(format!(
            "Encoded length {} is not a multiple of {}",
            data.len(),
            ENCODED_GROUP_SIZE
        )));
    }

    let mut out = Vec::with_capacity(data.len() / ENCODED_GROUP_SIZE * RAW_GROUP_SIZE);
    for (index, group) in data.chunks_exact(ENCODED_GROUP_SIZE).enumerate() {
        if group[0] != SENTINEL {
            return Err(BlueteethError::Framing(format!(
                "Group {} starts with 0x{:02X} instead of the sentinel",
                index, group[0]
            )));
        }

        let mut septets = [0u8; SEPTETS_PER_GROUP];
        septets.copy_from_slice(&group[1..]);
        let raw = decode_group(&septets).ok_or_else(|| {
            BlueteethError::Framing(format!("Group {} has a septet with the top bit set", index))
        })?;
        out.extend_from_slice(&raw);
    }
    Ok(out)
}
