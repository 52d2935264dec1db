//! 64-bit content hashing and the hash-framed blob format.
//!
//! Every persisted blob is written as `[8-byte hash LE][payload]`. The hash
//! covers the payload only. A blob whose hash does not match is treated as
//! absent, never returned to callers.

use xxhash_rust::xxh3::xxh3_64;

/// Size of the hash header prefixed to every persisted blob.
pub const HASH_HEADER_SIZE: usize = 8;

/// Computes the 64-bit content hash used for corruption detection.
pub fn content_hash(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Wraps a payload in the on-disk blob format: `[8B hash LE][payload]`.
pub fn seal(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HASH_HEADER_SIZE + payload.len());
    out.extend_from_slice(&content_hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Verifies a hash-framed blob and returns the payload slice.
///
/// Returns `None` if the blob is shorter than the header or the hash does
/// not match, so corrupt and truncated data look identical to missing data.
pub fn unseal(blob: &[u8]) -> Option<&[u8]> {
    if blob.len() < HASH_HEADER_SIZE {
        return None;
    }
    let mut header = [0u8; HASH_HEADER_SIZE];
    header.copy_from_slice(&blob[..HASH_HEADER_SIZE]);
    let expected = u64::from_le_bytes(header);
    let payload = &blob[HASH_HEADER_SIZE..];
    if content_hash(payload) == expected {
        Some(payload)
    } else {
        None
    }
}
