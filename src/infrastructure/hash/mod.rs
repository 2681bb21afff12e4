// Hash functions for pair identities

use crate::types::{BlockNum, FileNum};

/// FNV-1a hash implementation for byte slices
/// Returns a 64-bit integer hash value
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    // FNV-1a constants
    const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;

    let mut hash = FNV_OFFSET_BASIS;

    // Process each byte in the slice
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash
}

/// djb2 hash implementation for byte slices
/// Returns a 64-bit integer hash value
pub fn djb2_hash(data: &[u8]) -> u64 {
    // djb2 constants
    const DJB2_MAGIC_NUMBER: u64 = 5381;

    let mut hash = DJB2_MAGIC_NUMBER;

    for byte in data {
        // hash * 33 + c, with wrapping operations to handle overflow safely
        hash = hash
            .wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(*byte as u64);
    }

    hash
}

/// xxHash64 wrapper
/// Returns a 64-bit integer hash value
pub fn xxh64_hash(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}

/// Computes the fullhash of a pair identity.
///
/// The fullhash is precomputed once per pair and reused for bucket indexing
/// across lookups, renames, and rehashes. Uses FNV-1a over the little-endian
/// encoding of `(filenum, blocknum)`.
pub fn fullhash(filenum: FileNum, blocknum: BlockNum) -> u64 {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&filenum.to_le_bytes());
    bytes[8..].copy_from_slice(&blocknum.to_le_bytes());
    fnv1a_hash(&bytes)
}
