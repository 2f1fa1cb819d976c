//! Chunk identity: 16 bytes of SHA-1 concatenated with the rolling hash.
//!
//! The crypto half carries the collision resistance; the rolling half is
//! the cheap probe key the chunker can compute per input byte. Together
//! they form the 24-byte content address a chunk is stored and looked up
//! under.

use sha1::{Digest as _, Sha1};
use thiserror::Error;

use crate::rolling_hash;

/// Number of SHA-1 bytes kept in the id.
pub const CRYPTO_HASH_SIZE: usize = 16;

/// Serialized id size: crypto prefix + little-endian rolling digest.
pub const BLOB_SIZE: usize = CRYPTO_HASH_SIZE + 8;

#[derive(Error, Debug)]
#[error("incorrect chunk id size: {0} (expected {BLOB_SIZE})")]
pub struct IncorrectChunkIdSize(pub usize);

/// A chunk is identified by its crypto hash prefix plus its rolling hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    pub crypto_hash:  [u8; CRYPTO_HASH_SIZE],
    pub rolling_hash: rolling_hash::Digest,
}

impl ChunkId {
    /// Compute the id of a complete chunk.
    pub fn of(data: &[u8]) -> Self {
        let sha1: [u8; 20] = Sha1::digest(data).into();
        let mut crypto_hash = [0u8; CRYPTO_HASH_SIZE];
        crypto_hash.copy_from_slice(&sha1[..CRYPTO_HASH_SIZE]);
        Self {
            crypto_hash,
            rolling_hash: rolling_hash::RollingHash::digest_of(data),
        }
    }

    /// Serialize to the 24-byte on-disk form.
    pub fn to_blob(&self) -> [u8; BLOB_SIZE] {
        let mut out = [0u8; BLOB_SIZE];
        out[..CRYPTO_HASH_SIZE].copy_from_slice(&self.crypto_hash);
        out[CRYPTO_HASH_SIZE..].copy_from_slice(&self.rolling_hash.to_le_bytes());
        out
    }

    /// Parse the 24-byte on-disk form.
    pub fn from_blob(blob: &[u8]) -> Result<Self, IncorrectChunkIdSize> {
        if blob.len() != BLOB_SIZE {
            return Err(IncorrectChunkIdSize(blob.len()));
        }
        let mut crypto_hash = [0u8; CRYPTO_HASH_SIZE];
        crypto_hash.copy_from_slice(&blob[..CRYPTO_HASH_SIZE]);
        let rolling_hash =
            u64::from_le_bytes(blob[CRYPTO_HASH_SIZE..].try_into().unwrap());
        Ok(Self { crypto_hash, rolling_hash })
    }

    /// Hex form of the blob, for diagnostics.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_blob())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let id = ChunkId::of(b"some chunk payload");
        let parsed = ChunkId::from_blob(&id.to_blob()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rolling_part_is_little_endian_suffix() {
        let id = ChunkId::of(b"x");
        let blob = id.to_blob();
        assert_eq!(&blob[16..24], &id.rolling_hash.to_le_bytes());
    }

    #[test]
    fn wrong_size_is_rejected() {
        assert!(ChunkId::from_blob(&[0u8; 23]).is_err());
        assert!(ChunkId::from_blob(&[0u8; 25]).is_err());
    }

    #[test]
    fn distinct_data_distinct_ids() {
        assert_ne!(ChunkId::of(b"aaaa"), ChunkId::of(b"aaab"));
    }
}
