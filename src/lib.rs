//! # bitstash: deduplicating, encrypted, compressed backup engine
//!
//! Arbitrary byte streams go in; each stream comes back byte-for-byte
//! from a small backup file plus a shared content-addressed store.
//!
//! Format guarantees (frozen):
//! - Chunks are addressed by 16 bytes of SHA-1 plus a 64-bit keyed
//!   Rabin-Karp rolling hash; identical addresses mean identical chunks
//! - A chunk is stored exactly once, in exactly one bundle
//! - Every repository file is an encrypted container: AES-128-CBC with
//!   PKCS#7, a leading random-IV block, and an adler32-of-cleartext
//!   trailer that is always verified; without a key the same framing
//!   applies minus cipher and padding
//! - All structured records are varint-length-delimited protobuf
//!   messages; all integer fields are little-endian on the wire
//! - Bundle format versions: 1 = LZMA payload, 2 = any other method,
//!   >= 3 rejected
//! - New files are staged under `tmp/` and renamed into place on
//!   commit; a crash never leaves a partial file outside `tmp/`

pub mod backup_collector;
pub mod backup_creator;
pub mod backup_exchanger;
pub mod backup_file;
pub mod backup_restorer;
pub mod bundle;
pub mod chunk_id;
pub mod chunk_index;
pub mod chunk_storage;
pub mod compression;
pub mod config;
pub mod encrypted_file;
pub mod encryption;
pub mod encryption_key;
pub mod index_file;
pub mod proto;
pub mod repository;
pub mod rolling_hash;
pub mod storage_info_file;
pub mod tmp_mgr;

// Flat re-exports for the most common types.
pub use backup_exchanger::{exchange, ExchangeFlags};
pub use backup_restorer::{DataSink, IndexedRestorer};
pub use chunk_id::ChunkId;
pub use chunk_index::ChunkIndex;
pub use compression::CompressionMethod;
pub use config::{RuntimeConfig, StorageConfig};
pub use encryption_key::EncryptionKey;
pub use repository::{derive_storage_dir, Paths, Repository};
pub use rolling_hash::RollingHash;

/// I/O buffering granularity used by the container streams and the
/// chunker's input slack.
pub const PAGE_SIZE: usize = 4096;
