//! Bundles: container files grouping many chunks, compressed as one
//! unit and named by a random id.
//!
//! # On-disk layout (inside the encrypted container's cleartext)
//!
//! ```text
//! BundleFileHeader { version, compression_method }   length-delimited
//! BundleInfo       { (chunk id, size)* }             length-delimited
//! u32 LE  adler32 of the above
//! <compressed concatenation of chunk payloads>
//! u32 LE  adler32 of the compressed stream (and all preceding cleartext)
//! ```
//!
//! The double checksum lets a reader reject a damaged bundle before
//! decompressing (metadata adler) and after (payload adler). `version`
//! is 1 for LZMA payloads and 2 otherwise; versions >= 3 are rejected
//! (see `compression.rs`).
//!
//! Bundle files live at `bundles/<xx>/<hex48>` where `xx` is the first
//! two hex characters of the id, bounding the per-directory fanout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;

use crate::chunk_id::{self, ChunkId};
use crate::compression::{self, CompressionMethod};
use crate::encrypted_file::{InputStream, OutputStream};
use crate::encryption;
use crate::encryption_key::EncryptionKey;
use crate::proto::{self, BundleFileHeader, BundleInfo, ChunkRecord};

/// The number of bytes a bundle id has. 192 bits; a multiple of 8 bytes,
/// which keeps the blob alignment-friendly.
pub const ID_SIZE: usize = 24;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bundle read failed")]
    ReadFailed,
    #[error("bundle write failed")]
    WriteFailed,
    #[error("unsupported version of the bundle file format: {0}")]
    UnsupportedVersion(u32),
    #[error("chunks with the same id found in a bundle")]
    DuplicateChunks,
    #[error("more data than expected in a bundle")]
    TooMuchData,
    #[error(transparent)]
    File(#[from] crate::encrypted_file::Error),
    #[error(transparent)]
    Proto(#[from] proto::Error),
    #[error(transparent)]
    Compression(#[from] compression::Error),
    #[error(transparent)]
    ChunkId(#[from] chunk_id::IncorrectChunkIdSize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Id ───────────────────────────────────────────────────────────────────────

/// Bundle id: 24 random bytes, globally unique within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Self {
        let mut blob = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut blob);
        Self(blob)
    }

    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        blob.try_into().ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Full file name for a bundle with the given id. With `create_dirs` the
/// two-character fanout directory is created if missing.
pub fn generate_file_name(id: &Id, bundles_dir: &Path, create_dirs: bool) -> Result<PathBuf> {
    let hex = id.to_hex();
    let level1 = bundles_dir.join(&hex[..2]);
    if create_dirs && !level1.exists() {
        fs::create_dir_all(&level1)?;
    }
    Ok(level1.join(hex))
}

// ── Creator ──────────────────────────────────────────────────────────────────

/// Accumulates chunks until the bundle is full, then compresses the
/// payload and writes the file out. Writing is the expensive part and is
/// what the storage writer hands to its worker pool.
#[derive(Default)]
pub struct Creator {
    info:    BundleInfo,
    payload: Vec<u8>,
}

impl Creator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk with the given id.
    pub fn add_chunk(&mut self, id: &ChunkId, data: &[u8]) {
        self.info.chunk_record.push(ChunkRecord {
            id:   id.to_blob().to_vec(),
            size: data.len() as u32,
        });
        self.payload.extend_from_slice(data);
    }

    /// Number of bytes comprising all chunk bodies so far.
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info.chunk_record.is_empty()
    }

    /// The metadata record for this bundle, as stored in index files.
    pub fn info(&self) -> &BundleInfo {
        &self.info
    }

    /// Compresses and writes the bundle to `path`. Time-consuming;
    /// meant to run on a worker thread.
    pub fn write(
        &self,
        path: &Path,
        key: &EncryptionKey,
        method: CompressionMethod,
    ) -> Result<()> {
        let mut os = OutputStream::create(path, key, &encryption::ZERO_IV)?;
        os.write_random_iv()?;

        let header = BundleFileHeader {
            version:            method.bundle_version(),
            compression_method: method.name().to_owned(),
        };
        proto::serialize(&header, &mut os)?;
        proto::serialize(&self.info, &mut os)?;
        os.write_adler32()?;

        let compressed = method.compress(&self.payload)?;
        os.write(&compressed)?;
        os.write_adler32()?;

        os.finish()?;
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Reads a bundle file and gives access to its chunks.
pub struct Reader {
    info:    BundleInfo,
    payload: Vec<u8>,
    /// ChunkId blob → (offset, size) into the decompressed payload.
    chunks:  HashMap<[u8; chunk_id::BLOB_SIZE], (usize, usize)>,
}

impl Reader {
    pub fn open(path: &Path, key: &EncryptionKey) -> Result<Self> {
        let mut is = InputStream::open(path, key, &encryption::ZERO_IV)?;
        is.consume_random_iv()?;

        let header: BundleFileHeader = proto::parse(&mut is)?;
        if header.version >= compression::FILE_FORMAT_VERSION_FIRST_UNSUPPORTED {
            return Err(Error::UnsupportedVersion(header.version));
        }

        let info: BundleInfo = proto::parse(&mut is)?;
        is.check_adler32()?;

        let payload_size: usize =
            info.chunk_record.iter().map(|r| r.size as usize).sum();

        let method = CompressionMethod::from_name(&header.compression_method)?;
        let compressed = is.read_rest_verified()?;
        let payload = method.decompress(&compressed)?;

        if payload.len() > payload_size {
            // The decoder produced more than the metadata claims to hold.
            return Err(Error::TooMuchData);
        }
        if payload.len() < payload_size {
            return Err(Error::ReadFailed);
        }

        let mut chunks = HashMap::with_capacity(info.chunk_record.len());
        let mut next = 0usize;
        for record in &info.chunk_record {
            let id = ChunkId::from_blob(&record.id)?;
            let size = record.size as usize;
            if chunks.insert(id.to_blob(), (next, size)).is_some() {
                return Err(Error::DuplicateChunks);
            }
            next += size;
        }

        Ok(Self { info, payload, chunks })
    }

    /// Copies the chunk into `data` and returns its size, or `None` if
    /// the bundle holds no such chunk. `data` may be enlarged but is
    /// never shrunk.
    pub fn get(&self, id: &ChunkId, data: &mut Vec<u8>) -> Option<usize> {
        let &(offset, size) = self.chunks.get(&id.to_blob())?;
        if data.len() < size {
            data.resize(size, 0);
        }
        data[..size].copy_from_slice(&self.payload[offset..offset + size]);
        Some(size)
    }

    pub fn info(&self) -> &BundleInfo {
        &self.info
    }
}

/// Re-encrypts a bundle file under another key without recompressing:
/// header, metadata and the compressed payload are carried over verbatim
/// and re-framed. Used by export/import.
pub fn copy_over(
    src_path: &Path,
    src_key: &EncryptionKey,
    dst_path: &Path,
    dst_key: &EncryptionKey,
) -> Result<()> {
    let mut is = InputStream::open(src_path, src_key, &encryption::ZERO_IV)?;
    is.consume_random_iv()?;

    let header: BundleFileHeader = proto::parse(&mut is)?;
    if header.version >= compression::FILE_FORMAT_VERSION_FIRST_UNSUPPORTED {
        return Err(Error::UnsupportedVersion(header.version));
    }
    let info: BundleInfo = proto::parse(&mut is)?;
    is.check_adler32()?;
    let compressed = is.read_rest_verified()?;

    let mut os = OutputStream::create(dst_path, dst_key, &encryption::ZERO_IV)?;
    os.write_random_iv()?;
    proto::serialize(&header, &mut os)?;
    proto::serialize(&info, &mut os)?;
    os.write_adler32()?;
    os.write(&compressed)?;
    os.write_adler32()?;
    os.finish()?;
    Ok(())
}
