//! Index files: the on-disk list of `(bundle id, bundle info)` records.
//!
//! All existing chunk ids and their owning bundles could be recovered by
//! scanning every bundle file, but that would cost a disk seek per
//! bundle; index files keep the same information in a handful of
//! sequential reads.
//!
//! # On-disk layout (inside the encrypted container's cleartext)
//!
//! ```text
//! FileHeader { version = 1 }                length-delimited
//! repeat:
//!   IndexBundleHeader { id }                24-byte bundle id;
//!                                           absent id terminates
//!   BundleInfo                              only when id present
//! u32 LE  adler32
//! ```

use std::path::Path;

use thiserror::Error;

use crate::bundle;
use crate::encrypted_file::{InputStream, OutputStream};
use crate::encryption;
use crate::encryption_key::EncryptionKey;
use crate::proto::{self, BundleInfo, FileHeader, IndexBundleHeader};

const FILE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported version of the index file format: {0}")]
    UnsupportedVersion(u32),
    #[error("incorrect bundle id size encountered")]
    IncorrectBundleIdSize,
    #[error(transparent)]
    File(#[from] crate::encrypted_file::Error),
    #[error(transparent)]
    Proto(#[from] proto::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Writer ───────────────────────────────────────────────────────────────────

/// Creates index files. The file stays in `tmp/` until the storage
/// writer commits; `finish()` writes the terminating record and the
/// checksum trailer.
pub struct Writer {
    stream: OutputStream,
}

impl Writer {
    pub fn create(key: &EncryptionKey, path: &Path) -> Result<Self> {
        let mut stream = OutputStream::create(path, key, &encryption::ZERO_IV)?;
        stream.write_random_iv()?;
        proto::serialize(&FileHeader { version: FILE_FORMAT_VERSION }, &mut stream)?;
        Ok(Self { stream })
    }

    /// Appends one bundle record.
    pub fn add(&mut self, info: &BundleInfo, bundle_id: &bundle::Id) -> Result<()> {
        let header = IndexBundleHeader { id: Some(bundle_id.0.to_vec()) };
        proto::serialize(&header, &mut self.stream)?;
        proto::serialize(info, &mut self.stream)?;
        Ok(())
    }

    /// Writes the sentinel record and finalizes the file.
    pub fn finish(mut self) -> Result<()> {
        proto::serialize(&IndexBundleHeader { id: None }, &mut self.stream)?;
        self.stream.write_adler32()?;
        self.stream.finish()?;
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Reads index files record by record.
pub struct Reader {
    stream: InputStream,
    done:   bool,
}

impl Reader {
    pub fn open(key: &EncryptionKey, path: &Path) -> Result<Self> {
        let mut stream = InputStream::open(path, key, &encryption::ZERO_IV)?;
        stream.consume_random_iv()?;

        let header: FileHeader = proto::parse(&mut stream)?;
        if header.version != FILE_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }

        Ok(Self { stream, done: false })
    }

    /// Reads the next record. Returns `None` after the sentinel; the
    /// checksum trailer is verified at that point.
    pub fn read_next_record(&mut self) -> Result<Option<(BundleInfo, bundle::Id)>> {
        if self.done {
            return Ok(None);
        }
        let header: IndexBundleHeader = proto::parse(&mut self.stream)?;
        match header.id {
            Some(blob) => {
                let id = bundle::Id::from_blob(&blob).ok_or(Error::IncorrectBundleIdSize)?;
                let info: BundleInfo = proto::parse(&mut self.stream)?;
                Ok(Some((info, id)))
            }
            None => {
                self.stream.check_adler32()?;
                self.done = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ChunkRecord;
    use tempfile::TempDir;

    fn sample_info(n: u32) -> BundleInfo {
        BundleInfo {
            chunk_record: (0..n)
                .map(|i| ChunkRecord { id: vec![i as u8; 24], size: 100 + i })
                .collect(),
        }
    }

    #[test]
    fn write_then_read_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index");
        let (_, key) = EncryptionKey::generate("pw");

        let ids = [bundle::Id::random(), bundle::Id::random()];
        let mut writer = Writer::create(&key, &path).unwrap();
        writer.add(&sample_info(3), &ids[0]).unwrap();
        writer.add(&sample_info(1), &ids[1]).unwrap();
        writer.finish().unwrap();

        let mut reader = Reader::open(&key, &path).unwrap();
        let (info, id) = reader.read_next_record().unwrap().unwrap();
        assert_eq!(id, ids[0]);
        assert_eq!(info.chunk_record.len(), 3);
        let (info, id) = reader.read_next_record().unwrap().unwrap();
        assert_eq!(id, ids[1]);
        assert_eq!(info.chunk_record.len(), 1);
        assert!(reader.read_next_record().unwrap().is_none());
        // Subsequent calls stay at end.
        assert!(reader.read_next_record().unwrap().is_none());
    }

    #[test]
    fn empty_index_is_just_a_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index");
        let key = EncryptionKey::none();

        Writer::create(&key, &path).unwrap().finish().unwrap();

        let mut reader = Reader::open(&key, &path).unwrap();
        assert!(reader.read_next_record().unwrap().is_none());
    }

    #[test]
    fn truncated_index_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index");
        let key = EncryptionKey::none();

        let mut writer = Writer::create(&key, &path).unwrap();
        writer.add(&sample_info(2), &bundle::Id::random()).unwrap();
        writer.finish().unwrap();

        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        let mut reader = Reader::open(&key, &path).unwrap();
        let mut result = Ok(None);
        for _ in 0..4 {
            result = reader.read_next_record();
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }
}
