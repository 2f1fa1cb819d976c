//! The two repository descriptor files.
//!
//! `info` is written through the container with no key and no IV: it
//! must be readable before any password is known, because it carries the
//! encryption key material itself. `info_extended` holds the remaining
//! configuration and is encrypted like everything else.
//!
//! Both share the layout:
//!
//! ```text
//! [ random IV block; info_extended only, when encrypted ]
//! FileHeader { version = 1 }     length-delimited
//! StorageInfo | ExtendedStorageInfo
//! u32 LE  adler32
//! ```

use std::path::Path;

use thiserror::Error;

use crate::encrypted_file::{InputStream, OutputStream};
use crate::encryption;
use crate::encryption_key::EncryptionKey;
use crate::proto::{self, ExtendedStorageInfo, FileHeader, StorageInfo};

const FILE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported version of the storage info file format: {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    File(#[from] crate::encrypted_file::Error),
    #[error(transparent)]
    Proto(#[from] proto::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Saves the storage descriptor (always plaintext).
pub fn save(path: &Path, storage_info: &StorageInfo) -> Result<()> {
    let mut os = OutputStream::create(path, &EncryptionKey::none(), &encryption::ZERO_IV)?;
    proto::serialize(&FileHeader { version: FILE_FORMAT_VERSION }, &mut os)?;
    proto::serialize(storage_info, &mut os)?;
    os.write_adler32()?;
    os.finish()?;
    Ok(())
}

/// Loads the storage descriptor (always plaintext).
pub fn load(path: &Path) -> Result<StorageInfo> {
    let mut is = InputStream::open(path, &EncryptionKey::none(), &encryption::ZERO_IV)?;
    let header: FileHeader = proto::parse(&mut is)?;
    if header.version != FILE_FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(header.version));
    }
    let info: StorageInfo = proto::parse(&mut is)?;
    is.check_adler32()?;
    Ok(info)
}

/// Saves the extended descriptor, encrypted when a key is set.
pub fn save_extended(
    path: &Path,
    key: &EncryptionKey,
    extended: &ExtendedStorageInfo,
) -> Result<()> {
    let mut os = OutputStream::create(path, key, &encryption::ZERO_IV)?;
    os.write_random_iv()?;
    proto::serialize(&FileHeader { version: FILE_FORMAT_VERSION }, &mut os)?;
    proto::serialize(extended, &mut os)?;
    os.write_adler32()?;
    os.finish()?;
    Ok(())
}

/// Loads the extended descriptor.
pub fn load_extended(path: &Path, key: &EncryptionKey) -> Result<ExtendedStorageInfo> {
    let mut is = InputStream::open(path, key, &encryption::ZERO_IV)?;
    is.consume_random_iv()?;
    let header: FileHeader = proto::parse(&mut is)?;
    if header.version != FILE_FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(header.version));
    }
    let extended: ExtendedStorageInfo = proto::parse(&mut is)?;
    is.check_adler32()?;
    Ok(extended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn info_round_trip_plaintext() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("info");

        let info = StorageInfo {
            chunk_max_size:             65536,
            bundle_max_payload_size:    2 * 1024 * 1024,
            encryption_key:             None,
            default_compression_method: "lzma".to_owned(),
        };
        save(&path, &info).unwrap();
        assert_eq!(load(&path).unwrap(), info);
    }

    #[test]
    fn extended_round_trip_encrypted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("info_extended");
        let (_, key) = EncryptionKey::generate("pw");

        let extended = ExtendedStorageInfo {
            chunk_max_size:          65536,
            bundle_max_payload_size: 1 << 21,
            compression_method:      "zstd".to_owned(),
            small_literal_threshold: 128,
        };
        save_extended(&path, &key, &extended).unwrap();
        assert_eq!(load_extended(&path, &key).unwrap(), extended);

        // A different key cannot read it.
        let (_, other) = EncryptionKey::generate("other");
        assert!(load_extended(&path, &other).is_err());
    }
}
