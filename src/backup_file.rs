//! Backup files: the user-facing artifacts under `backups/`.
//!
//! ```text
//! [ random IV block, when encrypted ]
//! FileHeader { version = 1 }     length-delimited
//! BackupInfo                     length-delimited
//! u32 LE  adler32
//! ```

use std::path::Path;

use thiserror::Error;

use crate::encrypted_file::{InputStream, OutputStream};
use crate::encryption;
use crate::encryption_key::EncryptionKey;
use crate::proto::{self, BackupInfo, FileHeader};

const FILE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported version of the backup file format: {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    File(#[from] crate::encrypted_file::Error),
    #[error(transparent)]
    Proto(#[from] proto::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Saves the given backup descriptor into the given file.
pub fn save(path: &Path, key: &EncryptionKey, backup_info: &BackupInfo) -> Result<()> {
    let mut os = OutputStream::create(path, key, &encryption::ZERO_IV)?;
    os.write_random_iv()?;

    proto::serialize(&FileHeader { version: FILE_FORMAT_VERSION }, &mut os)?;
    proto::serialize(backup_info, &mut os)?;
    os.write_adler32()?;
    os.finish()?;
    Ok(())
}

/// Loads the given backup descriptor from the given file.
pub fn load(path: &Path, key: &EncryptionKey) -> Result<BackupInfo> {
    let mut is = InputStream::open(path, key, &encryption::ZERO_IV)?;
    is.consume_random_iv()?;

    let header: FileHeader = proto::parse(&mut is)?;
    if header.version != FILE_FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(header.version));
    }

    let info: BackupInfo = proto::parse(&mut is)?;
    is.check_adler32()?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup");
        let (_, key) = EncryptionKey::generate("pw");

        let info = BackupInfo {
            sha256:      vec![0xEE; 32],
            size:        123456,
            iterations:  2,
            backup_data: vec![1, 2, 3, 4],
            time:        7,
        };
        save(&path, &key, &info).unwrap();
        assert_eq!(load(&path, &key).unwrap(), info);
    }

    #[test]
    fn truncation_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup");
        let key = EncryptionKey::none();

        let info = BackupInfo {
            sha256:      vec![0u8; 32],
            size:        10,
            iterations:  0,
            backup_data: vec![9u8; 300],
            time:        0,
        };
        save(&path, &key, &info).unwrap();

        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 1]).unwrap();
        assert!(load(&path, &key).is_err());
    }
}
