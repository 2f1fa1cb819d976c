//! The repository root: glues the chunker, index, storage and container
//! pieces around a storage directory and an encryption key.
//!
//! A repository is a directory of fixed shape:
//!
//! ```text
//! info            storage descriptor + key material (plaintext container)
//! info_extended   extended configuration (encrypted container)
//! bundles/xx/…    bundle files, two-hex-character fanout
//! index/…         index files, random hex names
//! backups/**      user-visible backup files, any relative path
//! tmp/            staging; every new file is born here and renamed out
//! ```

use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::backup_creator::BackupCreator;
use crate::backup_file;
use crate::backup_restorer::{self, DataSink};
use crate::chunk_index::{self, ChunkIndex};
use crate::chunk_storage;
use crate::compression::{self, CompressionMethod};
use crate::config::{self, RuntimeConfig, StorageConfig};
use crate::encrypted_file;
use crate::encryption_key::{self, EncryptionKey};
use crate::proto::{BackupInfo, ExtendedStorageInfo, StorageInfo};
use crate::storage_info_file;
use crate::tmp_mgr::{self, TmpMgr};
use crate::{backup_collector, bundle, index_file};

#[derive(Error, Debug)]
pub enum Error {
    #[error("no repository found at {0}")]
    NoRepository(PathBuf),
    #[error("won't overwrite existing file: {0}")]
    WontOverwrite(PathBuf),
    #[error("the path must be within the backups/ dir: {0}")]
    CantDeriveStorageDir(PathBuf),
    #[error("checksum error in restored data")]
    ChecksumError,
    #[error(transparent)]
    Auth(#[from] encryption_key::Error),
    #[error(transparent)]
    StorageInfo(#[from] storage_info_file::Error),
    #[error(transparent)]
    Compression(#[from] compression::Error),
    #[error(transparent)]
    ChunkIndex(#[from] chunk_index::Error),
    #[error(transparent)]
    Storage(#[from] chunk_storage::Error),
    #[error(transparent)]
    Restorer(#[from] backup_restorer::Error),
    #[error(transparent)]
    BackupFile(#[from] backup_file::Error),
    #[error(transparent)]
    IndexFile(#[from] index_file::Error),
    #[error(transparent)]
    Bundle(#[from] bundle::Error),
    #[error(transparent)]
    TmpMgr(#[from] tmp_mgr::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Paths ────────────────────────────────────────────────────────────────────

/// The fixed directory layout of a repository.
#[derive(Debug, Clone)]
pub struct Paths {
    storage_dir: PathBuf,
}

impl Paths {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self { storage_dir }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.storage_dir.join("tmp")
    }

    pub fn bundles_path(&self) -> PathBuf {
        self.storage_dir.join("bundles")
    }

    pub fn storage_info_path(&self) -> PathBuf {
        self.storage_dir.join("info")
    }

    pub fn extended_storage_info_path(&self) -> PathBuf {
        self.storage_dir.join("info_extended")
    }

    pub fn index_path(&self) -> PathBuf {
        self.storage_dir.join("index")
    }

    pub fn backups_path(&self) -> PathBuf {
        self.storage_dir.join("backups")
    }
}

/// For a file within some repository's `backups/` dir, returns that
/// repository's storage dir. With `allow_outside` the path itself is
/// taken as the storage dir (used by `gc`, `export` and `import`).
pub fn derive_storage_dir(path: &Path, allow_outside: bool) -> Result<PathBuf> {
    if allow_outside {
        return Ok(fs::canonicalize(path)?);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let real = fs::canonicalize(parent)?;

    let mut dir = real.as_path();
    loop {
        if dir.file_name() == Some(OsStr::new("backups")) {
            // backups/ always sits directly under the storage dir.
            return Ok(dir.parent().expect("backups has a parent").to_owned());
        }
        match dir.parent() {
            Some(p) => dir = p,
            None => return Err(Error::CantDeriveStorageDir(path.to_owned())),
        }
    }
}

// ── Repository ───────────────────────────────────────────────────────────────

pub struct Repository {
    pub(crate) paths:          Paths,
    pub(crate) config:         StorageConfig,
    pub(crate) runtime:        RuntimeConfig,
    pub(crate) encryption_key: EncryptionKey,
    pub(crate) tmp_mgr:        TmpMgr,
    pub(crate) chunk_index:    ChunkIndex,
}

impl Repository {
    /// Creates a new storage directory. With a password the repository
    /// is encrypted; the password is required for every later open.
    pub fn init(storage_dir: &Path, password: Option<&str>, config: &StorageConfig) -> Result<()> {
        let paths = Paths::new(storage_dir.to_owned());

        let storage_info_path = paths.storage_info_path();
        if storage_info_path.exists() {
            return Err(Error::WontOverwrite(storage_info_path));
        }

        fs::create_dir_all(paths.storage_dir())?;
        fs::create_dir_all(paths.bundles_path())?;
        fs::create_dir_all(paths.backups_path())?;
        fs::create_dir_all(paths.index_path())?;

        let (key_info, key) = match password {
            Some(password) => {
                let (info, key) = EncryptionKey::generate(password);
                (Some(info), key)
            }
            None => (None, EncryptionKey::none()),
        };

        let storage_info = StorageInfo {
            chunk_max_size:             config.chunk_max_size,
            bundle_max_payload_size:    config.bundle_max_payload_size,
            encryption_key:             key_info,
            default_compression_method: config.compression.name().to_owned(),
        };
        storage_info_file::save(&storage_info_path, &storage_info)?;

        let extended = ExtendedStorageInfo {
            chunk_max_size:          config.chunk_max_size,
            bundle_max_payload_size: config.bundle_max_payload_size,
            compression_method:      config.compression.name().to_owned(),
            small_literal_threshold: config.small_literal_threshold,
        };
        storage_info_file::save_extended(&paths.extended_storage_info_path(), &key, &extended)?;
        Ok(())
    }

    /// Opens the storage. `prohibit_index_loading` skips populating the
    /// in-memory chunk index (the garbage collector's re-index and the
    /// exchanger run without one).
    pub fn open(
        storage_dir: &Path,
        password: &str,
        runtime: RuntimeConfig,
        prohibit_index_loading: bool,
    ) -> Result<Self> {
        let paths = Paths::new(storage_dir.to_owned());
        let storage_info_path = paths.storage_info_path();
        if !storage_info_path.exists() {
            return Err(Error::NoRepository(storage_dir.to_owned()));
        }
        let storage_info = storage_info_file::load(&storage_info_path)?;

        let encryption_key =
            EncryptionKey::unlock(password, storage_info.encryption_key.as_ref())?;

        let extended_path = paths.extended_storage_info_path();
        let extended = match storage_info_file::load_extended(&extended_path, &encryption_key) {
            Ok(extended) => extended,
            Err(storage_info_file::Error::File(encrypted_file::Error::Io(ref e)))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                // Repositories created before the extended descriptor
                // existed carry everything in `info`; write the extended
                // file once and carry on.
                tracing::info!("no extended storage info found, migrating the repository");
                let extended = ExtendedStorageInfo {
                    chunk_max_size:          storage_info.chunk_max_size,
                    bundle_max_payload_size: storage_info.bundle_max_payload_size,
                    compression_method:      storage_info.default_compression_method.clone(),
                    small_literal_threshold: config::DEFAULT_SMALL_LITERAL_THRESHOLD,
                };
                storage_info_file::save_extended(&extended_path, &encryption_key, &extended)?;
                extended
            }
            Err(e) => return Err(e.into()),
        };

        // Unset fields read back as zero values; apply the historical
        // defaults, like the original wire format did.
        let config = StorageConfig {
            chunk_max_size: non_zero_or(
                extended.chunk_max_size,
                config::DEFAULT_CHUNK_MAX_SIZE,
            ),
            bundle_max_payload_size: non_zero_or(
                extended.bundle_max_payload_size,
                config::DEFAULT_BUNDLE_MAX_PAYLOAD_SIZE,
            ),
            compression: match runtime.compression {
                Some(forced) => forced,
                None if extended.compression_method.is_empty() => CompressionMethod::default(),
                None => CompressionMethod::from_name(&extended.compression_method)?,
            },
            small_literal_threshold: non_zero_or(
                extended.small_literal_threshold,
                config::DEFAULT_SMALL_LITERAL_THRESHOLD,
            ),
        };

        let tmp_mgr = TmpMgr::new(paths.tmp_path())?;

        let mut chunk_index = ChunkIndex::new();
        if !prohibit_index_loading {
            chunk_index.load_all(&encryption_key, &paths.index_path())?;
        }

        Ok(Self { paths, config, runtime, encryption_key, tmp_mgr, chunk_index })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Whether the repository was initialized with a password. Readable
    /// without one; the descriptor is plaintext.
    pub fn is_encrypted(storage_dir: &Path) -> Result<bool> {
        let paths = Paths::new(storage_dir.to_owned());
        let storage_info_path = paths.storage_info_path();
        if !storage_info_path.exists() {
            return Err(Error::NoRepository(storage_dir.to_owned()));
        }
        let storage_info = storage_info_file::load(&storage_info_path)?;
        Ok(storage_info.encryption_key.is_some())
    }

    // ── Backup ───────────────────────────────────────────────────────────────

    /// Reads the whole of `input` and writes a backup file describing
    /// it. The instruction stream is re-chunked through the engine until
    /// it stops shrinking; the number of successful rounds is recorded.
    pub fn backup(&mut self, input: &mut dyn Read, output_file: &Path) -> Result<()> {
        if output_file.exists() {
            return Err(Error::WontOverwrite(output_file.to_owned()));
        }

        let start = Instant::now();
        let mut writer = chunk_storage::Writer::new(
            &self.config,
            self.config.compression,
            &self.encryption_key,
            &self.tmp_mgr,
            self.paths.bundles_path(),
            self.paths.index_path(),
            self.runtime.threads,
        );

        let mut sha256 = Sha256::new();
        let mut total_size = 0u64;

        let mut creator = BackupCreator::new(&self.config);
        loop {
            let buffer = creator.input_buffer();
            let read = match input.read(buffer) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                break;
            }
            sha256.update(&buffer[..read]);
            total_size += read as u64;
            creator.handle_more_data(read, &mut self.chunk_index, &mut writer)?;
        }
        creator.finish(&mut self.chunk_index, &mut writer)?;
        let mut serialized = creator.into_backup_data();

        // Shrink the serialized stream iteratively until it would not
        // shrink anymore.
        let mut iterations = 0u32;
        loop {
            let mut creator = BackupCreator::new(&self.config);
            let mut left = &serialized[..];
            while !left.is_empty() {
                let buffer = creator.input_buffer();
                let to_copy = buffer.len().min(left.len());
                buffer[..to_copy].copy_from_slice(&left[..to_copy]);
                creator.handle_more_data(to_copy, &mut self.chunk_index, &mut writer)?;
                left = &left[to_copy..];
            }
            creator.finish(&mut self.chunk_index, &mut writer)?;

            let next_generation = creator.into_backup_data();
            if next_generation.len() < serialized.len() {
                serialized = next_generation;
                iterations += 1;
            } else {
                break;
            }
        }
        tracing::debug!("iterations: {iterations}");

        let info = BackupInfo {
            sha256:      sha256.finalize().to_vec(),
            size:        total_size,
            iterations,
            backup_data: serialized,
            time:        start.elapsed().as_secs(),
        };

        // Bundles and the index must land before the backup file that
        // references them becomes visible.
        writer.commit()?;

        let temp = self.tmp_mgr.make_temporary_file()?;
        backup_file::save(temp.path(), &self.encryption_key, &info)?;
        temp.move_over_to(output_file, false)?;
        Ok(())
    }

    // ── Restore ──────────────────────────────────────────────────────────────

    /// Restores a backup file into `output`, verifying the SHA-256 of
    /// the produced stream.
    pub fn restore(&self, input_file: &Path, output: &mut dyn Write) -> Result<()> {
        let mut backup_info = backup_file::load(input_file, &self.encryption_key)?;

        let mut reader = chunk_storage::Reader::new(
            &self.config,
            &self.encryption_key,
            &self.chunk_index,
            self.paths.bundles_path(),
            self.runtime.cache_bytes,
        );

        let mut backup_data = Vec::new();
        backup_restorer::restore_iterations(
            &mut reader,
            &mut backup_info,
            &mut backup_data,
            None,
        )?;

        let mut sink = HashingSink { sha256: Sha256::new(), output };
        backup_restorer::restore(&mut reader, &backup_data, Some(&mut sink), None)?;

        if sink.sha256.finalize().to_vec() != backup_info.sha256 {
            return Err(Error::ChecksumError);
        }
        Ok(())
    }

    /// The final instruction stream of a backup plus a reader to serve
    /// range queries out of it.
    pub fn indexed_restorer(
        &self,
        input_file: &Path,
    ) -> Result<(backup_restorer::IndexedRestorer, chunk_storage::Reader<'_>)> {
        let mut backup_info = backup_file::load(input_file, &self.encryption_key)?;

        let mut reader = chunk_storage::Reader::new(
            &self.config,
            &self.encryption_key,
            &self.chunk_index,
            self.paths.bundles_path(),
            self.runtime.cache_bytes,
        );

        let mut backup_data = Vec::new();
        backup_restorer::restore_iterations(
            &mut reader,
            &mut backup_info,
            &mut backup_data,
            None,
        )?;

        let restorer = backup_restorer::IndexedRestorer::new(&mut reader, &backup_data)?;
        Ok((restorer, reader))
    }

    // ── Garbage collection ───────────────────────────────────────────────────

    /// Deletes bundles no surviving backup references and rewrites
    /// partially-live ones. `deep` inspects every index file and drops
    /// index files that are complete copies of others.
    pub fn gc(&self, deep: bool) -> Result<()> {
        backup_collector::gc(self, deep)
    }
}

fn non_zero_or(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

struct HashingSink<'a> {
    sha256: Sha256,
    output: &'a mut dyn Write,
}

impl DataSink for HashingSink<'_> {
    fn save_data(&mut self, data: &[u8]) -> backup_restorer::Result<()> {
        self.sha256.update(data);
        self.output.write_all(data)?;
        Ok(())
    }
}
