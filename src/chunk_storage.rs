//! Chunk storage: the writing and reading facades over bundles and
//! index files.
//!
//! # Writer
//!
//! New chunks accumulate in the current bundle. When the bundle would
//! overflow `bundle_max_payload_size` it is sealed: an index record is
//! appended, a temp file is reserved, and the creator is handed to a
//! compression worker while the writer starts a fresh bundle. The pool
//! is bounded by a running-count guarded by a mutex and condition
//! variable; `commit()` drains the joinable workers, renames every
//! pending temp file to its final `bundles/…` path and moves the index
//! file into `index/`. Nothing is visible outside `tmp/` before
//! `commit()`.
//!
//! A failure inside a worker aborts the process: the bundle it was
//! writing only ever existed under `tmp/`, so the repository on disk is
//! untouched.
//!
//! # Reader
//!
//! Chunks are located through the in-memory index and fetched from an
//! LRU cache of decompressed bundle readers sized at
//! `max(1, cache_bytes / bundle_max_payload_size)` slots; with fewer
//! than one slot every consecutive chunk read from the same bundle would
//! decompress it again.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use lru::LruCache;
use rand::RngCore;
use thiserror::Error;

use crate::bundle;
use crate::chunk_id::ChunkId;
use crate::chunk_index::ChunkIndex;
use crate::compression::CompressionMethod;
use crate::config::StorageConfig;
use crate::encryption_key::EncryptionKey;
use crate::index_file;
use crate::proto::BundleInfo;
use crate::tmp_mgr::{TemporaryFile, TmpMgr};

#[derive(Error, Debug)]
pub enum Error {
    #[error("no such chunk found: {0}")]
    NoSuchChunk(String),
    #[error("a compression worker terminated abnormally")]
    WorkerFailed,
    #[error(transparent)]
    Bundle(#[from] bundle::Error),
    #[error(transparent)]
    IndexFile(#[from] index_file::Error),
    #[error(transparent)]
    TmpMgr(#[from] crate::tmp_mgr::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Writer ───────────────────────────────────────────────────────────────────

/// Adds new chunks to the storage by filling bundles and writing index
/// records. All output is staged in `tmp/`; call [`commit`](Writer::commit)
/// to make it permanent; it is never called automatically.
pub struct Writer<'a> {
    config:      StorageConfig,
    compression: CompressionMethod,
    key:         &'a EncryptionKey,
    tmp_mgr:     &'a TmpMgr,
    bundles_dir: PathBuf,
    index_dir:   PathBuf,

    index_writer: Option<(TemporaryFile, index_file::Writer)>,

    current_bundle:    Option<bundle::Creator>,
    current_bundle_id: Option<bundle::Id>,

    max_compressors: usize,
    running:         Arc<(Mutex<usize>, Condvar)>,
    workers:         Vec<JoinHandle<()>>,

    /// Sealed temp files awaiting their atomic move to `bundles/…`.
    pending_renames: Vec<(TemporaryFile, bundle::Id)>,
}

impl<'a> Writer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &StorageConfig,
        compression: CompressionMethod,
        key: &'a EncryptionKey,
        tmp_mgr: &'a TmpMgr,
        bundles_dir: PathBuf,
        index_dir: PathBuf,
        max_compressors: usize,
    ) -> Self {
        let max_compressors = max_compressors.max(1);
        tracing::info!("using up to {max_compressors} thread(s) for compression");
        Self {
            config: config.clone(),
            compression,
            key,
            tmp_mgr,
            bundles_dir,
            index_dir,
            index_writer: None,
            current_bundle: None,
            current_bundle_id: None,
            max_compressors,
            running: Arc::new((Mutex::new(0), Condvar::new())),
            workers: Vec::new(),
            pending_renames: Vec::new(),
        }
    }

    /// Adds the given chunk to the store. If the chunk already exists in
    /// the index nothing happens and false is returned.
    pub fn add(&mut self, index: &mut ChunkIndex, id: &ChunkId, data: &[u8]) -> Result<bool> {
        if index.find_by_id(id).is_some() {
            return Ok(false);
        }

        // Seal first when this chunk would overflow the current bundle,
        // so the chunk is always indexed under the bundle that actually
        // stores it.
        if let Some(ref current) = self.current_bundle {
            if current.payload_size() + data.len()
                > self.config.bundle_max_payload_size as usize
            {
                self.finish_current_bundle()?;
            }
        }

        // A bundle id is born at first insertion, never earlier: an id
        // that never received a chunk must not reach any on-disk state.
        let bundle_id = *self.current_bundle_id.get_or_insert_with(bundle::Id::random);
        index.add(id, &bundle_id);
        self.current_bundle
            .get_or_insert_with(bundle::Creator::new)
            .add_chunk(id, data);
        Ok(true)
    }

    /// Appends an index record for a completed bundle. Also used by the
    /// garbage collector for bundles it keeps.
    pub fn add_bundle(&mut self, info: &BundleInfo, bundle_id: &bundle::Id) -> Result<()> {
        if self.index_writer.is_none() {
            let temp = self.tmp_mgr.make_temporary_file()?;
            let writer = index_file::Writer::create(self.key, temp.path())?;
            self.index_writer = Some((temp, writer));
        }
        let (_, writer) = self.index_writer.as_mut().unwrap();
        writer.add(info, bundle_id)?;
        Ok(())
    }

    /// Seals the current bundle (if any), drains the worker pool, moves
    /// every staged bundle and the index file to their final paths.
    pub fn commit(&mut self) -> Result<()> {
        self.finish_current_bundle()?;
        self.wait_for_all_compressors()?;

        for (temp, bundle_id) in self.pending_renames.drain(..) {
            let destination =
                bundle::generate_file_name(&bundle_id, &self.bundles_dir, true)?;
            temp.move_over_to(&destination, false)?;
        }

        if let Some((temp, writer)) = self.index_writer.take() {
            writer.finish()?;
            let mut name = [0u8; bundle::ID_SIZE];
            rand::thread_rng().fill_bytes(&mut name);
            temp.move_over_to(&self.index_dir.join(hex::encode(name)), false)?;
        }
        Ok(())
    }

    /// Discards the session: seals and drains as `commit` would, then
    /// drops everything staged instead of renaming it.
    pub fn reset(&mut self) -> Result<()> {
        self.finish_current_bundle()?;
        self.wait_for_all_compressors()?;
        self.pending_renames.clear();
        self.index_writer = None;
        Ok(())
    }

    fn finish_current_bundle(&mut self) -> Result<()> {
        let bundle = match self.current_bundle.take() {
            Some(bundle) => bundle,
            None => return Ok(()),
        };
        let bundle_id = self
            .current_bundle_id
            .take()
            .expect("a non-empty bundle always has an id");

        let temp = self.tmp_mgr.make_temporary_file()?;
        self.add_bundle(bundle.info(), &bundle_id)?;
        let path = temp.path().to_owned();
        self.pending_renames.push((temp, bundle_id));

        // Throttle: wait until a compressor slot frees up.
        let (lock, condvar) = &*self.running;
        {
            let mut running = lock.lock().unwrap();
            while *running >= self.max_compressors {
                running = condvar.wait(running).unwrap();
            }
            *running += 1;
        }

        let running = Arc::clone(&self.running);
        let key = EncryptionKey::clone(self.key);
        let method = self.compression;
        self.workers.push(std::thread::spawn(move || {
            if let Err(e) = bundle.write(&path, &key, method) {
                // The repository on disk is still intact (the bundle
                // only ever existed under tmp/) but this session cannot
                // produce a consistent commit anymore.
                tracing::error!("bundle writing failed: {e}");
                std::process::abort();
            }
            let (lock, condvar) = &*running;
            let mut running = lock.lock().unwrap();
            *running -= 1;
            condvar.notify_all();
        }));
        Ok(())
    }

    fn wait_for_all_compressors(&mut self) -> Result<()> {
        for handle in self.workers.drain(..) {
            handle.join().map_err(|_| Error::WorkerFailed)?;
        }
        Ok(())
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        // Workers write into temp files owned by pending_renames; they
        // must finish before those are deleted.
        let _ = self.wait_for_all_compressors();
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Retrieves existing chunks by extracting them from bundles, caching
/// decompressed bundle readers.
pub struct Reader<'a> {
    key:            &'a EncryptionKey,
    index:          &'a ChunkIndex,
    bundles_dir:    PathBuf,
    cached_readers: LruCache<bundle::Id, bundle::Reader>,
}

impl<'a> Reader<'a> {
    pub fn new(
        config: &StorageConfig,
        key: &'a EncryptionKey,
        index: &'a ChunkIndex,
        bundles_dir: PathBuf,
        cache_bytes: usize,
    ) -> Self {
        let slots = (cache_bytes / config.bundle_max_payload_size as usize).max(1);
        tracing::info!("using up to {} MB of RAM as cache", cache_bytes / 1048576);
        Self {
            key,
            index,
            bundles_dir,
            cached_readers: LruCache::new(
                NonZeroUsize::new(slots).expect("at least one cache slot"),
            ),
        }
    }

    /// Loads the chunk into `data`, returning its size. `data` may be
    /// enlarged but is never shrunk.
    pub fn get(&mut self, id: &ChunkId, data: &mut Vec<u8>) -> Result<usize> {
        let bundle_id = *self
            .index
            .find_by_id(id)
            .ok_or_else(|| Error::NoSuchChunk(id.to_hex()))?;
        let reader = self.reader_for(&bundle_id)?;
        reader
            .get(id, data)
            .ok_or_else(|| Error::NoSuchChunk(id.to_hex()))
    }

    /// Metadata-only lookup of the bundle owning a chunk.
    pub fn get_bundle_id(&self, id: &ChunkId) -> Result<bundle::Id> {
        self.index
            .find_by_id(id)
            .copied()
            .ok_or_else(|| Error::NoSuchChunk(id.to_hex()))
    }

    /// The bundle reader for the given id, from cache or freshly opened.
    fn reader_for(&mut self, bundle_id: &bundle::Id) -> Result<&bundle::Reader> {
        if !self.cached_readers.contains(bundle_id) {
            let path = bundle::generate_file_name(bundle_id, &self.bundles_dir, false)?;
            let reader = bundle::Reader::open(&path, self.key)?;
            self.cached_readers.put(*bundle_id, reader);
        }
        Ok(self
            .cached_readers
            .get(bundle_id)
            .expect("bundle reader was just inserted"))
    }
}
