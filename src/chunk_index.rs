//! The in-memory chunk index: answers "is this chunk already stored,
//! and in which bundle?".
//!
//! The table is keyed on the 64-bit rolling hash, the half of the chunk
//! id the chunker can afford to compute per input byte. Collisions on
//! that key are resolved by walking a chain of entries and comparing the
//! 16-byte crypto prefix, which is only computed (via the lazy source)
//! once at least one chain entry matched.
//!
//! Entries live in an append-only arena and are addressed by `u32`
//! handles; chains are `next` handles, and bundle ids are interned in a
//! parallel table; consecutive inserts into the same bundle share one
//! stored id. Nothing is freed until the whole index is dropped.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::bundle;
use crate::chunk_id::{self, ChunkId, CRYPTO_HASH_SIZE};
use crate::encryption_key::EncryptionKey;
use crate::index_file;
use crate::rolling_hash;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IndexFile(#[from] index_file::Error),
    #[error(transparent)]
    ChunkId(#[from] chunk_id::IncorrectChunkIdSize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

struct ChainEntry {
    crypto_hash: [u8; CRYPTO_HASH_SIZE],
    next:        Option<u32>,
    bundle:      u32,
}

/// In-memory hash table over all known chunk ids.
#[derive(Default)]
pub struct ChunkIndex {
    /// rolling digest → head of the chain for that digest.
    hash_table: HashMap<rolling_hash::Digest, u32>,
    /// Arena of chain entries; never individually freed.
    entries:    Vec<ChainEntry>,
    /// Interned bundle ids, referenced by entry handle.
    bundle_ids: Vec<bundle::Id>,
    /// Handle of the most recently used bundle id, for interning runs of
    /// inserts into the same bundle.
    last_bundle: Option<u32>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a chunk by its rolling hash, materializing the full id
    /// through `chunk_id` only if some chain entry shares that hash.
    /// Returns the owning bundle's id if the chunk exists.
    pub fn find<F>(&self, rolling: rolling_hash::Digest, mut chunk_id: F) -> Option<&bundle::Id>
    where
        F: FnMut() -> ChunkId,
    {
        let head = *self.hash_table.get(&rolling)?;
        let mut id: Option<ChunkId> = None;
        let mut cursor = Some(head);
        while let Some(handle) = cursor {
            let entry = &self.entries[handle as usize];
            let id = id.get_or_insert_with(&mut chunk_id);
            if entry.crypto_hash == id.crypto_hash {
                return Some(&self.bundle_ids[entry.bundle as usize]);
            }
            cursor = entry.next;
        }
        None
    }

    /// Convenience form with the full id already at hand.
    pub fn find_by_id(&self, id: &ChunkId) -> Option<&bundle::Id> {
        self.find(id.rolling_hash, || *id)
    }

    /// Adds a chunk to the index if it was not there already. Returns
    /// true if added, false if it existed before (the stored bundle is
    /// left unchanged in that case).
    pub fn add(&mut self, id: &ChunkId, bundle_id: &bundle::Id) -> bool {
        let bundle = self.intern_bundle(bundle_id);
        self.register(id, bundle)
    }

    /// Loads every index file under `index_dir` into the table.
    pub fn load_all(&mut self, key: &EncryptionKey, index_dir: &Path) -> Result<()> {
        tracing::info!("loading index...");
        for entry in std::fs::read_dir(index_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            tracing::info!("loading index file {}...", path.display());
            let mut reader = index_file::Reader::open(key, &path)?;
            while let Some((info, bundle_id)) = reader.read_next_record()? {
                let bundle = self.intern_new_bundle(&bundle_id);
                for record in &info.chunk_record {
                    let id = ChunkId::from_blob(&record.id)?;
                    self.register(&id, bundle);
                }
            }
        }
        tracing::info!("index loaded, {} chunks known", self.len());
        Ok(())
    }

    /// Inserts a new entry unless an equal id is chained already.
    fn register(&mut self, id: &ChunkId, bundle: u32) -> bool {
        let new_handle = self.entries.len() as u32;
        match self.hash_table.entry(id.rolling_hash) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(new_handle);
            }
            std::collections::hash_map::Entry::Occupied(slot) => {
                // Walk to the chain tail, bailing out on an equal id.
                let mut handle = *slot.get();
                loop {
                    let entry = &self.entries[handle as usize];
                    if entry.crypto_hash == id.crypto_hash {
                        return false;
                    }
                    match entry.next {
                        Some(next) => handle = next,
                        None => break,
                    }
                }
                self.entries[handle as usize].next = Some(new_handle);
            }
        }
        self.entries.push(ChainEntry {
            crypto_hash: id.crypto_hash,
            next:        None,
            bundle,
        });
        true
    }

    /// Re-uses the last interned bundle id when it matches.
    fn intern_bundle(&mut self, bundle_id: &bundle::Id) -> u32 {
        if let Some(last) = self.last_bundle {
            if &self.bundle_ids[last as usize] == bundle_id {
                return last;
            }
        }
        self.intern_new_bundle(bundle_id)
    }

    fn intern_new_bundle(&mut self, bundle_id: &bundle::Id) -> u32 {
        let handle = self.bundle_ids.len() as u32;
        self.bundle_ids.push(*bundle_id);
        self.last_bundle = Some(handle);
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn add_find_and_dedup() {
        let mut index = ChunkIndex::new();
        let bundle_a = bundle::Id::random();
        let id = ChunkId::of(b"first chunk");

        assert!(index.add(&id, &bundle_a));
        assert!(!index.add(&id, &bundle_a), "second add must report existing");
        assert_eq!(index.find_by_id(&id), Some(&bundle_a));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn lazy_source_unused_on_miss() {
        let mut index = ChunkIndex::new();
        index.add(&ChunkId::of(b"stored"), &bundle::Id::random());

        let called = Cell::new(false);
        let absent = ChunkId::of(b"absent");
        let result = index.find(absent.rolling_hash, || {
            called.set(true);
            absent
        });
        assert!(result.is_none());
        // The rolling hash of unrelated data should not collide, so the
        // expensive id must never have been materialized.
        assert!(!called.get());
    }

    #[test]
    fn rolling_collisions_resolved_by_crypto_prefix() {
        let mut index = ChunkIndex::new();
        let bundle_a = bundle::Id::random();
        let bundle_b = bundle::Id::random();

        // Two distinct ids sharing one rolling hash land in one chain.
        let id_a = ChunkId { crypto_hash: [1; 16], rolling_hash: 42 };
        let id_b = ChunkId { crypto_hash: [2; 16], rolling_hash: 42 };

        assert!(index.add(&id_a, &bundle_a));
        assert!(index.add(&id_b, &bundle_b));
        assert_eq!(index.find_by_id(&id_a), Some(&bundle_a));
        assert_eq!(index.find_by_id(&id_b), Some(&bundle_b));
    }

    #[test]
    fn sequential_inserts_share_one_bundle_id() {
        let mut index = ChunkIndex::new();
        let bundle_a = bundle::Id::random();
        for i in 0..100u32 {
            index.add(&ChunkId::of(&i.to_le_bytes()), &bundle_a);
        }
        assert_eq!(index.bundle_ids.len(), 1);
    }
}
