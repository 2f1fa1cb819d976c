//! The content-defined chunker: turns an input stream into a backup
//! instruction stream.
//!
//! A ring buffer holds the last `chunk_max_size` bytes plus one page of
//! input slack. While filling, every byte is rolled into the hash; once
//! a full window exists, each further byte rotates the window forward
//! one position and the index is probed with the (cheap) rolling digest.
//! A probe hit emits a `chunk_to_emit` reference and clears the window.
//! Bytes that slide out of the window accumulate in `chunk_to_save`;
//! when a full chunk's worth has accumulated it is stored (or, below
//! the small-literal threshold, emitted inline as `bytes_to_emit`).
//!
//! The full chunk id (the expensive SHA-1 half) is computed at most
//! once per window position, and only when the rolling digest matched
//! something in the index.

use sha1::{Digest as _, Sha1};

use crate::chunk_id::{ChunkId, CRYPTO_HASH_SIZE};
use crate::chunk_index::ChunkIndex;
use crate::chunk_storage;
use crate::config::StorageConfig;
use crate::proto::{self, BackupInstruction};
use crate::rolling_hash::RollingHash;
use crate::PAGE_SIZE;

pub type Result<T> = chunk_storage::Result<T>;

pub struct BackupCreator {
    chunk_max_size:          usize,
    small_literal_threshold: usize,

    ring:      Vec<u8>,
    head:      usize,
    tail:      usize,
    ring_fill: usize,

    /// Bytes that slid out of the window, assembled into the next chunk
    /// to store.
    chunk_to_save:      Vec<u8>,
    chunk_to_save_fill: usize,

    rolling:   RollingHash,
    /// Window id memoized until the window moves.
    cached_id: Option<ChunkId>,

    backup_data: Vec<u8>,
}

impl BackupCreator {
    pub fn new(config: &StorageConfig) -> Self {
        let chunk_max_size = config.chunk_max_size as usize;
        Self {
            chunk_max_size,
            small_literal_threshold: config.small_literal_threshold as usize,
            // Room for one chunk plus an extra page of input buffering.
            ring:      vec![0u8; chunk_max_size + PAGE_SIZE],
            head:      0,
            tail:      0,
            ring_fill: 0,
            chunk_to_save: vec![0u8; chunk_max_size],
            chunk_to_save_fill: 0,
            rolling:   RollingHash::new(),
            cached_id: None,
            backup_data: Vec::new(),
        }
    }

    /// The region to write the next input bytes into. Never empty except
    /// transiently when the ring is completely full, which
    /// `handle_more_data` never leaves it.
    pub fn input_buffer(&mut self) -> &mut [u8] {
        if self.tail > self.head {
            &mut self.ring[self.head..self.tail]
        } else if self.tail == self.head && self.ring_fill > 0 {
            &mut self.ring[self.head..self.head]
        } else {
            &mut self.ring[self.head..]
        }
    }

    /// Consumes `added` bytes previously written into
    /// [`input_buffer`](Self::input_buffer).
    pub fn handle_more_data(
        &mut self,
        mut added: usize,
        index: &mut ChunkIndex,
        writer: &mut chunk_storage::Writer<'_>,
    ) -> Result<()> {
        while added > 0 {
            if self.ring_fill < self.chunk_max_size {
                // Fill phase: consume until a full window exists.
                let left = self.chunk_max_size - self.ring_fill;
                let can_fully_fill = added >= left;
                let to_fill = if can_fully_fill { left } else { added };

                added -= to_fill;
                self.ring_fill += to_fill;
                for _ in 0..to_fill {
                    self.rolling.roll_in(self.ring[self.head]);
                    self.head += 1;
                }
                if self.head == self.ring.len() {
                    self.head = 0;
                }

                if can_fully_fill {
                    self.add_chunk_if_matched(index, writer)?;
                }
            } else {
                // Slide phase: the oldest byte leaves the window.
                self.chunk_to_save[self.chunk_to_save_fill] = self.ring[self.tail];
                self.chunk_to_save_fill += 1;
                if self.chunk_to_save_fill == self.chunk_max_size {
                    self.save_chunk_to_save(index, writer)?;
                }

                self.rolling.rotate(self.ring[self.head], self.ring[self.tail]);
                self.head += 1;
                self.tail += 1;
                if self.head == self.ring.len() {
                    self.head = 0;
                }
                if self.tail == self.ring.len() {
                    self.tail = 0;
                }

                self.add_chunk_if_matched(index, writer)?;

                added -= 1;
            }
        }
        Ok(())
    }

    /// Flushes all buffered data; no more input may follow. The tail may
    /// produce one final sub-maximum chunk or literal.
    pub fn finish(
        &mut self,
        index: &mut ChunkIndex,
        writer: &mut chunk_storage::Writer<'_>,
    ) -> Result<()> {
        if self.chunk_to_save_fill + self.ring_fill > self.chunk_max_size {
            // Together more than one chunk: complete and store the first.
            let to_move = self.chunk_max_size - self.chunk_to_save_fill;
            self.move_from_ring_to_chunk_to_save(to_move);
            self.save_chunk_to_save(index, writer)?;
        }

        debug_assert!(
            self.chunk_to_save_fill + self.ring_fill <= self.chunk_max_size,
            "had more than two full chunks at finish"
        );

        let to_move = self.ring_fill;
        self.move_from_ring_to_chunk_to_save(to_move);

        if self.chunk_to_save_fill > 0 {
            self.save_chunk_to_save(index, writer)?;
        }
        Ok(())
    }

    /// The serialized instruction stream. Call after `finish`.
    pub fn into_backup_data(self) -> Vec<u8> {
        self.backup_data
    }

    /// Probes the index for the current window; on a hit, flushes any
    /// pending literal bytes (so emission order matches byte order),
    /// emits the reference and clears the window.
    fn add_chunk_if_matched(
        &mut self,
        index: &mut ChunkIndex,
        writer: &mut chunk_storage::Writer<'_>,
    ) -> Result<()> {
        self.cached_id = None;
        let digest = self.rolling.digest();

        let matched = {
            let ring = &self.ring;
            let (head, tail) = (self.head, self.tail);
            let cached = &mut self.cached_id;
            index
                .find(digest, || {
                    *cached.get_or_insert_with(|| window_chunk_id(ring, head, tail, digest))
                })
                .is_some()
        };

        if matched {
            if self.chunk_to_save_fill > 0 {
                self.save_chunk_to_save(index, writer)?;
            }

            let id = self.cached_id.expect("probe hit materializes the id");
            let instruction = BackupInstruction {
                chunk_to_emit: Some(id.to_blob().to_vec()),
                bytes_to_emit: None,
            };
            self.output_instruction(&instruction);

            // The window was consumed from the ring.
            self.tail = self.head;
            self.ring_fill = 0;
            self.rolling.reset();
        }
        Ok(())
    }

    /// Emits the accumulated `chunk_to_save` bytes: inline below the
    /// small-literal threshold, as a stored chunk otherwise.
    fn save_chunk_to_save(
        &mut self,
        index: &mut ChunkIndex,
        writer: &mut chunk_storage::Writer<'_>,
    ) -> Result<()> {
        debug_assert!(self.chunk_to_save_fill > 0, "chunk to save is empty");
        let fill = self.chunk_to_save_fill;

        if fill < self.small_literal_threshold {
            let instruction = BackupInstruction {
                chunk_to_emit: None,
                bytes_to_emit: Some(self.chunk_to_save[..fill].to_vec()),
            };
            self.output_instruction(&instruction);
        } else {
            let id = ChunkId::of(&self.chunk_to_save[..fill]);
            // May deduplicate against an existing chunk; either way the
            // reference is valid.
            writer.add(index, &id, &self.chunk_to_save[..fill])?;
            let instruction = BackupInstruction {
                chunk_to_emit: Some(id.to_blob().to_vec()),
                bytes_to_emit: None,
            };
            self.output_instruction(&instruction);
        }

        self.chunk_to_save_fill = 0;
        Ok(())
    }

    /// Moves `to_move` buffered bytes from the ring into `chunk_to_save`.
    fn move_from_ring_to_chunk_to_save(&mut self, to_move: usize) {
        let ring = &self.ring;
        let chunk_to_save = &mut self.chunk_to_save;
        let fill = self.chunk_to_save_fill;

        if self.tail < self.head {
            // All buffered data is one contiguous piece.
            chunk_to_save[fill..fill + to_move]
                .copy_from_slice(&ring[self.tail..self.tail + to_move]);
            self.tail += to_move;
        } else {
            let to_end = ring.len() - self.tail;
            let first = to_end.min(to_move);
            chunk_to_save[fill..fill + first]
                .copy_from_slice(&ring[self.tail..self.tail + first]);
            self.tail += first;
            if to_move > first {
                let second = to_move - first;
                chunk_to_save[fill + first..fill + to_move]
                    .copy_from_slice(&ring[..second]);
                self.tail = second;
            }
        }
        if self.tail == self.ring.len() {
            self.tail = 0;
        }

        self.chunk_to_save_fill += to_move;
        self.ring_fill -= to_move;
    }

    fn output_instruction(&mut self, instruction: &BackupInstruction) {
        proto::append(instruction, &mut self.backup_data);
    }
}

/// SHA-1 + rolling digest of the current (full) window, which may wrap
/// around the ring end.
fn window_chunk_id(ring: &[u8], head: usize, tail: usize, digest: u64) -> ChunkId {
    let mut sha = Sha1::new();
    if tail < head {
        sha.update(&ring[tail..head]);
    } else {
        sha.update(&ring[tail..]);
        sha.update(&ring[..head]);
    }
    let sha1: [u8; 20] = sha.finalize().into();
    let mut crypto_hash = [0u8; CRYPTO_HASH_SIZE];
    crypto_hash.copy_from_slice(&sha1[..CRYPTO_HASH_SIZE]);
    ChunkId { crypto_hash, rolling_hash: digest }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::encryption_key::EncryptionKey;
    use crate::proto::InstructionIter;
    use crate::tmp_mgr::TmpMgr;
    use std::fs;
    use tempfile::TempDir;

    fn small_config() -> StorageConfig {
        StorageConfig {
            chunk_max_size: 1024,
            bundle_max_payload_size: 4096,
            compression: CompressionMethod::Lz4,
            small_literal_threshold: 128,
        }
    }

    fn feed(
        creator: &mut BackupCreator,
        mut data: &[u8],
        index: &mut ChunkIndex,
        writer: &mut chunk_storage::Writer<'_>,
    ) {
        while !data.is_empty() {
            let buf = creator.input_buffer();
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            creator.handle_more_data(n, index, writer).unwrap();
            data = &data[n..];
        }
    }

    fn run_creator(
        config: &StorageConfig,
        data: &[u8],
        index: &mut ChunkIndex,
        writer: &mut chunk_storage::Writer<'_>,
    ) -> Vec<u8> {
        let mut creator = BackupCreator::new(config);
        feed(&mut creator, data, index, writer);
        creator.finish(index, writer).unwrap();
        creator.into_backup_data()
    }

    #[test]
    fn tiny_input_becomes_an_inline_literal() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        let config = small_config();
        let key = EncryptionKey::none();
        let tmp = TmpMgr::new(dir.path().join("tmp")).unwrap();
        let mut index = ChunkIndex::new();
        let mut writer = chunk_storage::Writer::new(
            &config,
            config.compression,
            &key,
            &tmp,
            dir.path().join("bundles"),
            dir.path().join("index"),
            1,
        );

        let data = run_creator(&config, b"short", &mut index, &mut writer);
        let instructions: Vec<_> = InstructionIter::new(&data)
            .collect::<proto::Result<_>>()
            .unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].bytes_to_emit.as_deref(), Some(&b"short"[..]));
        assert!(index.is_empty(), "literals must not create chunks");
    }

    #[test]
    fn repeated_window_is_referenced_not_restored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        let config = small_config();
        let key = EncryptionKey::none();
        let tmp = TmpMgr::new(dir.path().join("tmp")).unwrap();
        let mut index = ChunkIndex::new();
        let mut writer = chunk_storage::Writer::new(
            &config,
            config.compression,
            &key,
            &tmp,
            dir.path().join("bundles"),
            dir.path().join("index"),
            1,
        );

        let chunk: Vec<u8> = (0..1024u32).map(|x| (x * 7) as u8).collect();

        let first = run_creator(&config, &chunk, &mut index, &mut writer);
        assert_eq!(index.len(), 1);

        // Same content again: the full window must hit the index.
        let second = run_creator(&config, &chunk, &mut index, &mut writer);
        assert_eq!(index.len(), 1, "no new chunk on identical input");

        for data in [&first, &second] {
            let instructions: Vec<_> = InstructionIter::new(data)
                .collect::<proto::Result<_>>()
                .unwrap();
            assert_eq!(instructions.len(), 1);
            assert!(instructions[0].chunk_to_emit.is_some());
        }
        assert_eq!(first, second);
    }
}
