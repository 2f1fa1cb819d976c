//! Interprets backup instruction streams.
//!
//! Three modes:
//! - forward: walk the stream once, emitting chunks and literals into a
//!   [`DataSink`], optionally collecting every referenced chunk id;
//! - iterated: unwrap `iterations` rounds of self-compression, each
//!   round restoring the instruction stream into memory;
//! - indexed: a one-time pass builds an offset table so arbitrary
//!   `(offset, length)` ranges can be served without a full restore.

use std::collections::HashSet;

use thiserror::Error;

use crate::chunk_id::{self, ChunkId};
use crate::chunk_storage;
use crate::proto::{self, BackupInfo, BackupInstruction, InstructionIter};

#[derive(Error, Debug)]
pub enum Error {
    #[error("requested range is out of bounds")]
    OutOfRange,
    #[error(transparent)]
    Storage(#[from] chunk_storage::Error),
    #[error(transparent)]
    Proto(#[from] proto::Error),
    #[error(transparent)]
    ChunkId(#[from] chunk_id::IncorrectChunkIdSize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Generic interface to stream restored data out.
pub trait DataSink {
    fn save_data(&mut self, data: &[u8]) -> Result<()>;
}

/// Every chunk id referenced by a backup, across all iteration levels.
pub type ChunkSet = HashSet<ChunkId>;

/// Restores one instruction stream. `output` may be absent when only
/// the referenced chunk set is of interest (garbage collection).
pub fn restore(
    reader: &mut chunk_storage::Reader<'_>,
    backup_data: &[u8],
    mut output: Option<&mut dyn DataSink>,
    mut chunk_set: Option<&mut ChunkSet>,
) -> Result<()> {
    let mut chunk = Vec::new();

    for instruction in InstructionIter::new(backup_data) {
        let instruction = instruction?;

        if let Some(ref blob) = instruction.chunk_to_emit {
            let id = ChunkId::from_blob(blob)?;
            if let Some(ref mut output) = output {
                let size = reader.get(&id, &mut chunk)?;
                output.save_data(&chunk[..size])?;
            }
            if let Some(ref mut chunk_set) = chunk_set {
                chunk_set.insert(id);
            }
        }

        if let Some(ref bytes) = instruction.bytes_to_emit {
            if let Some(ref mut output) = output {
                output.save_data(bytes)?;
            }
        }
    }
    Ok(())
}

/// Unwraps the iteration rounds recorded in `backup_info`, leaving the
/// final (level-zero) instruction stream in `backup_data`.
pub fn restore_iterations(
    reader: &mut chunk_storage::Reader<'_>,
    backup_info: &mut BackupInfo,
    backup_data: &mut Vec<u8>,
    mut chunk_set: Option<&mut ChunkSet>,
) -> Result<()> {
    loop {
        std::mem::swap(backup_data, &mut backup_info.backup_data);

        if backup_info.iterations > 0 {
            let mut sink = VecSink::default();
            restore(reader, backup_data, Some(&mut sink), chunk_set.as_deref_mut())?;
            backup_info.backup_data = sink.0;
            backup_info.iterations -= 1;
        } else {
            return Ok(());
        }
    }
}

#[derive(Default)]
struct VecSink(Vec<u8>);

impl DataSink for VecSink {
    fn save_data(&mut self, data: &[u8]) -> Result<()> {
        self.0.extend_from_slice(data);
        Ok(())
    }
}

// ── Indexed mode ─────────────────────────────────────────────────────────────

/// Serves random-access reads out of one instruction stream.
///
/// Construction walks the stream once, recording each instruction's
/// absolute output offset; chunk sizes are learned by fetching through
/// the reader's bundle cache (the in-memory index stores no sizes).
pub struct IndexedRestorer {
    instructions: Vec<(u64, BackupInstruction)>,
    total_size:   u64,
}

impl IndexedRestorer {
    pub fn new(
        reader: &mut chunk_storage::Reader<'_>,
        backup_data: &[u8],
    ) -> Result<Self> {
        let mut instructions = Vec::new();
        let mut position = 0u64;
        let mut chunk = Vec::new();

        for instruction in InstructionIter::new(backup_data) {
            let instruction = instruction?;

            // Exactly one field is set per record.
            let length = if let Some(ref blob) = instruction.chunk_to_emit {
                let id = ChunkId::from_blob(blob)?;
                // Fail on dangling references up front.
                reader.get_bundle_id(&id)?;
                reader.get(&id, &mut chunk)? as u64
            } else if let Some(ref bytes) = instruction.bytes_to_emit {
                bytes.len() as u64
            } else {
                0
            };

            instructions.push((position, instruction));
            position += length;
        }

        Ok(Self { instructions, total_size: position })
    }

    /// Total restored size in bytes.
    pub fn size(&self) -> u64 {
        self.total_size
    }

    /// Fills `out` with the bytes at `offset`. Fails with `OutOfRange`
    /// when the range extends past the end.
    pub fn read_range(
        &self,
        reader: &mut chunk_storage::Reader<'_>,
        offset: u64,
        out: &mut [u8],
    ) -> Result<()> {
        if offset + out.len() as u64 > self.total_size {
            return Err(Error::OutOfRange);
        }
        if out.is_empty() {
            return Ok(());
        }

        // First instruction whose range covers `offset`.
        let start = self
            .instructions
            .partition_point(|(position, _)| *position <= offset)
            .saturating_sub(1);

        let mut chunk = Vec::new();
        let mut filled = 0usize;

        for (position, instruction) in &self.instructions[start..] {
            let data: &[u8] = if let Some(ref blob) = instruction.chunk_to_emit {
                let id = ChunkId::from_blob(blob)?;
                let size = reader.get(&id, &mut chunk)?;
                &chunk[..size]
            } else if let Some(ref bytes) = instruction.bytes_to_emit {
                bytes
            } else {
                continue;
            };

            let end = position + data.len() as u64;
            if end <= offset {
                continue;
            }

            let skip = offset.saturating_sub(*position) as usize;
            let want = out.len() - filled;
            let take = (data.len() - skip).min(want);
            out[filled..filled + take].copy_from_slice(&data[skip..skip + take]);
            filled += take;

            if filled == out.len() {
                break;
            }
        }
        Ok(())
    }
}
