//! Chunker-level properties: the instruction stream a backup produces
//! must reassemble to the input, reference stored chunks for repeated
//! content, and respect the small-literal threshold.

use std::path::Path;

use proptest::prelude::*;
use tempfile::TempDir;

use bitstash::backup_creator::BackupCreator;
use bitstash::chunk_id::ChunkId;
use bitstash::chunk_index::ChunkIndex;
use bitstash::chunk_storage;
use bitstash::compression::CompressionMethod;
use bitstash::config::StorageConfig;
use bitstash::encryption_key::EncryptionKey;
use bitstash::proto::{BackupInstruction, InstructionIter};
use bitstash::tmp_mgr::TmpMgr;

struct Harness {
    _dir:    TempDir,
    config:  StorageConfig,
    key:     EncryptionKey,
    tmp:     TmpMgr,
    bundles: std::path::PathBuf,
    index:   std::path::PathBuf,
}

impl Harness {
    fn new(chunk_max_size: u32) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bundles")).unwrap();
        std::fs::create_dir_all(dir.path().join("index")).unwrap();
        let tmp = TmpMgr::new(dir.path().join("tmp")).unwrap();
        let config = StorageConfig {
            chunk_max_size,
            bundle_max_payload_size: chunk_max_size * 4,
            compression: CompressionMethod::Lz4,
            small_literal_threshold: 128,
        };
        let bundles = dir.path().join("bundles");
        let index = dir.path().join("index");
        Self { _dir: dir, config, key: EncryptionKey::none(), tmp, bundles, index }
    }

    fn writer(&self) -> chunk_storage::Writer<'_> {
        chunk_storage::Writer::new(
            &self.config,
            self.config.compression,
            &self.key,
            &self.tmp,
            self.bundles.clone(),
            self.index.clone(),
            1,
        )
    }

    fn chunk(
        &self,
        data: &[u8],
        index: &mut ChunkIndex,
        writer: &mut chunk_storage::Writer<'_>,
    ) -> Vec<u8> {
        let mut creator = BackupCreator::new(&self.config);
        let mut left = data;
        while !left.is_empty() {
            let buffer = creator.input_buffer();
            let n = buffer.len().min(left.len());
            buffer[..n].copy_from_slice(&left[..n]);
            creator.handle_more_data(n, index, writer).unwrap();
            left = &left[n..];
        }
        creator.finish(index, writer).unwrap();
        creator.into_backup_data()
    }
}

/// Reassembles an instruction stream by fetching referenced chunks from
/// the committed store.
fn reassemble(
    stream: &[u8],
    index: &ChunkIndex,
    config: &StorageConfig,
    key: &EncryptionKey,
    bundles: &Path,
) -> Vec<u8> {
    let mut reader =
        chunk_storage::Reader::new(config, key, index, bundles.to_owned(), 1 << 20);
    let mut out = Vec::new();
    let mut chunk = Vec::new();
    for instruction in InstructionIter::new(stream) {
        let instruction: BackupInstruction = instruction.unwrap();
        if let Some(blob) = instruction.chunk_to_emit {
            let id = ChunkId::from_blob(&blob).unwrap();
            let size = reader.get(&id, &mut chunk).unwrap();
            out.extend_from_slice(&chunk[..size]);
        }
        if let Some(bytes) = instruction.bytes_to_emit {
            out.extend_from_slice(&bytes);
        }
    }
    out
}

#[test]
fn literal_threshold_is_respected() {
    let harness = Harness::new(1024);
    let mut index = ChunkIndex::new();
    let mut writer = harness.writer();

    // 127 bytes: below the threshold, must be an inline literal.
    let below: Vec<u8> = (0..127u8).collect();
    let stream = harness.chunk(&below, &mut index, &mut writer);
    let instructions: Vec<BackupInstruction> =
        InstructionIter::new(&stream).map(|i| i.unwrap()).collect();
    assert_eq!(instructions.len(), 1);
    assert!(instructions[0].bytes_to_emit.is_some());
    assert!(index.is_empty());

    // 128 bytes: at the threshold, becomes a stored chunk.
    let at: Vec<u8> = (0..128u8).collect();
    let stream = harness.chunk(&at, &mut index, &mut writer);
    let instructions: Vec<BackupInstruction> =
        InstructionIter::new(&stream).map(|i| i.unwrap()).collect();
    assert_eq!(instructions.len(), 1);
    assert!(instructions[0].chunk_to_emit.is_some());
    assert_eq!(index.len(), 1);
}

#[test]
fn shared_middle_section_is_referenced() {
    let harness = Harness::new(1024);
    let mut index = ChunkIndex::new();
    let mut writer = harness.writer();

    let shared: Vec<u8> = (0..4096u32).map(|x| (x * 31) as u8).collect();
    let first = harness.chunk(&shared, &mut index, &mut writer);
    let chunks_after_first = index.len();

    // The shared block reappears at an arbitrary (unaligned) offset.
    let mut second_input = vec![0xAAu8; 777];
    second_input.extend_from_slice(&shared);
    second_input.extend_from_slice(&[0xBBu8; 300]);
    let second = harness.chunk(&second_input, &mut index, &mut writer);

    // The windows covering the shared section must be emitted as
    // references, not re-stored: only the head and tail are new.
    let new_chunks = index.len() - chunks_after_first;
    assert!(new_chunks <= 2, "expected at most head+tail chunks, got {new_chunks}");

    writer.commit().unwrap();
    assert_eq!(
        reassemble(&first, &index, &harness.config, &harness.key, &harness.bundles),
        shared
    );
    assert_eq!(
        reassemble(&second, &index, &harness.config, &harness.key, &harness.bundles),
        second_input
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // Chunk, commit, reassemble: identity for arbitrary inputs and
    // chunk sizes, including inputs made of repeated blocks.
    #[test]
    fn instruction_stream_reassembles_to_input(
        base in proptest::collection::vec(any::<u8>(), 0..3000),
        repeats in 1usize..5,
        chunk_size in prop_oneof![Just(256u32), Just(512u32), Just(1024u32)],
    ) {
        let harness = Harness::new(chunk_size);
        let mut index = ChunkIndex::new();
        let mut writer = harness.writer();

        let data: Vec<u8> =
            std::iter::repeat(base.iter().copied()).take(repeats).flatten().collect();

        let stream = harness.chunk(&data, &mut index, &mut writer);
        writer.commit().unwrap();

        let out = reassemble(&stream, &index, &harness.config, &harness.key, &harness.bundles);
        prop_assert_eq!(out, data);
    }
}
