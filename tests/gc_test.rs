//! Garbage-collector behaviors beyond the basic reclamation path:
//! duplicate-index handling in deep mode, empty repositories, fanout
//! directory cleanup, and a randomized create/delete/collect exercise.

use std::fs;
use std::path::Path;

use proptest::prelude::*;
use tempfile::TempDir;

use bitstash::compression::CompressionMethod;
use bitstash::config::{RuntimeConfig, StorageConfig};
use bitstash::repository::Repository;

fn test_config() -> StorageConfig {
    StorageConfig {
        chunk_max_size:          4096,
        bundle_max_payload_size: 16384,
        compression:             CompressionMethod::Lz4,
        small_literal_threshold: 128,
    }
}

fn runtime() -> RuntimeConfig {
    RuntimeConfig { threads: 2, cache_bytes: 1 << 20, compression: None }
}

fn open(dir: &Path) -> Repository {
    Repository::open(dir, "", runtime(), false).unwrap()
}

fn backup_bytes(repo: &mut Repository, data: &[u8], output: &Path) {
    repo.backup(&mut &data[..], output).unwrap();
}

fn restore_bytes(repo: &Repository, backup: &Path) -> Vec<u8> {
    let mut out = Vec::new();
    repo.restore(backup, &mut out).unwrap();
    out
}

fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed as u8
        })
        .collect()
}

fn count_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

#[test]
fn gc_on_empty_repository_is_a_noop() {
    let dir = TempDir::new().unwrap();
    Repository::init(dir.path(), None, &test_config()).unwrap();
    let repo = open(dir.path());
    repo.gc(false).unwrap();
    repo.gc(true).unwrap();
}

#[test]
fn deep_gc_drops_a_duplicated_index_file() {
    let dir = TempDir::new().unwrap();
    Repository::init(dir.path(), None, &test_config()).unwrap();

    let data = pseudo_random(40 * 1024, 11);
    let backup = dir.path().join("backups/b");
    {
        let mut repo = open(dir.path());
        backup_bytes(&mut repo, &data, &backup);
    }

    let index_dir = dir.path().join("index");
    assert_eq!(count_files(&index_dir), 1);

    // Simulate a stray copy of the index (an interrupted import, say).
    let original = fs::read_dir(&index_dir).unwrap().next().unwrap().unwrap().path();
    fs::copy(&original, index_dir.join("ffffcopy")).unwrap();
    assert_eq!(count_files(&index_dir), 2);

    // Fast mode tolerates the duplicate and keeps both files.
    {
        let repo = open(dir.path());
        repo.gc(false).unwrap();
    }
    assert_eq!(count_files(&index_dir), 2);

    // Deep mode recognises the complete copy and drops one of them.
    {
        let repo = open(dir.path());
        repo.gc(true).unwrap();
    }
    assert_eq!(count_files(&index_dir), 1);

    let repo = open(dir.path());
    assert_eq!(restore_bytes(&repo, &backup), data);
}

#[test]
fn gc_removes_emptied_fanout_directories() {
    let dir = TempDir::new().unwrap();
    Repository::init(dir.path(), None, &test_config()).unwrap();

    let data = pseudo_random(64 * 1024, 12);
    let backup = dir.path().join("backups/b");
    {
        let mut repo = open(dir.path());
        backup_bytes(&mut repo, &data, &backup);
    }

    // With no backups left, everything is garbage.
    fs::remove_file(&backup).unwrap();
    {
        let repo = open(dir.path());
        repo.gc(false).unwrap();
    }

    assert_eq!(count_files(&dir.path().join("bundles")), 0);
    // The two-hex fanout subdirectories are gone too.
    assert_eq!(fs::read_dir(dir.path().join("bundles")).unwrap().count(), 0);
    assert_eq!(count_files(&dir.path().join("index")), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    // Create K backups from overlapping data, delete a subset, collect,
    // and verify every survivor restores bit-identically.
    #[test]
    fn survivors_restore_after_gc(
        seeds in proptest::collection::vec(1u64..1000, 2..5),
        delete_mask in proptest::collection::vec(any::<bool>(), 2..5),
        deep in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path(), None, &test_config()).unwrap();

        // Overlapping inputs: a shared prefix plus a per-backup tail, so
        // bundles end up shared between backups.
        let shared = pseudo_random(24 * 1024, 777);
        let mut backups = Vec::new();
        {
            let mut repo = open(dir.path());
            for (i, seed) in seeds.iter().enumerate() {
                let mut data = shared.clone();
                data.extend_from_slice(&pseudo_random(16 * 1024, *seed));
                let path = dir.path().join(format!("backups/b{i}"));
                backup_bytes(&mut repo, &data, &path);
                backups.push((path, data));
            }
        }

        let mut survivors = Vec::new();
        for (i, (path, data)) in backups.into_iter().enumerate() {
            if delete_mask.get(i).copied().unwrap_or(false) {
                fs::remove_file(&path).unwrap();
            } else {
                survivors.push((path, data));
            }
        }

        {
            let repo = open(dir.path());
            repo.gc(deep).unwrap();
        }

        let repo = open(dir.path());
        for (path, data) in &survivors {
            let mut out = Vec::new();
            repo.restore(path, &mut out).unwrap();
            prop_assert_eq!(&out, data);
        }
    }
}
