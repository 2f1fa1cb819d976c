//! Garbage collection: reconciles live chunks against stored bundles.
//!
//! Phase one traces every backup file through the restorer with a
//! collect-chunks sink, producing the set of chunk ids any backup still
//! references (at every iteration level: intermediate instruction
//! streams reference chunks too).
//!
//! Phase two walks every index record and classifies each bundle:
//! no used chunks → delete; some used → copy the used chunks through a
//! fresh writer into new bundles and delete the old one; all used →
//! keep its record. Indexes that saw any change are rewritten.
//!
//! New files are staged in `tmp/` and renamed into place before any old
//! file is unlinked, so a failure at any point leaves the repository
//! exactly as it was.
//!
//! The deep variant additionally deduplicates chunks and bundle records
//! across index files, dropping index files that turn out to be
//! complete copies.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup_exchanger::find_or_rebuild;
use crate::backup_file;
use crate::backup_restorer::{restore, restore_iterations, ChunkSet};
use crate::bundle;
use crate::chunk_id::ChunkId;
use crate::chunk_index::ChunkIndex;
use crate::chunk_storage;
use crate::index_file;
use crate::proto::BundleInfo;
use crate::repository::{Repository, Result};

pub fn gc(repo: &Repository, deep: bool) -> Result<()> {
    // The writer registers rewritten chunks against a fresh index so
    // nothing deduplicates against bundles that may be going away.
    let mut reindex = ChunkIndex::new();
    let mut writer = chunk_storage::Writer::new(
        &repo.config,
        repo.config.compression,
        &repo.encryption_key,
        &repo.tmp_mgr,
        repo.paths.bundles_path(),
        repo.paths.index_path(),
        repo.runtime.threads,
    );
    let mut reader = chunk_storage::Reader::new(
        &repo.config,
        &repo.encryption_key,
        &repo.chunk_index,
        repo.paths.bundles_path(),
        repo.runtime.cache_bytes,
    );

    let mut collector = BundleCollector::new(repo.paths.bundles_path(), deep);

    tracing::info!("performing garbage collection...");
    tracing::info!("searching for backups...");
    let backups_path = repo.paths.backups_path();
    for relative in find_or_rebuild(&backups_path, None)? {
        let backup = backups_path.join(&relative);
        tracing::info!("checking backup {}...", backup.display());

        let mut backup_info = backup_file::load(&backup, &repo.encryption_key)?;
        let mut backup_data = Vec::new();
        restore_iterations(
            &mut reader,
            &mut backup_info,
            &mut backup_data,
            Some(&mut collector.used_chunk_set),
        )?;
        restore(&mut reader, &backup_data, None, Some(&mut collector.used_chunk_set))?;
    }

    tracing::info!("checking bundles...");
    let mut index_files: Vec<PathBuf> = fs::read_dir(repo.paths.index_path())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    index_files.sort();

    for index_path in &index_files {
        collector.start_index();
        let mut index_reader = index_file::Reader::open(&repo.encryption_key, index_path)?;
        while let Some((info, bundle_id)) = index_reader.read_next_record()? {
            collector.process_bundle(
                &bundle_id,
                &info,
                &mut reader,
                &mut writer,
                &mut reindex,
            )?;
        }
        collector.finish_index(index_path, &mut writer)?;
    }

    collector.commit(&mut writer)?;

    tracing::info!("cleaning up...");
    remove_empty_fanout_dirs(&repo.paths.bundles_path())?;
    tracing::info!("garbage collection complete");
    Ok(())
}

/// Drops `bundles/xx/` subdirectories that lost their last file.
fn remove_empty_fanout_dirs(bundles_path: &Path) -> Result<()> {
    for entry in fs::read_dir(bundles_path)? {
        let path = entry?.path();
        if path.is_dir() && fs::read_dir(&path)?.next().is_none() {
            fs::remove_dir(&path)?;
        }
    }
    Ok(())
}

struct BundleCollector {
    bundles_path: PathBuf,
    deep:         bool,
    /// Repack fully-live bundles too. Not reachable from the CLI yet.
    repack:       bool,

    used_chunk_set:     ChunkSet,
    overall_chunk_set:  ChunkSet,
    overall_bundle_set: HashSet<bundle::Id>,

    files_to_unlink: Vec<PathBuf>,

    index_modified:  bool,
    index_necessary: bool,
    index_total_chunks: usize,
    index_used_chunks:  usize,
    index_kept_bundles:     usize,
    index_modified_bundles: usize,
    index_removed_bundles:  usize,
}

impl BundleCollector {
    fn new(bundles_path: PathBuf, deep: bool) -> Self {
        Self {
            bundles_path,
            deep,
            repack: false,
            used_chunk_set: ChunkSet::new(),
            overall_chunk_set: ChunkSet::new(),
            overall_bundle_set: HashSet::new(),
            files_to_unlink: Vec::new(),
            index_modified: false,
            index_necessary: false,
            index_total_chunks: 0,
            index_used_chunks: 0,
            index_kept_bundles: 0,
            index_modified_bundles: 0,
            index_removed_bundles: 0,
        }
    }

    fn start_index(&mut self) {
        self.index_modified = false;
        self.index_necessary = false;
        self.index_total_chunks = 0;
        self.index_used_chunks = 0;
        self.index_kept_bundles = 0;
        self.index_modified_bundles = 0;
        self.index_removed_bundles = 0;
    }

    fn process_bundle(
        &mut self,
        bundle_id: &bundle::Id,
        info: &BundleInfo,
        reader: &mut chunk_storage::Reader<'_>,
        writer: &mut chunk_storage::Writer<'_>,
        reindex: &mut ChunkIndex,
    ) -> Result<()> {
        let mut total_chunks = 0usize;
        let mut used_chunks = 0usize;

        for record in &info.chunk_record {
            let id = ChunkId::from_blob(&record.id).map_err(bundle::Error::from)?;
            if self.deep && !self.overall_chunk_set.insert(id) {
                // Seen in an earlier index already; this record adds
                // nothing.
                continue;
            }
            total_chunks += 1;
            if self.used_chunk_set.contains(&id) {
                used_chunks += 1;
                self.index_necessary = true;
            }
        }

        self.index_total_chunks += total_chunks;
        self.index_used_chunks += used_chunks;

        let bundle_path = bundle::generate_file_name(bundle_id, &self.bundles_path, false)?;

        if used_chunks == 0 && total_chunks > 0 {
            tracing::debug!("deleting bundle {}", bundle_id.to_hex());
            self.files_to_unlink.push(bundle_path);
            self.index_modified = true;
            self.index_removed_bundles += 1;
        } else if used_chunks < total_chunks || (self.repack && total_chunks > 0) {
            tracing::debug!(
                "bundle {}: used {used_chunks}/{total_chunks} chunks",
                bundle_id.to_hex()
            );
            self.files_to_unlink.push(bundle_path);
            self.index_modified = true;
            self.copy_used_chunks(info, reader, writer, reindex)?;
            self.index_modified_bundles += 1;
        } else if self.deep && total_chunks == 0 {
            // All of this bundle's chunks were already covered by an
            // earlier index: the record is redundant, and the bundle
            // file itself goes unless an earlier index claimed it.
            if self.overall_bundle_set.insert(*bundle_id) {
                tracing::debug!("deleting duplicate bundle {}", bundle_id.to_hex());
                self.files_to_unlink.push(bundle_path);
                self.index_removed_bundles += 1;
            }
            self.index_modified = true;
        } else {
            if self.deep {
                self.overall_bundle_set.insert(*bundle_id);
            }
            writer.add_bundle(info, bundle_id)?;
            tracing::debug!("keeping bundle {}", bundle_id.to_hex());
            self.index_kept_bundles += 1;
        }
        Ok(())
    }

    /// Copies the still-referenced chunks of a partially-live bundle
    /// into the current output bundle stream.
    fn copy_used_chunks(
        &mut self,
        info: &BundleInfo,
        reader: &mut chunk_storage::Reader<'_>,
        writer: &mut chunk_storage::Writer<'_>,
        reindex: &mut ChunkIndex,
    ) -> Result<()> {
        let mut chunk = Vec::new();
        for record in &info.chunk_record {
            let id = ChunkId::from_blob(&record.id).map_err(bundle::Error::from)?;
            if self.used_chunk_set.contains(&id) {
                let size = reader.get(&id, &mut chunk)?;
                writer.add(reindex, &id, &chunk[..size])?;
            }
        }
        Ok(())
    }

    fn finish_index(
        &mut self,
        index_path: &Path,
        writer: &mut chunk_storage::Writer<'_>,
    ) -> Result<()> {
        tracing::info!(
            "chunks used: {}/{}, bundles: {} kept, {} modified, {} removed",
            self.index_used_chunks,
            self.index_total_chunks,
            self.index_kept_bundles,
            self.index_modified_bundles,
            self.index_removed_bundles,
        );
        if self.index_modified {
            self.files_to_unlink.push(index_path.to_owned());
            self.commit(writer)?;
        } else {
            // No change: drop the records accumulated for this index.
            writer.reset()?;
            if self.deep && !self.index_necessary {
                // A complete copy of earlier indexes; not needed.
                self.files_to_unlink.push(index_path.to_owned());
            }
        }
        Ok(())
    }

    /// New files first, deletions last: a failure in between leaves
    /// only redundant extra files, never a missing one.
    fn commit(&mut self, writer: &mut chunk_storage::Writer<'_>) -> Result<()> {
        writer.commit()?;
        for path in self.files_to_unlink.drain(..) {
            tracing::debug!("unlinking {}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("could not unlink {}: {e}", path.display());
            }
        }
        Ok(())
    }
}
