//! Export/import: copying backups, bundles and index files between two
//! repositories that may use different keys.
//!
//! Bundles are re-encrypted without recompression; index files are
//! rewritten record by record; backup files are loaded and re-saved.
//! Everything lands in the destination's `tmp/` first and is renamed
//! into place in one final pass. Files that already exist at the
//! destination are skipped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::backup_file;
use crate::bundle;
use crate::index_file;
use crate::repository::{Repository, Result};
use crate::tmp_mgr::TemporaryFile;

/// What an export/import run carries over.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeFlags {
    pub backups: bool,
    pub bundles: bool,
    pub index:   bool,
}

impl ExchangeFlags {
    pub fn any(&self) -> bool {
        self.backups || self.bundles || self.index
    }
}

/// Lists every file under `src` as a path relative to it, recursing into
/// subdirectories. When `dst` is given, the same directory structure is
/// created there along the way.
pub fn find_or_rebuild(src: &Path, dst: Option<&Path>) -> io::Result<Vec<PathBuf>> {
    let mut files = recreate_directories(src, dst, Path::new(""))?;
    files.sort();
    Ok(files)
}

fn recreate_directories(
    src: &Path,
    dst: Option<&Path>,
    relative: &Path,
) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(src.join(relative))? {
        let entry = entry?;
        let current = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            if let Some(dst) = dst {
                let mirrored = dst.join(&current);
                if !mirrored.exists() {
                    tracing::info!(
                        "directory {} not found in destination, creating...",
                        current.display()
                    );
                    fs::create_dir_all(mirrored)?;
                }
            }
            files.extend(recreate_directories(src, dst, &current)?);
        } else {
            files.push(current);
        }
    }
    Ok(files)
}

/// Copies the selected file classes from `src` to `dst`.
pub fn exchange(src: &Repository, dst: &Repository, flags: &ExchangeFlags) -> Result<()> {
    let mut pending_renames: Vec<(TemporaryFile, PathBuf)> = Vec::new();

    if flags.bundles {
        tracing::info!("searching for bundles...");
        let src_dir = src.paths.bundles_path();
        let dst_dir = dst.paths.bundles_path();
        for relative in find_or_rebuild(&src_dir, Some(&dst_dir))? {
            let output = dst_dir.join(&relative);
            if output.exists() {
                tracing::info!("bundle file {} exists - skipped", relative.display());
                continue;
            }
            tracing::info!("processing bundle file {}...", relative.display());
            let temp = dst.tmp_mgr.make_temporary_file()?;
            bundle::copy_over(
                &src_dir.join(&relative),
                &src.encryption_key,
                temp.path(),
                &dst.encryption_key,
            )?;
            pending_renames.push((temp, output));
        }
        tracing::info!("bundle exchange completed");
    }

    if flags.index {
        tracing::info!("searching for indexes...");
        let src_dir = src.paths.index_path();
        let dst_dir = dst.paths.index_path();
        for relative in find_or_rebuild(&src_dir, Some(&dst_dir))? {
            let output = dst_dir.join(&relative);
            if output.exists() {
                tracing::info!("index file {} exists - skipped", relative.display());
                continue;
            }
            tracing::info!("processing index file {}...", relative.display());
            let temp = dst.tmp_mgr.make_temporary_file()?;
            let mut reader = index_file::Reader::open(&src.encryption_key, &src_dir.join(&relative))?;
            let mut writer = index_file::Writer::create(&dst.encryption_key, temp.path())?;
            while let Some((info, bundle_id)) = reader.read_next_record()? {
                writer.add(&info, &bundle_id)?;
            }
            writer.finish()?;
            pending_renames.push((temp, output));
        }
        tracing::info!("index exchange completed");
    }

    if flags.backups {
        tracing::info!("searching for backups...");
        let src_dir = src.paths.backups_path();
        let dst_dir = dst.paths.backups_path();
        for relative in find_or_rebuild(&src_dir, Some(&dst_dir))? {
            let output = dst_dir.join(&relative);
            if output.exists() {
                tracing::info!("backup file {} exists - skipped", relative.display());
                continue;
            }
            tracing::info!("processing backup file {}...", relative.display());
            let backup_info = backup_file::load(&src_dir.join(&relative), &src.encryption_key)?;
            let temp = dst.tmp_mgr.make_temporary_file()?;
            backup_file::save(temp.path(), &dst.encryption_key, &backup_info)?;
            pending_renames.push((temp, output));
        }
        tracing::info!("backup exchange completed");
    }

    if !pending_renames.is_empty() {
        tracing::info!("moving files from temp directory to appropriate places...");
        for (temp, output) in pending_renames {
            temp.move_over_to(&output, false)?;
        }
    }
    Ok(())
}
