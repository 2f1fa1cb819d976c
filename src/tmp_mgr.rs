//! Temporary file management.
//!
//! Every file the engine produces (bundles, index files, backup files)
//! is materialized under `tmp/` and atomically renamed over its final
//! path only on commit. A crash therefore leaves nothing but files in
//! `tmp/`, which are swept away the next time the repository is opened.

use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("won't overwrite existing file: {0}")]
    WontOverwrite(PathBuf),
    #[error("can't create a temporary file in {0}")]
    CantCreate(PathBuf),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A file under `tmp/`, deleted on drop unless moved into place.
pub struct TemporaryFile {
    path: Option<PathBuf>,
}

impl TemporaryFile {
    pub fn path(&self) -> &Path {
        self.path.as_ref().expect("temporary file was already moved")
    }

    /// Renames the file over `destination`. Unless `may_overwrite`, an
    /// existing destination is refused.
    pub fn move_over_to(mut self, destination: &Path, may_overwrite: bool) -> Result<()> {
        if !may_overwrite && destination.exists() {
            return Err(Error::WontOverwrite(destination.to_owned()));
        }
        let path = self.path.take().expect("temporary file was already moved");
        fs::rename(path, destination)?;
        Ok(())
    }
}

impl Drop for TemporaryFile {
    fn drop(&mut self) {
        if let Some(ref path) = self.path {
            let _ = fs::remove_file(path);
        }
    }
}

/// Hands out temporary files in a managed directory.
pub struct TmpMgr {
    path: PathBuf,
}

impl TmpMgr {
    /// Creates (or adopts) the staging directory, deleting any stale
    /// files a previous crashed run left behind.
    pub fn new(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            fs::create_dir_all(&path)?;
        } else {
            for entry in fs::read_dir(&path)? {
                let stale = entry?.path();
                if stale.is_file() {
                    let _ = fs::remove_file(stale);
                }
            }
        }
        Ok(Self { path })
    }

    /// Creates an empty uniquely-named file in the staging directory.
    pub fn make_temporary_file(&self) -> Result<TemporaryFile> {
        for _ in 0..16 {
            let mut suffix = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut suffix);
            let candidate = self.path.join(format!("tmp-{}", hex::encode(suffix)));
            if candidate.exists() {
                continue;
            }
            fs::File::create(&candidate)?;
            return Ok(TemporaryFile { path: Some(candidate) });
        }
        Err(Error::CantCreate(self.path.clone()))
    }
}

impl Drop for TmpMgr {
    fn drop(&mut self) {
        // Removing the directory only succeeds when it is empty; a
        // non-empty one means temp files are still owned elsewhere.
        let _ = fs::remove_dir(&self.path);
    }
}
