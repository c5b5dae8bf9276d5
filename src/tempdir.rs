//! Scratch directories that can outlive the process for post-mortem
//! inspection.
//!
//! Setting `PARALLAX_KEEP_TMP` to any non-empty value keeps every scratch
//! directory (store run roots, work directories, mirrors) instead of removing
//! it on drop.

use std::{
    io::Result,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

/// Environment variable that disables scratch directory cleanup.
pub const KEEP_TMP_ENV: &str = "PARALLAX_KEEP_TMP";

/// Returns true if scratch directories should be kept.
pub fn keep_tmp() -> bool {
    std::env::var_os(KEEP_TMP_ENV).is_some_and(|v| !v.is_empty())
}

/// A temporary directory removed on drop unless [`KEEP_TMP_ENV`] is set.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Creates a new directory under the system temporary directory with the
    /// given name prefix.
    pub fn new(prefix: &str) -> Result<Self> {
        Self::new_in(std::env::temp_dir(), prefix)
    }

    /// Creates a new directory under `parent` with the given name prefix.
    pub fn new_in(parent: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(parent)?
            .into_path();
        debug!("Created scratch dir {path:?}");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if keep_tmp() {
            info!("{KEEP_TMP_ENV} set, keeping {:?}", self.path);
            return;
        }
        if let Err(e) = crate::fs::remove_tree(&self.path) {
            warn!("Failed to remove scratch dir {:?}: {e}", self.path);
        }
    }
}
