//! A store handle bound to a scratch run directory for the length of one run.

use std::{ops::Deref, path::Path};

use log::{debug, warn};

use super::{error::Result, OverlayStore};
use crate::tempdir::ScratchDir;

/// An open [`OverlayStore`] plus the run directory holding its transient
/// state.
///
/// Dropping the session removes leftover merged root filesystems and then the
/// run directory itself.
#[derive(Debug)]
pub struct StoreSession {
    store: OverlayStore,
    run_root: ScratchDir,
}

impl StoreSession {
    /// Opens the store at `graph_root` with a fresh run directory named after
    /// `prefix`.
    pub fn open(graph_root: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let graph_root = graph_root.as_ref();
        let run_root = ScratchDir::new(prefix)?;
        debug!(
            "Opening store session on {graph_root:?} (run root {:?})",
            run_root.path()
        );
        let store = OverlayStore::open(graph_root, run_root.path())?;
        Ok(Self { store, run_root })
    }

    pub fn store(&self) -> &OverlayStore {
        &self.store
    }

    pub fn run_root(&self) -> &Path {
        self.run_root.path()
    }
}

impl Deref for StoreSession {
    type Target = OverlayStore;

    fn deref(&self) -> &OverlayStore {
        &self.store
    }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        if let Err(e) = self.store.unmount_all() {
            warn!("Failed to release mounts under {:?}: {e}", self.run_root.path());
        }
    }
}
