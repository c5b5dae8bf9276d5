//! Path conventions of an overlay store and of the squash sidecars that live
//! next to it.
//!
//! ```text
//! <root>/
//! +-- overlay/
//! |   +-- <layer-id>/link        # short link id (26 chars)
//! |   +-- l/<link>               # -> ../<layer-id>/diff
//! |   +-- l/<link>.squash        # -> ../../squash/<link>.squash
//! +-- squash/
//!     +-- <link>.squash          # the sidecar itself
//! ```
//!
//! The sidecar symlink sits in the short-link directory so that an overlay
//! consumer which knows a layer's link id finds the squashfs image next to
//! the layer's own short link.

use std::{
    fs,
    io::Result,
    path::{Path, PathBuf},
};

/// Directory holding per-layer directories and the short-link directory.
const OVERLAY_DIR: &str = "overlay";
/// Short-link directory, relative to [`OVERLAY_DIR`].
const SHORT_LINK_DIR: &str = "l";
/// Directory holding the sidecar files.
const SQUASH_DIR: &str = "squash";
/// Sidecar file extension.
const SQUASH_EXT: &str = ".squash";

/// Paths inside one store root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join(OVERLAY_DIR)
    }

    pub fn layer_dir(&self, layer_id: &str) -> PathBuf {
        self.overlay_dir().join(layer_id)
    }

    /// The per-layer marker file holding the layer's overlay alias.
    pub fn link_file(&self, layer_id: &str) -> PathBuf {
        self.layer_dir(layer_id).join("link")
    }

    pub fn short_link_dir(&self) -> PathBuf {
        self.overlay_dir().join(SHORT_LINK_DIR)
    }

    /// `overlay/l/<link>`, the layer's own short link.
    pub fn short_link(&self, link: &str) -> PathBuf {
        self.short_link_dir().join(link)
    }

    pub fn squash_dir(&self) -> PathBuf {
        self.root.join(SQUASH_DIR)
    }

    /// `squash/<link>.squash`, the canonical sidecar file.
    pub fn squash_file(&self, link: &str) -> PathBuf {
        self.squash_dir().join(format!("{link}{SQUASH_EXT}"))
    }

    /// `overlay/l/<link>.squash`, the symlink exposing the sidecar.
    pub fn squash_symlink(&self, link: &str) -> PathBuf {
        self.short_link_dir().join(format!("{link}{SQUASH_EXT}"))
    }

    /// Relative target of [`squash_symlink`](Self::squash_symlink), so that
    /// the link stays valid when the store is mounted elsewhere.
    pub fn squash_symlink_target(link: &str) -> PathBuf {
        Path::new("..")
            .join("..")
            .join(SQUASH_DIR)
            .join(format!("{link}{SQUASH_EXT}"))
    }

    /// Reads a layer's overlay alias from its `link` marker file.
    pub fn read_link(&self, layer_id: &str) -> Result<String> {
        let content = fs::read_to_string(self.link_file(layer_id))?;
        Ok(content.trim().to_string())
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn sidecar_paths() {
        let layout = StoreLayout::new("/mnt/nfs/podman");
        assert_eq!(
            layout.squash_file("ABC"),
            Path::new("/mnt/nfs/podman/squash/ABC.squash")
        );
        assert_eq!(
            layout.squash_symlink("ABC"),
            Path::new("/mnt/nfs/podman/overlay/l/ABC.squash")
        );
        // the relative target resolves to the canonical file
        let resolved = layout
            .squash_symlink("ABC")
            .parent()
            .unwrap()
            .join(StoreLayout::squash_symlink_target("ABC"));
        assert_eq!(
            resolved,
            Path::new("/mnt/nfs/podman/overlay/l/../../squash/ABC.squash")
        );
    }

    #[test]
    fn link_is_trimmed() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(tmp.path());
        fs::create_dir_all(layout.layer_dir("abc")).unwrap();
        fs::write(layout.link_file("abc"), "QWERTYUIOPASDFGHJKLZXCVBNM\n").unwrap();
        assert_eq!(layout.read_link("abc").unwrap(), "QWERTYUIOPASDFGHJKLZXCVBNM");
    }
}
