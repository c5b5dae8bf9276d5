//! The image/layer store boundary.
//!
//! The pipelines never touch store metadata directly; they go through the
//! [`ImageStore`] trait, which mirrors the operations of the containers-storage
//! engine that matter here.  [`OverlayStore`] implements the trait directly on
//! the on-disk layout of the overlay driver, and [`StoreSession`] binds a store
//! to a scratch run directory for the duration of one run.
//!
//! The only pieces of the on-disk layout the pipelines rely on are described
//! by [`StoreLayout`]: a layer's overlay alias lives in its `link` marker file,
//! and sidecars live under `squash/` with symlinks in the short-link directory.

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::digest::LayerDigest;

pub mod error;
pub mod layout;
pub mod lockfile;
mod mount;
pub mod overlay;
pub mod session;

pub use error::{Result, StoreError};
pub use layout::StoreLayout;
pub use overlay::OverlayStore;
pub use session::StoreSession;

/// Big data key of an image's manifest.  Keys starting with this prefix
/// (`manifest-<digest>`) hold alternative manifests of the same image.
pub const MANIFEST_KEY: &str = "manifest";

/// An image as recorded by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    /// Names (tags) pointing at this image, in order.
    pub names: Vec<String>,
    /// Every name this image ever had, most recent first.
    pub names_history: Vec<String>,
    /// The uppermost layer.  Every valid image has one.
    pub top_layer: Option<String>,
    pub created: Option<DateTime<Utc>>,
    /// Digest of the image's manifest.
    pub digest: Option<String>,
    /// Keys of the blobs attached to this image.
    pub big_data_names: Vec<String>,
}

impl ImageRecord {
    /// Returns true if any of `names` is one of this image's names.
    pub fn has_any_name<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names
            .iter()
            .any(|wanted| self.names.iter().any(|n| n == wanted.as_ref()))
    }
}

/// A layer as recorded by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    pub id: String,
    /// Overlay alias: the short id naming the layer in `overlay/l/`.
    pub link: String,
    /// Parent layer, if any.
    pub parent: Option<String>,
    /// Digest and size of the uncompressed diff this layer was created from.
    pub uncompressed: Option<LayerDigest>,
}

/// Options for [`ImageStore::create_image`].
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Manifest digest of the new image.
    pub digest: Option<String>,
    /// Creation time; defaults to now.
    pub created: Option<DateTime<Utc>>,
    /// Names to seed the name history with, in addition to the new names.
    pub names_history: Vec<String>,
}

/// The operations the pipelines need from an image/layer store.
pub trait ImageStore {
    /// The store's graph root.
    fn root(&self) -> &Path;

    /// Path conventions of this store's root.
    fn layout(&self) -> StoreLayout {
        StoreLayout::new(self.root())
    }

    /// Lists every image in the store.
    fn images(&self) -> Result<Vec<ImageRecord>>;

    /// Finds the image carrying `name` (or whose id is `name`).
    ///
    /// Returns [`StoreError::ImageNotFound`] if there is none.
    fn find_image(&self, name: &str) -> Result<ImageRecord> {
        self.images()?
            .into_iter()
            .find(|image| image.id == name || image.names.iter().any(|n| n == name))
            .ok_or_else(|| StoreError::ImageNotFound(name.to_string()))
    }

    /// Makes the merged root filesystem of an image available and returns its path.
    fn mount_image(&self, image_id: &str) -> Result<PathBuf>;

    /// Releases a root filesystem obtained from [`mount_image`](Self::mount_image).
    fn unmount_image(&self, image_id: &str) -> Result<()>;

    /// Lists the layers created from an uncompressed diff with this digest.
    fn layers_by_digest(&self, digest: &str) -> Result<Vec<LayerRecord>>;

    /// Creates a new parentless layer from an uncompressed tar stream.
    ///
    /// The stream must reproduce `expected` exactly, including its size;
    /// otherwise the layer is discarded and [`StoreError::DigestMismatch`] is
    /// returned.
    fn put_layer<R: Read>(&self, diff: R, expected: &LayerDigest) -> Result<LayerRecord>;

    /// Creates a new image record on top of `layer_id`.  Names already held by
    /// other images move to the new image.
    fn create_image(
        &self,
        layer_id: &str,
        names: &[String],
        options: ImageOptions,
    ) -> Result<ImageRecord>;

    /// Reads the blob stored under `key` for an image.
    fn big_data(&self, image_id: &str, key: &str) -> Result<Vec<u8>>;

    /// Stores a blob under `key` for an image, replacing any previous one.
    fn set_big_data(&self, image_id: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Deletes an image and every layer no other image still uses.
    fn delete_image(&self, image_id: &str) -> Result<()>;
}

/// Looks an image up by each of `names` in turn and returns the first match.
pub fn find_by_names<S: ImageStore, N: AsRef<str>>(store: &S, names: &[N]) -> Result<ImageRecord> {
    for name in names {
        match store.find_image(name.as_ref()) {
            Err(StoreError::ImageNotFound(_)) => continue,
            other => return other,
        }
    }
    let wanted = names
        .first()
        .map(|n| n.as_ref().to_string())
        .unwrap_or_default();
    Err(StoreError::ImageNotFound(wanted))
}
