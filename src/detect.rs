//! Deciding whether an image already has a squashfs sidecar in a store.

use std::{fs, io::ErrorKind, path::Path};

use log::{debug, warn};

use crate::{
    error::{Error, Result},
    storage::{find_by_names, ImageStore, StoreError},
};

/// Whether an image needs migrating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    /// The image and both halves of its sidecar exist.
    Migrated { image_id: String, link: String },
    /// Anything else, including a half-written sidecar.
    NotMigrated,
}

/// Returns Ok(false) if `path` does not exist, Ok(true) if it does.
fn present(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(format!("checking {path:?}"), e)),
    }
}

/// Checks whether the image carrying any of `names` is migrated in `store`.
///
/// A missing image, a missing layer link or a missing half of the sidecar all
/// mean [`MigrationState::NotMigrated`]; other I/O errors and store errors
/// are fatal, as is an image without a top layer.
pub fn check_migrated<S: ImageStore, N: AsRef<str>>(
    store: &S,
    names: &[N],
) -> Result<MigrationState> {
    let image = match find_by_names(store, names) {
        Ok(image) => image,
        Err(StoreError::ImageNotFound(name)) => {
            debug!("Image {name} not found in {:?}", store.root());
            return Ok(MigrationState::NotMigrated);
        }
        Err(e) => return Err(e.into()),
    };

    let top = image
        .top_layer
        .clone()
        .ok_or_else(|| Error::Integrity(format!("image {} has no top layer", image.id)))?;

    let layout = store.layout();
    let link = match layout.read_link(&top) {
        Ok(link) => link,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Top layer {top} of image {} has no link", image.id);
            return Ok(MigrationState::NotMigrated);
        }
        Err(e) => return Err(Error::io(format!("reading link of layer {top}"), e)),
    };
    debug!("Top layer {top} has link {link}");

    let symlink = present(&layout.squash_symlink(&link))?;
    let sidecar = present(&layout.squash_file(&link))?;
    match (symlink, sidecar) {
        (true, true) => {
            debug!("Image {} is fully migrated", image.id);
            Ok(MigrationState::Migrated {
                image_id: image.id,
                link,
            })
        }
        (false, false) => Ok(MigrationState::NotMigrated),
        (symlink, sidecar) => {
            warn!(
                "Image {} is partially migrated (symlink: {symlink}, sidecar: {sidecar})",
                image.id
            );
            Ok(MigrationState::NotMigrated)
        }
    }
}
