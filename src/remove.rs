//! Removing a migrated image and its sidecar from the read-only store.

use log::{info, warn};

use crate::{
    config::Config,
    error::Result,
    mirror::with_store_root,
    reference::{resolve_names, ResolvedNames, ShortNameResolver},
    squash::remove_sidecar,
    storage::{find_by_names, ImageStore, StoreError, StoreSession},
};

/// What [`remove_image`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// No image carries any of the names.
    NotFound,
    Removed {
        image_id: String,
        /// Whether the sidecar was removed along with the image.
        sidecar_removed: bool,
    },
}

/// Deletes the image named by `names` from `store`, removing its sidecar
/// first.
///
/// A missing image is not an error.  Problems with the sidecar are logged
/// and never stop the image from being deleted; failing to delete the image
/// record is fatal.
pub fn remove_image<S: ImageStore>(store: &S, names: &ResolvedNames) -> Result<RemovalOutcome> {
    let image = match find_by_names(store, &names.names()) {
        Ok(image) => image,
        Err(StoreError::ImageNotFound(_)) => {
            info!("Image {names} not found in {:?}, nothing to remove", store.root());
            return Ok(RemovalOutcome::NotFound);
        }
        Err(e) => return Err(e.into()),
    };
    info!("Removing image {} ({names})", image.id);

    let sidecar_removed = match image.top_layer.as_deref() {
        None => {
            warn!("Image {} has no top layer, not looking for a sidecar", image.id);
            false
        }
        Some(top) => remove_image_sidecar(store, &image.id, top)?,
    };

    store.delete_image(&image.id)?;
    info!("Removed image {} ({names})", image.id);

    Ok(RemovalOutcome::Removed {
        image_id: image.id,
        sidecar_removed,
    })
}

fn remove_image_sidecar<S: ImageStore>(store: &S, image_id: &str, top: &str) -> Result<bool> {
    let layout = store.layout();
    let link = match layout.read_link(top) {
        Ok(link) => link,
        Err(e) => {
            warn!("Cannot read the link of layer {top}, leaving its sidecar alone: {e}");
            return Ok(false);
        }
    };

    let shared = store
        .images()?
        .into_iter()
        .any(|other| other.id != image_id && other.top_layer.as_deref() == Some(top));
    if shared {
        info!("Layer {top} is still used by another image, keeping sidecar {link}");
        return Ok(false);
    }

    info!("Removing sidecar {link}");
    match remove_sidecar(&layout, &link) {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!("Failed to remove sidecar {link} of layer {top}: {e}");
            Ok(false)
        }
    }
}

/// Resolves the configured image and removes it from the read-only store.
pub fn run_removal<R: ShortNameResolver + ?Sized>(
    config: &Config,
    resolver: &R,
) -> Result<RemovalOutcome> {
    let names = resolve_names(&config.image, resolver)?;
    info!("Starting removal of {names}");

    let rsync = config.mirror.then_some(config.rsync_path.as_path());
    with_store_root(&config.ro_storage_path, rsync, |root| {
        let session = StoreSession::open(root, "parallax-rmi-")?;
        remove_image(session.store(), &names)
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        squash::build_sidecar,
        test::{fake_compressor, tempdir, TestStore},
    };

    fn names(canonical: &str, literal: Option<&str>) -> ResolvedNames {
        ResolvedNames {
            canonical: canonical.to_string(),
            literal: literal.map(str::to_string),
        }
    }

    fn add_sidecar(store: &TestStore, layer: &str) -> String {
        let link = store.layout().read_link(layer).unwrap();
        let source = tempdir();
        let tools = tempdir();
        build_sidecar(&store.layout(), source.path(), &link, &fake_compressor(tools.path(), 0))
            .unwrap();
        link
    }

    #[test]
    fn test_not_found() {
        let store = TestStore::new();
        assert_eq!(
            remove_image(&*store, &names("docker.io/library/alpine:latest", None)).unwrap(),
            RemovalOutcome::NotFound
        );
    }

    #[test]
    fn test_removes_image_and_sidecar() {
        let store = TestStore::new();
        let image = store.add_image(
            &["docker.io/library/alpine:latest", "alpine"],
            &[&[("bin/sh", "sh")]],
        );
        let link = add_sidecar(&store, &store.top_layer(&image));

        let outcome =
            remove_image(&*store, &names("docker.io/library/alpine:latest", Some("alpine")))
                .unwrap();
        assert_eq!(
            outcome,
            RemovalOutcome::Removed {
                image_id: image.id.clone(),
                sidecar_removed: true,
            }
        );
        assert!(store.images().unwrap().is_empty());
        assert!(!store.layout().squash_file(&link).exists());
        assert!(fs::symlink_metadata(store.layout().squash_symlink(&link)).is_err());

        // a second removal is a no-op
        assert_eq!(
            remove_image(&*store, &names("docker.io/library/alpine:latest", Some("alpine")))
                .unwrap(),
            RemovalOutcome::NotFound
        );
    }

    #[test]
    fn test_shared_layer_keeps_sidecar() {
        let store = TestStore::new();
        let image = store.add_image(&["example.com/app:1"], &[&[("bin/app", "v1")]]);
        let top = store.top_layer(&image);
        store.add_image_record(&["example.com/app:stable"], &top);
        let link = add_sidecar(&store, &top);

        let outcome = remove_image(&*store, &names("example.com/app:1", None)).unwrap();
        assert_eq!(
            outcome,
            RemovalOutcome::Removed {
                image_id: image.id,
                sidecar_removed: false,
            }
        );
        assert!(store.layout().squash_file(&link).exists());
        assert!(store.find_image("example.com/app:stable").is_ok());
        assert!(store.layout().layer_dir(&top).exists());
    }

    #[test]
    fn test_unreadable_link_still_removes_image() {
        let store = TestStore::new();
        let image = store.add_image(&["example.com/app:1"], &[&[("bin/app", "v1")]]);
        fs::remove_file(store.layout().link_file(&store.top_layer(&image))).unwrap();

        let outcome = remove_image(&*store, &names("example.com/app:1", None)).unwrap();
        assert_eq!(
            outcome,
            RemovalOutcome::Removed {
                image_id: image.id,
                sidecar_removed: false,
            }
        );
        assert!(store.images().unwrap().is_empty());
    }

    #[test]
    fn test_sidecar_failure_is_not_fatal() {
        let store = TestStore::new();
        let image = store.add_image(&["example.com/app:1"], &[&[("bin/app", "v1")]]);
        let link = add_sidecar(&store, &store.top_layer(&image));
        // unlinking a directory fails even for root
        let squash_file = store.layout().squash_file(&link);
        fs::remove_file(&squash_file).unwrap();
        fs::create_dir(&squash_file).unwrap();
        fs::write(squash_file.join("stray"), "").unwrap();

        let outcome = remove_image(&*store, &names("example.com/app:1", None)).unwrap();

        assert_eq!(
            outcome,
            RemovalOutcome::Removed {
                image_id: image.id,
                sidecar_removed: false,
            }
        );
        assert!(squash_file.join("stray").exists());
        assert!(store.images().unwrap().is_empty());
    }
}
