//! Migrating an image from the local store into the read-only store.
//!
//! The steps run in a fixed order: detect an earlier migration, mount the
//! source image, flatten it into a single layer, ingest that layer into the
//! destination, build the squashfs sidecar from the mount, rewrite the
//! manifest and config, register the image and attach its blobs.
//!
//! Every step can be repeated.  An existing layer with the same digest, an
//! existing sidecar file and an existing image on that layer are all reused,
//! so a run interrupted halfway is completed by running it again.

use std::{
    io::BufReader,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    config::Config,
    detect::{check_migrated, MigrationState},
    digest::LayerDigest,
    error::{Error, Result},
    flatten::flatten,
    manifest::{parse_manifest, rewrite, RewrittenImage},
    mirror::with_store_root,
    reference::{resolve_names, ResolvedNames, ShortNameResolver},
    squash::{build_sidecar, Compressor},
    storage::{
        find_by_names, ImageOptions, ImageRecord, ImageStore, LayerRecord, StoreError,
        StoreSession, MANIFEST_KEY,
    },
    tempdir::ScratchDir,
};

/// What [`migrate_image`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The destination already had the image and its sidecar.
    AlreadyMigrated { image_id: String },
    Migrated {
        /// The image in the destination store.
        image_id: String,
        /// Its single layer.
        layer_id: String,
        /// Overlay alias of that layer, which names the sidecar.
        link: String,
        /// Whether the compressor ran.
        sidecar_built: bool,
    },
}

/// The merged root filesystem of a source image, released on drop.
struct MountGuard<'a, S: ImageStore> {
    store: &'a S,
    image_id: &'a str,
    path: PathBuf,
}

impl<'a, S: ImageStore> MountGuard<'a, S> {
    fn new(store: &'a S, image_id: &'a str) -> Result<Self> {
        let path = store.mount_image(image_id)?;
        debug!("Mounted image {image_id} at {path:?}");
        Ok(Self {
            store,
            image_id,
            path,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl<S: ImageStore> Drop for MountGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unmount_image(self.image_id) {
            warn!("Failed to unmount image {}: {e}", self.image_id);
        }
    }
}

/// One migration of one image.  Log lines are prefixed with the image name.
struct Migration<'a, S, D> {
    src: &'a S,
    dst: &'a D,
    names: &'a ResolvedNames,
    compressor: &'a Compressor,
    workdir: &'a Path,
}

impl<S: ImageStore, D: ImageStore> Migration<'_, S, D> {
    fn run(&self) -> Result<MigrationOutcome> {
        let names = self.names.names();
        if let MigrationState::Migrated { image_id, link } = check_migrated(self.dst, &names)? {
            info!(
                "{}: already migrated as image {image_id} (sidecar {link})",
                self.names
            );
            return Ok(MigrationOutcome::AlreadyMigrated { image_id });
        }

        let source = match find_by_names(self.src, &names) {
            Ok(image) => image,
            Err(StoreError::ImageNotFound(_)) => {
                return Err(Error::NotFound(format!(
                    "{} in {:?}",
                    self.names,
                    self.src.root()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if source.top_layer.is_none() {
            return Err(Error::Integrity(format!(
                "image {} has no top layer",
                source.id
            )));
        }
        info!("{}: migrating source image {}", self.names, source.id);

        let mount = MountGuard::new(self.src, &source.id)?;
        let (spool, digest) = flatten(mount.path(), self.workdir)?;
        info!("{}: flattened to {digest}", self.names);

        let (layer, created) = self.ingest(spool, &digest)?;
        match self.finish(&source, &mount, &layer, &digest) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if created {
                    warn!(
                        "{}: layer {} is left in {:?} without an image",
                        self.names,
                        layer.id,
                        self.dst.root()
                    );
                }
                Err(e)
            }
        }
    }

    /// Finds a destination layer holding exactly `digest`, or creates one
    /// from `spool`.  Returns the layer and whether it was created.
    fn ingest(&self, spool: std::fs::File, digest: &LayerDigest) -> Result<(LayerRecord, bool)> {
        let existing = self
            .dst
            .layers_by_digest(&digest.digest)?
            .into_iter()
            .find(|layer| layer.uncompressed.as_ref() == Some(digest));
        if let Some(layer) = existing {
            info!("{}: reusing layer {} for {digest}", self.names, layer.id);
            return Ok((layer, false));
        }

        let layer = self.dst.put_layer(BufReader::new(spool), digest)?;
        info!("{}: ingested layer {}", self.names, layer.id);
        Ok((layer, true))
    }

    fn finish(
        &self,
        source: &ImageRecord,
        mount: &MountGuard<'_, S>,
        layer: &LayerRecord,
        digest: &LayerDigest,
    ) -> Result<MigrationOutcome> {
        let layout = self.dst.layout();
        let link = layout
            .read_link(&layer.id)
            .map_err(|e| Error::io(format!("reading link of layer {}", layer.id), e))?;
        debug!("{}: layer {} has link {link}", self.names, layer.id);

        let sidecar = build_sidecar(&layout, mount.path(), &link, self.compressor)?;

        let source_manifest = self.src.big_data(&source.id, MANIFEST_KEY)?;
        let source_manifest = parse_manifest(&source_manifest)?;
        let config_key = source_manifest.config().digest().to_string();
        let source_config = self.src.big_data(&source.id, &config_key)?;
        let rewritten = rewrite(
            &source_manifest,
            &source_config,
            digest,
            &source.id,
            source.created,
        )?;

        let image = self.register(source, layer, &rewritten)?;
        self.dst
            .set_big_data(&image.id, MANIFEST_KEY, &rewritten.manifest)?;
        self.dst
            .set_big_data(&image.id, &rewritten.config_digest, &rewritten.config)?;
        self.copy_blobs(source, &image.id, &config_key);

        info!(
            "{}: migrated to image {} (layer {}, sidecar {:?})",
            self.names, image.id, layer.id, sidecar.path
        );
        Ok(MigrationOutcome::Migrated {
            image_id: image.id,
            layer_id: layer.id.clone(),
            link,
            sidecar_built: sidecar.built,
        })
    }

    /// Returns the destination image that already carries one of the names on
    /// `layer`, or creates it.
    fn register(
        &self,
        source: &ImageRecord,
        layer: &LayerRecord,
        rewritten: &RewrittenImage,
    ) -> Result<ImageRecord> {
        let names = self.names.names();
        match find_by_names(self.dst, &names) {
            Ok(image) if image.top_layer.as_deref() == Some(layer.id.as_str()) => {
                info!("{}: reusing image {}", self.names, image.id);
                return Ok(image);
            }
            Ok(image) => debug!(
                "{}: image {} holds the name on another layer, replacing it",
                self.names, image.id
            ),
            Err(StoreError::ImageNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let options = ImageOptions {
            digest: Some(rewritten.manifest_digest.clone()),
            created: source.created,
            names_history: source.names.clone(),
        };
        Ok(self.dst.create_image(&layer.id, &names, options)?)
    }

    /// Copies the blobs that are not replaced by the rewrite.  Failures only
    /// warn.
    fn copy_blobs(&self, source: &ImageRecord, image_id: &str, config_key: &str) {
        for key in &source.big_data_names {
            if key.starts_with(MANIFEST_KEY) || key == config_key {
                continue;
            }
            let copied = self
                .src
                .big_data(&source.id, key)
                .and_then(|data| self.dst.set_big_data(image_id, key, &data));
            match copied {
                Ok(()) => debug!("{}: copied blob {key}", self.names),
                Err(e) => warn!("{}: failed to copy blob {key}: {e}", self.names),
            }
        }
    }
}

/// Migrates the image named by `names` from `src` into `dst`.
///
/// `workdir` receives the spooled layer archive.
pub fn migrate_image<S: ImageStore, D: ImageStore>(
    src: &S,
    dst: &D,
    names: &ResolvedNames,
    compressor: &Compressor,
    workdir: &Path,
) -> Result<MigrationOutcome> {
    Migration {
        src,
        dst,
        names,
        compressor,
        workdir,
    }
    .run()
}

/// Resolves the configured image and migrates it into the read-only store.
pub fn run_migration<R: ShortNameResolver + ?Sized>(
    config: &Config,
    resolver: &R,
) -> Result<MigrationOutcome> {
    let names = resolve_names(&config.image, resolver)?;
    info!("Starting migration of {names}");
    let compressor = config.compressor();

    let rsync = config.mirror.then_some(config.rsync_path.as_path());
    with_store_root(&config.ro_storage_path, rsync, |ro_root| {
        let src = StoreSession::open(&config.podman_root, "parallax-src-")?;
        let dst = StoreSession::open(ro_root, "parallax-dst-")?;
        let workdir = ScratchDir::new("parallax-work-")
            .map_err(|e| Error::io("creating work directory", e))?;
        migrate_image(src.store(), dst.store(), &names, &compressor, workdir.path())
    })
}
