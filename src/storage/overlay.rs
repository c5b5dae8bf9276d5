//! An [`ImageStore`] working directly on the overlay driver's on-disk format.
//!
//! # Storage Structure
//!
//! ```text
//! <root>/
//! +-- overlay/              # Layer data
//! |   +-- <layer-id>/       # Individual layer directories
//! |   |   +-- diff/         # Layer file contents
//! |   |   +-- work/         # Overlay work directory
//! |   |   +-- link          # Short link ID (26 chars)
//! |   +-- l/                # Short link directory (symlinks)
//! +-- overlay-layers/
//! |   +-- layers.json       # Layer index
//! |   +-- layers.lock
//! +-- overlay-images/
//!     +-- images.json       # Image index
//!     +-- images.lock
//!     +-- <image-id>/
//!         +-- manifest      # Big data with a plain key
//!         +-- =<base64-key> # Big data whose key needs encoding
//! ```
//!
//! The index files are rewritten atomically while holding the matching lock
//! file.  Fields this module does not know about are carried through
//! unchanged, so records written by other tools survive a rewrite.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::{
    error::{Result, StoreError},
    layout::StoreLayout,
    lockfile::LockFile,
    mount::merge_layers,
    ImageOptions, ImageRecord, ImageStore, LayerRecord, MANIFEST_KEY,
};
use crate::{
    digest::{sha256_digest, validate_sha256, DigestReader, LayerDigest},
    fs::{remove_if_exists, remove_tree, write_atomic},
};

const LAYERS_DIR: &str = "overlay-layers";
const IMAGES_DIR: &str = "overlay-images";
const LAYERS_INDEX: &str = "layers.json";
const IMAGES_INDEX: &str = "images.json";
const LAYERS_LOCK: &str = "layers.lock";
const IMAGES_LOCK: &str = "images.lock";

/// Length of a short link id.
const LINK_ID_LENGTH: usize = 26;
/// Alphabet of short link ids (RFC 4648 base32).
const LINK_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Accepts `null` wherever an empty collection is expected.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Entry in layers.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LayerEntry {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compressed_diff_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compressed_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff_size: Option<i64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl LayerEntry {
    fn uncompressed(&self) -> Option<LayerDigest> {
        let digest = self.diff_digest.clone()?;
        let size = u64::try_from(self.diff_size?).ok()?;
        Some(LayerDigest { digest, size })
    }
}

/// Entry in images.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ImageEntry {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    names: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    names_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    layer: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    big_data_names: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    big_data_sizes: BTreeMap<String, i64>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    big_data_digests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<DateTime<Utc>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<&ImageEntry> for ImageRecord {
    fn from(entry: &ImageEntry) -> Self {
        ImageRecord {
            id: entry.id.clone(),
            names: entry.names.clone(),
            names_history: entry.names_history.clone(),
            top_layer: entry.layer.clone().filter(|l| !l.is_empty()),
            created: entry.created,
            digest: entry.digest.clone(),
            big_data_names: entry.big_data_names.clone(),
        }
    }
}

/// Maps a big data key to its file name the way containers-storage does:
/// keys made only of `[0-9a-z.]` are used as-is, anything else is base64
/// encoded behind a `=` prefix.
fn big_data_file_name(key: &str) -> String {
    let plain = !key.is_empty()
        && key
            .bytes()
            .all(|b| b == b'.' || b.is_ascii_digit() || b.is_ascii_lowercase());
    if plain {
        key.to_string()
    } else {
        format!("={}", STANDARD.encode(key.as_bytes()))
    }
}

fn random_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

fn random_link_id() -> String {
    let mut rng = rand::rng();
    (0..LINK_ID_LENGTH)
        .map(|_| LINK_ID_ALPHABET[rng.random_range(0..LINK_ID_ALPHABET.len())] as char)
        .collect()
}

/// Appends `extra` to `names`, skipping duplicates.
fn merge_names(names: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(names.len() + extra.len());
    for name in names.iter().chain(extra) {
        if !merged.contains(name) {
            merged.push(name.clone());
        }
    }
    merged
}

/// A containers-storage overlay store rooted at a graph root.
#[derive(Debug)]
pub struct OverlayStore {
    layout: StoreLayout,
    /// Scratch directory for transient state (merged root filesystems).
    run_root: PathBuf,
    /// Lock file for layer operations (overlay-layers/layers.lock).
    layers_lock: Option<LockFile>,
    /// Lock file for image operations (overlay-images/images.lock).
    images_lock: Option<LockFile>,
}

impl OverlayStore {
    /// Opens the store at `root`, creating any missing store directories.
    ///
    /// An empty directory is a valid (empty) store.  The lock files are opened
    /// if possible; a store whose lock files cannot be opened is readable but
    /// every mutation fails.
    pub fn open(root: impl AsRef<Path>, run_root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(StoreError::InvalidStorage(format!(
                "storage root not found at {}",
                root.display()
            )));
        }

        let layout = StoreLayout::new(root);
        for dir in [
            layout.short_link_dir(),
            root.join(LAYERS_DIR),
            root.join(IMAGES_DIR),
        ] {
            fs::create_dir_all(&dir)?;
        }

        let layers_lock = LockFile::open(root.join(LAYERS_DIR).join(LAYERS_LOCK)).ok();
        let images_lock = LockFile::open(root.join(IMAGES_DIR).join(IMAGES_LOCK)).ok();

        debug!("Opened overlay store at {root:?}");
        Ok(Self {
            layout,
            run_root: run_root.as_ref().to_path_buf(),
            layers_lock,
            images_lock,
        })
    }

    /// Directory under which merged root filesystems are materialized.
    pub fn mounts_dir(&self) -> PathBuf {
        self.run_root.join("mounts")
    }

    /// Removes every merged root filesystem still present.
    pub fn unmount_all(&self) -> Result<()> {
        match fs::read_dir(self.mounts_dir()) {
            Ok(entries) => {
                for entry in entries {
                    remove_tree(&entry?.path())?;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn index_path(&self, dir: &str, file: &str) -> PathBuf {
        self.layout.root().join(dir).join(file)
    }

    fn image_dir(&self, image_id: &str) -> PathBuf {
        self.layout.root().join(IMAGES_DIR).join(image_id)
    }

    fn read_index<T: DeserializeOwned>(&self, dir: &str, file: &str) -> Result<Vec<T>> {
        let path = self.index_path(dir, file);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let entries: Option<Vec<T>> = serde_json::from_slice(&contents).map_err(|e| {
            StoreError::InvalidStorage(format!("Invalid {}: {e}", path.display()))
        })?;
        Ok(entries.unwrap_or_default())
    }

    fn write_index<T: Serialize>(&self, dir: &str, file: &str, entries: &[T]) -> Result<()> {
        let data = serde_json::to_vec(entries)?;
        write_atomic(&self.index_path(dir, file), &data)?;
        Ok(())
    }

    fn read_layers(&self) -> Result<Vec<LayerEntry>> {
        self.read_index(LAYERS_DIR, LAYERS_INDEX)
    }

    fn write_layers(&self, layers: &[LayerEntry]) -> Result<()> {
        self.write_index(LAYERS_DIR, LAYERS_INDEX, layers)
    }

    fn read_images(&self) -> Result<Vec<ImageEntry>> {
        self.read_index(IMAGES_DIR, IMAGES_INDEX)
    }

    fn write_images(&self, images: &[ImageEntry]) -> Result<()> {
        self.write_index(IMAGES_DIR, IMAGES_INDEX, images)
    }

    /// Runs `f` while holding a lock file, stamping it afterwards if `f`
    /// succeeded.
    fn locked<T>(lock: Option<&LockFile>, what: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = lock
            .ok_or_else(|| StoreError::InvalidStorage(format!("No {what} lock file")))?;
        let guard = lock.lock()?;
        let result = f()?;
        guard.record_write()?;
        Ok(result)
    }

    fn layer_record(&self, entry: &LayerEntry) -> Result<LayerRecord> {
        let link = self.layout.read_link(&entry.id).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::LayerNotFound(entry.id.clone())
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(LayerRecord {
            id: entry.id.clone(),
            link,
            parent: entry.parent.clone(),
            uncompressed: entry.uncompressed(),
        })
    }

    /// Returns the layer chain of `top`, top first.
    fn layer_chain(layers: &[LayerEntry], top: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = Some(top.to_string());
        while let Some(id) = current {
            if chain.contains(&id) {
                return Err(StoreError::InvalidStorage(format!(
                    "layer {id} is its own ancestor"
                )));
            }
            let entry = layers
                .iter()
                .find(|l| l.id == id)
                .ok_or_else(|| StoreError::LayerNotFound(id.clone()))?;
            current = entry.parent.clone().filter(|p| !p.is_empty());
            chain.push(id);
        }
        Ok(chain)
    }

    /// Unpacks a layer diff into a fresh layer directory and checks it
    /// against the expected digest.
    fn unpack_layer<R: Read>(&self, diff: R, layer_id: &str) -> Result<LayerDigest> {
        let diff_dir = self.layout.layer_dir(layer_id).join("diff");
        let mut archive = tar::Archive::new(DigestReader::new(diff));
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_preserve_ownerships(rustix::process::geteuid().is_root());
        // xattr records are hashed but not applied, NFS-backed stores reject them
        archive.set_unpack_xattrs(false);
        archive.set_overwrite(true);
        archive.unpack(&diff_dir)?;
        // the archive stops at the end-of-archive marker; whatever follows
        // (block padding) is still part of the stream
        Ok(archive.into_inner().drain()?)
    }

    fn discard_layer(&self, layer_id: &str, link: &str) {
        let _ = remove_if_exists(&self.layout.short_link(link));
        let _ = remove_tree(&self.layout.layer_dir(layer_id));
    }
}

impl ImageStore for OverlayStore {
    fn root(&self) -> &Path {
        self.layout.root()
    }

    fn layout(&self) -> StoreLayout {
        self.layout.clone()
    }

    fn images(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.read_images()?.iter().map(ImageRecord::from).collect())
    }

    fn mount_image(&self, image_id: &str) -> Result<PathBuf> {
        let image = self
            .read_images()?
            .into_iter()
            .find(|i| i.id == image_id)
            .ok_or_else(|| StoreError::ImageNotFound(image_id.to_string()))?;
        let top = image.layer.filter(|l| !l.is_empty()).ok_or_else(|| {
            StoreError::InvalidStorage(format!("image {image_id} has no top layer"))
        })?;

        let target = self.mounts_dir().join(image_id);
        if target.exists() {
            return Ok(target);
        }

        let layers = self.read_layers()?;
        let diffs: Vec<PathBuf> = Self::layer_chain(&layers, &top)?
            .iter()
            .rev()
            .map(|id| self.layout.layer_dir(id).join("diff"))
            .collect();

        info!("Mounting image {image_id} ({} layers) at {target:?}", diffs.len());
        if let Err(e) = merge_layers(&diffs, &target) {
            let _ = remove_tree(&target);
            return Err(e.into());
        }
        Ok(target)
    }

    fn unmount_image(&self, image_id: &str) -> Result<()> {
        debug!("Unmounting image {image_id}");
        remove_tree(&self.mounts_dir().join(image_id))?;
        Ok(())
    }

    fn layers_by_digest(&self, digest: &str) -> Result<Vec<LayerRecord>> {
        self.read_layers()?
            .iter()
            .filter(|l| l.diff_digest.as_deref() == Some(digest))
            .map(|l| self.layer_record(l))
            .collect()
    }

    fn put_layer<R: Read>(&self, diff: R, expected: &LayerDigest) -> Result<LayerRecord> {
        validate_sha256(&expected.digest)?;

        Self::locked(self.layers_lock.as_ref(), "layers", || {
            let mut id = random_id();
            while self.layout.layer_dir(&id).exists() {
                id = random_id();
            }
            let mut link = random_link_id();
            while self.layout.short_link(&link).exists() {
                link = random_link_id();
            }

            let layer_dir = self.layout.layer_dir(&id);
            fs::create_dir_all(layer_dir.join("diff"))?;
            fs::create_dir_all(layer_dir.join("work"))?;
            fs::write(self.layout.link_file(&id), &link)?;
            std::os::unix::fs::symlink(
                Path::new("..").join(&id).join("diff"),
                self.layout.short_link(&link),
            )?;

            let actual = match self.unpack_layer(diff, &id) {
                Ok(actual) => actual,
                Err(e) => {
                    self.discard_layer(&id, &link);
                    return Err(e);
                }
            };
            if actual != *expected {
                self.discard_layer(&id, &link);
                return Err(StoreError::DigestMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }

            let size = i64::try_from(actual.size).map_err(|_| {
                StoreError::InvalidStorage(format!("layer size {} out of range", actual.size))
            })?;
            let entry = LayerEntry {
                id: id.clone(),
                parent: None,
                created: Some(Utc::now()),
                compressed_diff_digest: Some(actual.digest.clone()),
                compressed_size: Some(size),
                diff_digest: Some(actual.digest.clone()),
                diff_size: Some(size),
                extra: Map::new(),
            };
            let mut layers = self.read_layers()?;
            layers.push(entry);
            if let Err(e) = self.write_layers(&layers) {
                self.discard_layer(&id, &link);
                return Err(e);
            }

            info!("Created layer {id} (link {link}) from {actual}");
            Ok(LayerRecord {
                id,
                link,
                parent: None,
                uncompressed: Some(actual),
            })
        })
    }

    fn create_image(
        &self,
        layer_id: &str,
        names: &[String],
        options: ImageOptions,
    ) -> Result<ImageRecord> {
        if !self.read_layers()?.iter().any(|l| l.id == layer_id) {
            return Err(StoreError::LayerNotFound(layer_id.to_string()));
        }

        Self::locked(self.images_lock.as_ref(), "images", || {
            let mut images = self.read_images()?;
            let mut id = random_id();
            while images.iter().any(|i| i.id == id) || self.image_dir(&id).exists() {
                id = random_id();
            }

            for other in images.iter_mut() {
                let before = other.names.len();
                other.names.retain(|n| !names.contains(n));
                if other.names.len() != before {
                    info!("Moving names of image {} to the new image", other.id);
                }
            }

            let entry = ImageEntry {
                id: id.clone(),
                digest: options.digest,
                names: merge_names(names, &[]),
                names_history: merge_names(names, &options.names_history),
                layer: Some(layer_id.to_string()),
                big_data_names: Vec::new(),
                big_data_sizes: BTreeMap::new(),
                big_data_digests: BTreeMap::new(),
                created: Some(options.created.unwrap_or_else(Utc::now)),
                extra: Map::new(),
            };
            fs::create_dir_all(self.image_dir(&id))?;
            let record = ImageRecord::from(&entry);
            images.push(entry);
            self.write_images(&images)?;

            info!("Created image {id} with names {names:?}");
            Ok(record)
        })
    }

    fn big_data(&self, image_id: &str, key: &str) -> Result<Vec<u8>> {
        let dir = self.image_dir(image_id);
        if !dir.is_dir() {
            return Err(StoreError::ImageNotFound(image_id.to_string()));
        }
        fs::read(dir.join(big_data_file_name(key))).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::BigDataNotFound {
                    image: image_id.to_string(),
                    key: key.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })
    }

    fn set_big_data(&self, image_id: &str, key: &str, data: &[u8]) -> Result<()> {
        Self::locked(self.images_lock.as_ref(), "images", || {
            let mut images = self.read_images()?;
            let entry = images
                .iter_mut()
                .find(|i| i.id == image_id)
                .ok_or_else(|| StoreError::ImageNotFound(image_id.to_string()))?;

            let dir = self.image_dir(image_id);
            fs::create_dir_all(&dir)?;
            write_atomic(&dir.join(big_data_file_name(key)), data)?;

            let digest = sha256_digest(data);
            if !entry.big_data_names.iter().any(|n| n == key) {
                entry.big_data_names.push(key.to_string());
            }
            entry
                .big_data_sizes
                .insert(key.to_string(), data.len() as i64);
            entry
                .big_data_digests
                .insert(key.to_string(), digest.clone());
            if key == MANIFEST_KEY && entry.digest.is_none() {
                entry.digest = Some(digest);
            }

            self.write_images(&images)
        })
    }

    fn delete_image(&self, image_id: &str) -> Result<()> {
        Self::locked(self.images_lock.as_ref(), "images", || {
            let mut images = self.read_images()?;
            let position = images
                .iter()
                .position(|i| i.id == image_id)
                .ok_or_else(|| StoreError::ImageNotFound(image_id.to_string()))?;
            let removed = images.remove(position);
            self.write_images(&images)?;
            remove_tree(&self.image_dir(image_id))?;
            info!("Deleted image {image_id}");

            let Some(top) = removed.layer.filter(|l| !l.is_empty()) else {
                return Ok(());
            };

            Self::locked(self.layers_lock.as_ref(), "layers", || {
                let mut layers = self.read_layers()?;

                let mut in_use = HashSet::new();
                for image in &images {
                    if let Some(layer) = image.layer.as_deref().filter(|l| !l.is_empty()) {
                        in_use.extend(Self::layer_chain(&layers, layer)?);
                    }
                }

                // parents of a layer still in use are in use too
                for layer_id in Self::layer_chain(&layers, &top)? {
                    if in_use.contains(&layer_id) {
                        break;
                    }
                    if let Ok(link) = self.layout.read_link(&layer_id) {
                        remove_if_exists(&self.layout.short_link(&link))?;
                    }
                    remove_tree(&self.layout.layer_dir(&layer_id))?;
                    layers.retain(|l| l.id != layer_id);
                    info!("Deleted layer {layer_id}");
                }

                self.write_layers(&layers)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, os::unix::fs::MetadataExt};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{layer_tar, TestStore};

    #[test]
    fn test_big_data_file_names() {
        assert_eq!(big_data_file_name("manifest"), "manifest");
        assert_eq!(
            big_data_file_name("sha256:abc"),
            format!("={}", STANDARD.encode("sha256:abc"))
        );
        assert_eq!(
            big_data_file_name("manifest-sha256:abc"),
            format!("={}", STANDARD.encode("manifest-sha256:abc"))
        );
    }

    #[test]
    fn test_link_ids() {
        let link = random_link_id();
        assert_eq!(link.len(), LINK_ID_LENGTH);
        assert!(link.bytes().all(|b| LINK_ID_ALPHABET.contains(&b)));
        assert_eq!(random_id().len(), 64);
    }

    #[test]
    fn test_open_creates_layout() {
        let store = TestStore::new();
        for dir in ["overlay/l", "overlay-layers", "overlay-images"] {
            assert!(store.root().join(dir).is_dir(), "{dir}");
        }
        assert!(store.images().unwrap().is_empty());
    }

    #[test]
    fn test_open_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let err = OverlayStore::open(tmp.path().join("nope"), tmp.path()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidStorage(_)));
    }

    #[test]
    fn test_put_layer() {
        let store = TestStore::new();
        let (tar, digest) = layer_tar(&[("etc/os-release", "ID=test\n")]);

        let layer = store.put_layer(Cursor::new(&tar), &digest).unwrap();
        assert_eq!(layer.uncompressed.as_ref(), Some(&digest));
        assert_eq!(store.layout().read_link(&layer.id).unwrap(), layer.link);
        assert_eq!(
            fs::read_link(store.layout().short_link(&layer.link)).unwrap(),
            Path::new("..").join(&layer.id).join("diff")
        );
        assert_eq!(
            fs::read_to_string(store.layout().layer_dir(&layer.id).join("diff/etc/os-release"))
                .unwrap(),
            "ID=test\n"
        );

        let found = store.layers_by_digest(&digest.digest).unwrap();
        assert_eq!(found, vec![layer]);
    }

    #[test]
    fn test_put_layer_ownership() {
        let store = TestStore::new();
        let (tar, digest) = layer_tar(&[("etc/shadow", "root:*:19000::::::\n")]);
        for entry in tar::Archive::new(Cursor::new(&tar)).entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 0);
            assert_eq!(entry.header().gid().unwrap(), 0);
        }

        let layer = store.put_layer(Cursor::new(&tar), &digest).unwrap();
        let shadow = store.layout().layer_dir(&layer.id).join("diff/etc/shadow");
        let euid = rustix::process::geteuid();
        // ownership is only restored when running as root
        let expected = if euid.is_root() { 0 } else { euid.as_raw() };
        assert_eq!(fs::metadata(shadow).unwrap().uid(), expected);
    }

    #[test]
    fn test_put_layer_rejects_mismatch() {
        let store = TestStore::new();
        let (tar, digest) = layer_tar(&[("file", "content")]);
        let wrong = LayerDigest {
            digest: digest.digest.clone(),
            size: digest.size + 512,
        };

        let err = store.put_layer(Cursor::new(&tar), &wrong).unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }), "{err}");

        // nothing is left behind
        assert!(store.layers_by_digest(&digest.digest).unwrap().is_empty());
        assert_eq!(fs::read_dir(store.layout().short_link_dir()).unwrap().count(), 0);
        let leftover: Vec<_> = fs::read_dir(store.layout().overlay_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftover, vec![std::ffi::OsString::from("l")]);
    }

    #[test]
    fn test_create_image_moves_names() {
        let store = TestStore::new();
        let first = store.add_image(
            &["docker.io/library/alpine:latest", "alpine"],
            &[&[("a", "1")]],
        );
        let layer = store.top_layer(&first);

        let second = store
            .create_image(
                &layer,
                &["docker.io/library/alpine:latest".to_string()],
                ImageOptions {
                    names_history: vec!["old:name".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(
            second.names_history,
            vec!["docker.io/library/alpine:latest", "old:name"]
        );
        let first = store.find_image(&first.id).unwrap();
        assert_eq!(first.names, vec!["alpine"]);
        assert_eq!(
            store.find_image("docker.io/library/alpine:latest").unwrap().id,
            second.id
        );
    }

    #[test]
    fn test_big_data() {
        let store = TestStore::new();
        let image = store.add_image(&["example.com/app:1"], &[&[("a", "1")]]);

        store.set_big_data(&image.id, "manifest", b"{}").unwrap();
        store.set_big_data(&image.id, "sha256:1234", b"config").unwrap();
        store.set_big_data(&image.id, "sha256:1234", b"config2").unwrap();

        assert_eq!(store.big_data(&image.id, "manifest").unwrap(), b"{}");
        assert_eq!(store.big_data(&image.id, "sha256:1234").unwrap(), b"config2");
        assert!(matches!(
            store.big_data(&image.id, "nope").unwrap_err(),
            StoreError::BigDataNotFound { .. }
        ));
        assert!(matches!(
            store.big_data("missing", "manifest").unwrap_err(),
            StoreError::ImageNotFound(_)
        ));

        let record = store.find_image(&image.id).unwrap();
        assert_eq!(record.big_data_names, vec!["manifest", "sha256:1234"]);
        assert_eq!(record.digest, Some(sha256_digest(b"{}")));
    }

    #[test]
    fn test_delete_image_keeps_shared_layers() {
        let store = TestStore::new();
        let base = store.add_image(&["example.com/base:1"], &[&[("base", "1")]]);
        let base_layer = store.top_layer(&base);
        let child = store.add_image_on(&["example.com/child:1"], &base_layer, &[("child", "2")]);
        let child_layer = store.top_layer(&child);
        let child_link = store.layout().read_link(&child_layer).unwrap();

        store.delete_image(&child.id).unwrap();

        assert!(matches!(
            store.find_image("example.com/child:1").unwrap_err(),
            StoreError::ImageNotFound(_)
        ));
        assert!(!store.layout().layer_dir(&child_layer).exists());
        assert!(!store.layout().short_link(&child_link).exists());
        assert!(store.layout().layer_dir(&base_layer).exists());

        store.delete_image(&base.id).unwrap();
        assert!(!store.layout().layer_dir(&base_layer).exists());
        assert!(store.images().unwrap().is_empty());
        assert!(matches!(
            store.delete_image(&base.id).unwrap_err(),
            StoreError::ImageNotFound(_)
        ));
    }

    #[test]
    fn test_mount_merges_chain() {
        let store = TestStore::new();
        let image = store.add_image(
            &["example.com/app:1"],
            &[&[("etc/a", "base"), ("etc/b", "base")], &[("etc/a", "top"), ("etc/.wh.b", "")]],
        );

        let root = store.mount_image(&image.id).unwrap();
        assert_eq!(fs::read_to_string(root.join("etc/a")).unwrap(), "top");
        assert!(!root.join("etc/b").exists());
        // mounting twice hands out the same tree
        assert_eq!(store.mount_image(&image.id).unwrap(), root);

        store.unmount_image(&image.id).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_preserves_unknown_fields() {
        let store = TestStore::new();
        let image = store.add_image(&["example.com/app:1"], &[&[("a", "1")]]);
        let index = store.root().join("overlay-images/images.json");
        let mut json: Vec<Value> = serde_json::from_slice(&fs::read(&index).unwrap()).unwrap();
        json[0]["flags"] = serde_json::json!({"some-flag": true});
        fs::write(&index, serde_json::to_vec(&json).unwrap()).unwrap();

        store.set_big_data(&image.id, "extra", b"data").unwrap();

        let json: Vec<Value> = serde_json::from_slice(&fs::read(&index).unwrap()).unwrap();
        assert_eq!(json[0]["flags"]["some-flag"], Value::Bool(true));
    }
}
