//! Stores laid out the way podman leaves them, and a stand-in compressor.

#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use parallax::{
    storage::{ImageStore, OverlayStore, MANIFEST_KEY},
    Config, ConfigOverrides, Operation, RegistriesConf,
};

pub fn tempdir() -> TempDir {
    TempDir::with_prefix("parallax-it-").unwrap()
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn append_index(path: &Path, entry: Value) {
    let mut entries: Vec<Value> = match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap(),
        Err(_) => vec![],
    };
    entries.push(entry);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_vec_pretty(&entries).unwrap()).unwrap();
}

/// A local store populated by hand.
pub struct PodmanStore {
    pub root: TempDir,
    next_id: std::cell::Cell<u8>,
}

impl PodmanStore {
    pub fn new() -> Self {
        Self {
            root: tempdir(),
            next_id: std::cell::Cell::new(1),
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    fn id(&self) -> String {
        let n = self.next_id.get();
        self.next_id.set(n + 1);
        format!("{n:02x}").repeat(32)
    }

    fn add_layer(&self, parent: Option<&str>, files: &[(&str, &str)]) -> String {
        let id = self.id();
        let link = format!("LINK{}", id[..22].to_uppercase());
        let overlay = self.path().join("overlay");
        let diff = overlay.join(&id).join("diff");
        for (path, contents) in files {
            let path = diff.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        fs::create_dir_all(overlay.join(&id).join("work")).unwrap();
        fs::write(overlay.join(&id).join("link"), &link).unwrap();
        fs::create_dir_all(overlay.join("l")).unwrap();
        symlink(format!("../{id}/diff"), overlay.join("l").join(&link)).unwrap();

        append_index(
            &self.path().join("overlay-layers/layers.json"),
            json!({
                "id": id,
                "parent": parent,
                "created": "2024-05-01T10:00:00Z",
                "compression": 2,
            }),
        );
        id
    }

    /// Adds an image whose layers (base first) hold `layers`, together with
    /// its manifest and config.  Returns the image id.
    pub fn add_image(&self, names: &[&str], layers: &[&[(&str, &str)]]) -> String {
        let mut top: Option<String> = None;
        for files in layers {
            top = Some(self.add_layer(top.as_deref(), files));
        }

        let id = self.id();
        fs::create_dir_all(self.path().join("overlay-images").join(&id)).unwrap();
        append_index(
            &self.path().join("overlay-images/images.json"),
            json!({
                "id": id,
                "names": names,
                "layer": top,
                "created": "2024-05-01T10:00:00Z",
                "metadata": "{}",
            }),
        );

        let diff_ids: Vec<String> = (0..layers.len())
            .map(|i| sha256(format!("layer {i}").as_bytes()))
            .collect();
        let history: Vec<Value> = diff_ids
            .iter()
            .map(|d| json!({"created": "2024-05-01T10:00:00Z", "created_by": format!("ADD {d}")}))
            .collect();
        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Cmd": ["/bin/sh"]},
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
            "history": history,
        }))
        .unwrap();
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": sha256(&config),
                "size": config.len(),
            },
            "layers": diff_ids.iter().map(|d| json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": d,
                "size": 512,
            })).collect::<Vec<_>>(),
        }))
        .unwrap();

        let run = tempdir();
        let store = OverlayStore::open(self.path(), run.path()).unwrap();
        store.set_big_data(&id, MANIFEST_KEY, &manifest).unwrap();
        store.set_big_data(&id, &sha256(&config), &config).unwrap();
        id
    }
}

/// A stand-in for mksquashfs that records each invocation in `runs`.
pub struct FakeCompressor {
    pub dir: TempDir,
}

impl FakeCompressor {
    pub fn new() -> Self {
        let dir = tempdir();
        let script = format!(
            "#!/bin/sh\necho \"$1\" >> {runs}\nprintf '%s\\n' \"$@\" > \"$2\"\n",
            runs = dir.path().join("runs").display()
        );
        let path = dir.path().join("mksquashfs");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("mksquashfs")
    }

    pub fn runs(&self) -> usize {
        fs::read_to_string(self.dir.path().join("runs"))
            .map(|runs| runs.lines().count())
            .unwrap_or(0)
    }
}

/// Resolves short names against Docker Hub only.
pub fn docker_hub() -> RegistriesConf {
    RegistriesConf::parse("unqualified-search-registries = [\"docker.io\"]").unwrap()
}

pub fn config(
    operation: Operation,
    image: &str,
    podman: &Path,
    ro: &Path,
    compressor: &FakeCompressor,
    mirror: bool,
) -> Config {
    let overrides = ConfigOverrides {
        podman_root: Some(podman.to_path_buf()),
        ro_storage_path: Some(ro.to_path_buf()),
        mksquashfs_path: Some(compressor.path()),
        mirror: Some(mirror),
        ..Default::default()
    };
    let config = Config::resolve(operation, image, overrides, None).unwrap();
    config.validate().unwrap();
    config
}
