//! A writable local mirror of a store that lives on a filesystem with
//! unreliable locking or rename semantics.
//!
//! Only the store metadata is copied (`overlay/`, `overlay-containers/`,
//! `overlay-images/`, `overlay-layers/` and the top level lock files).  The
//! `squash/` directory is symlinked into the mirror instead, so sidecars are
//! written straight to their final place.  Teardown removes that symlink,
//! syncs the mirror back with deletions propagated, and deletes the mirror.

use std::{
    ffi::OsString,
    fs,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info, warn};

use crate::{
    error::{Error, Result},
    fs::remove_if_exists,
    tempdir::ScratchDir,
};

/// Top level entries of a store that are mirrored.
const MIRRORED: &[&str] = &[
    "/overlay/***",
    "/overlay-containers/***",
    "/overlay-images/***",
    "/overlay-layers/***",
    "/storage.lock",
    "/userns.lock",
];

const SQUASH_DIR: &str = "squash";

/// `path` with a trailing slash, which makes rsync copy the directory's
/// contents rather than the directory itself.
fn dir_arg(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_os_string();
    arg.push("/");
    arg
}

/// Syncs the mirrored entries of the store at `from` into `to`, deleting
/// whatever `from` no longer has.
fn run_rsync(rsync: &Path, from: &Path, to: &Path) -> Result<()> {
    let mut command = Command::new(rsync);
    command.arg("-a");
    for pattern in MIRRORED {
        command.arg(format!("--include={pattern}"));
    }
    command
        .arg("--exclude=*")
        .arg("--delete")
        .arg(dir_arg(from))
        .arg(dir_arg(to));

    debug!("Running {command:?}");
    let result = command
        .output()
        .map_err(|e| Error::io(format!("running {rsync:?}"), e))?;
    if !result.status.success() {
        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        return Err(Error::ExternalTool {
            tool: rsync.display().to_string(),
            status: result.status,
            output,
        });
    }
    Ok(())
}

/// A local copy of a store, synced back on [`teardown`](Self::teardown).
#[derive(Debug)]
pub struct Mirror {
    source: PathBuf,
    rsync: PathBuf,
    dir: Option<ScratchDir>,
}

impl Mirror {
    /// Copies the store at `source` into a new scratch directory.
    pub fn create(source: &Path, rsync: &Path) -> Result<Self> {
        let source = fs::canonicalize(source)
            .map_err(|e| Error::io(format!("resolving {source:?}"), e))?;
        let dir = ScratchDir::new("parallax-mirror-")
            .map_err(|e| Error::io("creating mirror directory", e))?;
        info!("Mirroring {source:?} to {:?}", dir.path());
        run_rsync(rsync, &source, dir.path())?;

        let real_squash = source.join(SQUASH_DIR);
        fs::create_dir_all(&real_squash)
            .map_err(|e| Error::io(format!("creating {real_squash:?}"), e))?;
        let link = dir.path().join(SQUASH_DIR);
        symlink(&real_squash, &link)
            .map_err(|e| Error::io(format!("linking {link:?} to {real_squash:?}"), e))?;
        debug!("Linked {link:?} to {real_squash:?}");

        Ok(Self {
            source,
            rsync: rsync.to_path_buf(),
            dir: Some(dir),
        })
    }

    /// Root of the mirrored store.
    pub fn path(&self) -> &Path {
        // only None once torn down, which consumes self
        self.dir.as_ref().map_or(&self.source, |dir| dir.path())
    }

    fn teardown_inner(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        let link = dir.path().join(SQUASH_DIR);
        remove_if_exists(&link).map_err(|e| Error::io(format!("removing {link:?}"), e))?;

        info!("Syncing {:?} back to {:?}", dir.path(), self.source);
        run_rsync(&self.rsync, dir.path(), &self.source)?;
        drop(dir);
        Ok(())
    }

    /// Syncs the mirror back into the source store and deletes it.
    pub fn teardown(mut self) -> Result<()> {
        self.teardown_inner()
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        if self.dir.is_some() {
            if let Err(e) = self.teardown_inner() {
                warn!("Failed to sync mirror back to {:?}: {e}", self.source);
            }
        }
    }
}

/// Runs `f` on the store at `root`, through a [`Mirror`] if `rsync` is given.
///
/// The mirror is synced back whether `f` succeeds or not; the error of `f`
/// wins over a failing sync.
pub fn with_store_root<T>(
    root: &Path,
    rsync: Option<&Path>,
    f: impl FnOnce(&Path) -> Result<T>,
) -> Result<T> {
    let Some(rsync) = rsync else {
        return f(root);
    };

    let mirror = Mirror::create(root, rsync)?;
    let result = f(mirror.path());
    match (result, mirror.teardown()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(sync)) => {
            warn!("Failed to sync mirror back to {root:?}: {sync}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{tempdir, write_files};

    fn store(root: &Path) {
        write_files(
            root,
            &[
                ("overlay/abc/diff/etc/hosts", "hosts"),
                ("overlay/abc/link", "LINK"),
                ("overlay-images/images.json", "[]"),
                ("overlay-layers/layers.json", "[]"),
                ("storage.lock", ""),
                ("squash/LINK.squash", "hsqs"),
                ("unrelated/file", "x"),
            ],
        );
    }

    #[test_with::executable(rsync)]
    #[test]
    fn test_mirror_contents() {
        let root = tempdir();
        store(root.path());

        let mirror = Mirror::create(root.path(), Path::new("rsync")).unwrap();
        let path = mirror.path().to_path_buf();
        assert!(path.join("overlay/abc/diff/etc/hosts").is_file());
        assert!(path.join("overlay-images/images.json").is_file());
        assert!(path.join("storage.lock").is_file());
        assert!(!path.join("unrelated").exists());
        assert_eq!(
            fs::read_link(path.join("squash")).unwrap(),
            fs::canonicalize(root.path()).unwrap().join("squash")
        );
        assert!(path.join("squash/LINK.squash").is_file());

        mirror.teardown().unwrap();
        if !crate::tempdir::keep_tmp() {
            assert!(!path.exists());
        }
        // the sidecar directory is untouched by the sync back
        assert!(root.path().join("squash/LINK.squash").is_file());
        assert!(root.path().join("unrelated/file").is_file());
    }

    #[test_with::executable(rsync)]
    #[test]
    fn test_round_trip() {
        let root = tempdir();
        store(root.path());

        let sidecars = with_store_root(root.path(), Some(Path::new("rsync")), |mirror| {
            fs::write(mirror.join("overlay-images/images.json"), "[{}]").unwrap();
            fs::remove_dir_all(mirror.join("overlay/abc")).unwrap();
            fs::create_dir_all(mirror.join("overlay/def/diff")).unwrap();
            fs::write(mirror.join("squash/NEW.squash"), "hsqs").unwrap();
            Ok(fs::read_dir(mirror.join("squash")).unwrap().count())
        })
        .unwrap();
        assert_eq!(sidecars, 2);

        assert_eq!(
            fs::read_to_string(root.path().join("overlay-images/images.json")).unwrap(),
            "[{}]"
        );
        assert!(!root.path().join("overlay/abc").exists());
        assert!(root.path().join("overlay/def/diff").is_dir());
        assert!(root.path().join("squash/NEW.squash").is_file());
        assert!(root.path().join("squash").is_dir());
    }

    #[test_with::executable(rsync)]
    #[test]
    fn test_synced_back_on_failure() {
        let root = tempdir();
        store(root.path());

        let err = with_store_root(root.path(), Some(Path::new("rsync")), |mirror| {
            fs::write(mirror.join("overlay-layers/layers.json"), "[{}]").unwrap();
            Err::<(), _>(Error::NotFound("alpine".to_string()))
        })
        .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            fs::read_to_string(root.path().join("overlay-layers/layers.json")).unwrap(),
            "[{}]"
        );
    }

    #[test]
    fn test_rsync_failure() {
        let root = tempdir();
        store(root.path());
        let err = Mirror::create(root.path(), Path::new("false")).unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }), "{err}");
    }

    #[test]
    fn test_without_mirror() {
        let root = tempdir();
        let seen = with_store_root(root.path(), None, |path| Ok(path.to_path_buf())).unwrap();
        assert_eq!(seen, root.path());
    }
}
