//! Materializing the merged root filesystem of a layer chain.
//!
//! Instead of an overlayfs mount (which needs privileges the tool usually
//! does not have), the store copies the layer diffs, base first, into one
//! directory.  Overlay whiteouts are honored while copying:
//! - `.wh.<filename>` - Whiteout file (removes `<filename>` from lower layers)
//! - `.wh..wh..opq` - Opaque directory marker (hides lower layer contents)
//! - character device 0/0 - Whiteout as written by the kernel overlay driver
//! - `trusted.overlay.opaque=y` (`user.overlay.opaque` when rootless) -
//!   Opaque directory as written by the kernel overlay driver
//!
//! Modes, ownership (when running as root) and timestamps are carried over so
//! that serializing the result is reproducible across runs.

use std::{
    collections::BTreeMap,
    fs,
    io::{ErrorKind, Result},
    mem::MaybeUninit,
    os::unix::fs::{lchown, symlink, FileTypeExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::{
    fs::{lgetxattr, lsetxattr, utimensat, AtFlags, Timespec, Timestamps, XattrFlags, CWD},
    io::Errno,
};

use crate::fs::{copy_special, layer_xattrs, remove_tree};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";
const OPAQUE_XATTRS: [&str; 2] = ["trusted.overlay.opaque", "user.overlay.opaque"];

/// Whiteouts created by overlayfs itself are character devices with rdev 0.
fn is_whiteout_device(meta: &fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

fn is_opaque_dir(dir: &Path) -> Result<bool> {
    for name in OPAQUE_XATTRS {
        let mut buf = [MaybeUninit::new(0u8); 8];
        match lgetxattr(dir, name, &mut buf) {
            Ok((value, _)) if value == b"y" => return Ok(true),
            Ok(_) => {}
            // absent, unreadable by us, or not supported by the filesystem
            Err(Errno::NODATA | Errno::NOTSUP | Errno::RANGE | Errno::PERM | Errno::ACCESS) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

/// Mode and timestamps of a directory, applied once all of its content is in place.
#[derive(Debug, Clone, Copy)]
struct DirAttrs {
    mode: u32,
    atime: (i64, i64),
    mtime: (i64, i64),
}

impl DirAttrs {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            mode: meta.mode() & 0o7777,
            atime: (meta.atime(), meta.atime_nsec()),
            mtime: (meta.mtime(), meta.mtime_nsec()),
        }
    }
}

struct Merger {
    preserve_owner: bool,
    dirs: BTreeMap<PathBuf, DirAttrs>,
}

/// Copies `diffs` (ordered base to top) into `dest`, which must not exist yet.
pub(super) fn merge_layers(diffs: &[PathBuf], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut merger = Merger {
        preserve_owner: rustix::process::geteuid().is_root(),
        dirs: BTreeMap::new(),
    };

    for diff in diffs {
        debug!("Merging layer diff {diff:?} into {dest:?}");
        let meta = fs::symlink_metadata(diff)?;
        merger.dirs.insert(dest.to_path_buf(), DirAttrs::of(&meta));
        merger.copy_owner(&meta, dest)?;
        merger.apply(diff, dest)?;
    }

    // children sort after their parents, so walking backwards fixes up the
    // deepest directories first and parents' timestamps stick
    for (dir, attrs) in merger.dirs.iter().rev() {
        fs::set_permissions(dir, fs::Permissions::from_mode(attrs.mode))?;
        set_times(dir, attrs.atime, attrs.mtime)?;
    }
    Ok(())
}

impl Merger {
    fn apply(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let mut names: Vec<_> = fs::read_dir(src)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<Result<_>>()?;
        names.sort();

        if names.iter().any(|n| n == OPAQUE_MARKER) || is_opaque_dir(src)? {
            debug!("Opaque directory {src:?}, hiding lower content of {dst:?}");
            for entry in fs::read_dir(dst)? {
                remove_tree(&entry?.path())?;
            }
        }

        for name in names {
            let name_str = name.to_string_lossy();
            if name_str == OPAQUE_MARKER {
                continue;
            }
            if let Some(hidden) = name_str.strip_prefix(WHITEOUT_PREFIX) {
                remove_tree(&dst.join(hidden))?;
                continue;
            }

            let from = src.join(&name);
            let to = dst.join(&name);
            let meta = fs::symlink_metadata(&from)?;
            let ft = meta.file_type();

            if is_whiteout_device(&meta) {
                remove_tree(&to)?;
                continue;
            }

            if ft.is_dir() {
                match fs::symlink_metadata(&to) {
                    Ok(existing) if existing.is_dir() => {}
                    Ok(_) => {
                        remove_tree(&to)?;
                        fs::create_dir(&to)?;
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => fs::create_dir(&to)?,
                    Err(e) => return Err(e),
                }
                // keep it writable until the final fixup pass
                fs::set_permissions(&to, fs::Permissions::from_mode(0o700))?;
                self.dirs.insert(to.clone(), DirAttrs::of(&meta));
                self.copy_owner(&meta, &to)?;
                copy_xattrs(&from, &to)?;
                self.apply(&from, &to)?;
                continue;
            }

            remove_tree(&to)?;
            if ft.is_file() {
                fs::copy(&from, &to)?;
            } else if ft.is_symlink() {
                symlink(fs::read_link(&from)?, &to)?;
            } else if let Err(e) = copy_special(&meta, &to) {
                warn!("Skipping special file {from:?}: {e}");
                continue;
            }
            // after chown, which drops file capabilities
            self.copy_owner(&meta, &to)?;
            copy_xattrs(&from, &to)?;
            set_times(
                &to,
                (meta.atime(), meta.atime_nsec()),
                (meta.mtime(), meta.mtime_nsec()),
            )?;
        }
        Ok(())
    }

    fn copy_owner(&self, meta: &fs::Metadata, path: &Path) -> Result<()> {
        if self.preserve_owner {
            lchown(path, Some(meta.uid()), Some(meta.gid()))?;
        }
        Ok(())
    }
}

/// Unprivileged runs can't set `security.*` attributes; those are left out.
fn copy_xattrs(from: &Path, to: &Path) -> Result<()> {
    for (name, value) in layer_xattrs(from)? {
        if let Err(e) = lsetxattr(to, name.as_str(), &value, XattrFlags::empty()) {
            debug!("Not copying xattr {name} to {to:?}: {e}");
        }
    }
    Ok(())
}

fn set_times(path: &Path, atime: (i64, i64), mtime: (i64, i64)) -> Result<()> {
    let times = Timestamps {
        last_access: Timespec {
            tv_sec: atime.0 as _,
            tv_nsec: atime.1 as _,
        },
        last_modification: Timespec {
            tv_sec: mtime.0 as _,
            tv_nsec: mtime.1 as _,
        },
    };
    utimensat(CWD, path, &times, AtFlags::SYMLINK_NOFOLLOW)?;
    Ok(())
}
