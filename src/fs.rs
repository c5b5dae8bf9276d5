//! Small filesystem helpers shared by the store façade, the sidecar builder
//! and the mirror.

use std::{
    fs::{self, Permissions},
    io::{ErrorKind, Result, Write},
    mem::MaybeUninit,
    os::unix::fs::{symlink, FileTypeExt, MetadataExt, PermissionsExt},
    path::Path,
};

use rustix::{
    fs::{lgetxattr, llistxattr, mknodat, FileType, Mode, CWD},
    io::Errno,
};

/// Removes a directory tree, first making every directory in it writable so
/// that read-only directories (common in image root filesystems) don't stop
/// the removal.  A missing tree is not an error.
pub fn remove_tree(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            make_dirs_writable(path)?;
            fs::remove_dir_all(path)
        }
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn make_dirs_writable(dir: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(dir)?;
    let mode = meta.mode() & 0o7777;
    if mode & 0o700 != 0o700 {
        fs::set_permissions(dir, Permissions::from_mode(mode | 0o700))?;
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_dirs_writable(&entry.path())?;
        }
    }
    Ok(())
}

/// Removes a file or symlink, returning whether anything was there.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Returns whether something (including a dangling symlink) exists at `path`.
pub fn lexists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Creates `link` pointing at `target` unless something already exists at
/// `link`.  Returns whether the symlink was created.
pub fn ensure_symlink(target: &Path, link: &Path) -> Result<bool> {
    if lexists(link)? {
        return Ok(false);
    }
    match symlink(target, link) {
        Ok(()) => Ok(true),
        // someone else got there between our check and our create
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replaces the contents of `path` by writing a sibling temporary file and
/// renaming it into place.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Recreates a fifo or device node described by `meta` at `dest`.
///
/// Creating device nodes needs privileges; callers decide what to do with the
/// resulting error.
pub fn copy_special(meta: &fs::Metadata, dest: &Path) -> Result<()> {
    let ft = meta.file_type();
    let kind = if ft.is_fifo() {
        FileType::Fifo
    } else if ft.is_char_device() {
        FileType::CharacterDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else {
        return Err(std::io::Error::new(
            ErrorKind::Unsupported,
            format!("{dest:?}: unsupported file type"),
        ));
    };
    let mode = Mode::from_raw_mode(meta.mode() & 0o7777);
    mknodat(CWD, dest, kind, mode, meta.rdev())?;
    Ok(())
}

/// File capabilities and user attributes travel with image content.  The
/// overlay driver's own `user.overlay.*` bookkeeping does not.
fn is_layer_xattr(name: &str) -> bool {
    name == "security.capability"
        || (name.starts_with("user.") && !name.starts_with("user.overlay."))
}

/// Reads the extended attributes of `path` that belong to image content,
/// sorted by name.  Symlinks are not followed.
pub fn layer_xattrs(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut names = [MaybeUninit::new(0); 65536];
    let (names, _) = match llistxattr(path, &mut names) {
        Ok(listed) => listed,
        Err(Errno::NOTSUP) => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut xattrs = vec![];
    for name in names.split(|c| *c == 0) {
        let Ok(name) = std::str::from_utf8(name) else {
            continue;
        };
        if !is_layer_xattr(name) {
            continue;
        }
        let mut buffer = [MaybeUninit::new(0); 65536];
        match lgetxattr(path, name, &mut buffer) {
            Ok((value, _)) => xattrs.push((name.to_string(), value.to_vec())),
            // removed since it was listed
            Err(Errno::NODATA) => {}
            Err(e) => return Err(e.into()),
        }
    }
    xattrs.sort();
    Ok(xattrs)
}
