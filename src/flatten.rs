//! Serializing a root filesystem into a single uncompressed layer archive.
//!
//! The archive is rooted at the contents of the directory (there is no entry
//! for the directory itself), entries are emitted in lexical order within
//! each directory, symlinks are stored as symlinks and files with several
//! links are stored once followed by hardlink entries.  Ownership and
//! timestamps are recorded from the filesystem, so flattening the same tree
//! twice yields the same bytes.
//!
//! File capabilities and `user.*` attributes are recorded as PAX
//! `SCHILY.xattr.<name>` records, sorted by name.
//!
//! The digest covers the whole stream up to and including the end-of-archive
//! trailer, which is what the store hashes again when it ingests the archive.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Seek, Write},
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use log::{debug, info};
use tar::{Builder, EntryType, Header, HeaderMode};

use crate::{
    digest::{DigestWriter, LayerDigest},
    error::{Error, Result},
    fs::layer_xattrs,
};

type Archive<W> = Builder<DigestWriter<W>>;

fn archive_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Archive {
        path: path.to_path_buf(),
        source,
    }
}

struct Flattener {
    /// First archive path seen for each (device, inode) with several links.
    hardlinks: HashMap<(u64, u64), PathBuf>,
    entries: u64,
}

impl Flattener {
    fn append_dir<W: Write>(
        &mut self,
        archive: &mut Archive<W>,
        dir: &Path,
        name: &Path,
    ) -> Result<()> {
        let mut children: Vec<_> = fs::read_dir(dir)
            .and_then(|entries| entries.map(|e| e.map(|e| e.file_name())).collect())
            .map_err(archive_error(dir))?;
        children.sort();

        for child in children {
            let path = dir.join(&child);
            let name = name.join(&child);
            let meta = fs::symlink_metadata(&path).map_err(archive_error(&path))?;
            let ft = meta.file_type();

            if ft.is_socket() {
                debug!("Skipping socket {path:?}");
                continue;
            }

            if !ft.is_dir() && meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(target) = self.hardlinks.get(&key) {
                    let mut header = Header::new_gnu();
                    header.set_metadata_in_mode(&meta, HeaderMode::Complete);
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    archive
                        .append_link(&mut header, &name, target)
                        .map_err(archive_error(&path))?;
                    self.entries += 1;
                    continue;
                }
                self.hardlinks.insert(key, name.clone());
            }

            let xattrs = layer_xattrs(&path).map_err(archive_error(&path))?;
            if !xattrs.is_empty() {
                let records: Vec<_> = xattrs
                    .iter()
                    .map(|(key, value)| (format!("SCHILY.xattr.{key}"), value.as_slice()))
                    .collect();
                let records = records.iter().map(|(key, value)| (key.as_str(), *value));
                archive
                    .append_pax_extensions(records)
                    .map_err(archive_error(&path))?;
            }
            archive
                .append_path_with_name(&path, &name)
                .map_err(archive_error(&path))?;
            self.entries += 1;

            if ft.is_dir() {
                self.append_dir(archive, &path, &name)?;
            }
        }
        Ok(())
    }
}

/// Writes the archive of `root` to `writer` and returns the writer together
/// with the digest and size of everything written.
pub fn flatten_into<W: Write>(root: &Path, writer: W) -> Result<(W, LayerDigest)> {
    let mut archive = Builder::new(DigestWriter::new(writer));
    archive.follow_symlinks(false);
    archive.mode(HeaderMode::Complete);

    let mut flattener = Flattener {
        hardlinks: HashMap::new(),
        entries: 0,
    };
    flattener.append_dir(&mut archive, root, Path::new(""))?;

    // into_inner() writes the end-of-archive marker
    let digest_writer = archive.into_inner().map_err(archive_error(root))?;
    let (mut writer, digest) = digest_writer.finish();
    writer.flush().map_err(archive_error(root))?;

    info!(
        "Flattened {root:?}: {} entries, {digest}",
        flattener.entries
    );
    Ok((writer, digest))
}

/// Flattens `root` into an anonymous spool file created in `spool_dir`.
///
/// The returned file is positioned at its start, ready to be ingested.
pub fn flatten(root: &Path, spool_dir: &Path) -> Result<(File, LayerDigest)> {
    let spool = tempfile::tempfile_in(spool_dir)
        .map_err(|e| Error::io(format!("creating spool file in {spool_dir:?}"), e))?;
    let (mut spool, digest) = flatten_into(root, spool)?;
    spool.rewind().map_err(archive_error(root))?;
    Ok((spool, digest))
}
