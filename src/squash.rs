//! Building squashfs sidecars and publishing them next to a layer's short
//! link.
//!
//! The compressor runs as `<program> <source-dir> <output> <options...>`,
//! writing to a temporary name inside the squash directory.  The result is
//! renamed into place only if no sidecar exists yet, so concurrent or repeated
//! runs never replace a published file.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};

use crate::{
    config::ConfigError,
    error::{Error, Result},
    fs::{ensure_symlink, remove_if_exists},
    storage::StoreLayout,
};

/// Options passed to the compressor unless configured otherwise.
pub const DEFAULT_OPTIONS: &[&str] = &[
    "-noappend",
    "-comp",
    "xz",
    "-no-xattrs",
    "-e",
    "security.capability",
];

/// An external squashfs compressor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressor {
    pub program: PathBuf,
    pub options: Vec<String>,
}

impl Compressor {
    /// A compressor using [`DEFAULT_OPTIONS`].
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            options: DEFAULT_OPTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replaces the default options.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    /// Splits an option string the way a POSIX shell would.
    pub fn parse_options(options: &str) -> std::result::Result<Vec<String>, ConfigError> {
        shell_words::split(options).map_err(|e| ConfigError::InvalidValue {
            key: "mksquashfs options".to_string(),
            value: options.to_string(),
            reason: e.to_string(),
        })
    }

    fn compress(&self, source: &Path, output: &Path) -> Result<()> {
        debug!(
            "Running {:?} {source:?} {output:?} {:?}",
            self.program, self.options
        );
        let result = Command::new(&self.program)
            .arg(source)
            .arg(output)
            .args(&self.options)
            .output()
            .map_err(|e| Error::io(format!("running {:?}", self.program), e))?;

        if !result.status.success() {
            let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&result.stderr));
            return Err(Error::ExternalTool {
                tool: self.program.display().to_string(),
                status: result.status,
                output,
            });
        }
        Ok(())
    }
}

/// What [`build_sidecar`] had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarOutcome {
    /// The canonical sidecar file.
    pub path: PathBuf,
    /// Whether the compressor ran.
    pub built: bool,
    /// Whether the short-link symlink was created.
    pub linked: bool,
}

/// Makes sure the sidecar for `link` exists, compressing `source` if needed,
/// and that it is exposed in the short-link directory.
pub fn build_sidecar(
    layout: &StoreLayout,
    source: &Path,
    link: &str,
    compressor: &Compressor,
) -> Result<SidecarOutcome> {
    let squash_dir = layout.squash_dir();
    let path = layout.squash_file(link);
    fs::create_dir_all(&squash_dir)
        .map_err(|e| Error::io(format!("creating {squash_dir:?}"), e))?;

    let built = if path.exists() {
        info!("Sidecar {path:?} already exists");
        false
    } else {
        info!("Building sidecar {path:?} from {source:?}");
        let partial = tempfile::Builder::new()
            .prefix(&format!(".{link}."))
            .suffix(".partial")
            .tempfile_in(&squash_dir)
            .map_err(|e| Error::io(format!("creating temporary sidecar in {squash_dir:?}"), e))?
            .into_temp_path();
        compressor.compress(source, &partial)?;

        match partial.persist_noclobber(&path) {
            Ok(()) => true,
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                info!("Sidecar {path:?} appeared while building, keeping it");
                false
            }
            Err(e) => return Err(Error::io(format!("publishing {path:?}"), e.error)),
        }
    };

    let symlink = layout.short_link_dir();
    fs::create_dir_all(&symlink).map_err(|e| Error::io(format!("creating {symlink:?}"), e))?;
    let symlink = layout.squash_symlink(link);
    let linked = ensure_symlink(&StoreLayout::squash_symlink_target(link), &symlink)
        .map_err(|e| Error::io(format!("linking {symlink:?}"), e))?;
    if linked {
        debug!("Linked {symlink:?}");
    }

    Ok(SidecarOutcome {
        path,
        built,
        linked,
    })
}

/// Removes the symlink and the sidecar of `link`.  Missing pieces are fine.
pub fn remove_sidecar(layout: &StoreLayout, link: &str) -> Result<()> {
    for path in [layout.squash_symlink(link), layout.squash_file(link)] {
        if remove_if_exists(&path).map_err(|e| Error::io(format!("removing {path:?}"), e))? {
            info!("Removed {path:?}");
        }
    }
    Ok(())
}
