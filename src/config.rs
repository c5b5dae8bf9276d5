//! Run configuration: command line values layered over a `KEY=VALUE` file
//! layered over built-in defaults.
//!
//! The file format is shared with the parallax mount helper:
//!
//! ```text
//! # comment
//! PARALLAX_PODMAN_ROOT=/var/lib/containers/storage
//! PARALLAX_MKSQUASHFS_OPTS="-comp zstd -Xcompression-level 19"
//! ```
//!
//! Unknown keys are ignored so that one file can serve several tools.

use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, LevelFilter};

use crate::squash::Compressor;

pub const DEFAULT_PODMAN_ROOT: &str = "/var/lib/containers/storage";
pub const DEFAULT_RO_STORAGE_PATH: &str = "/mnt/nfs/podman";
pub const DEFAULT_MKSQUASHFS_PATH: &str = "/usr/bin/mksquashfs";
pub const DEFAULT_RSYNC_PATH: &str = "rsync";

const KEY_PODMAN_ROOT: &str = "PARALLAX_PODMAN_ROOT";
const KEY_RO_STORAGE_PATH: &str = "PARALLAX_RO_STORAGE_PATH";
const KEY_MKSQUASHFS_PATH: &str = "PARALLAX_MKSQUASHFS_PATH";
const KEY_MKSQUASHFS_OPTS: &str = "PARALLAX_MKSQUASHFS_OPTS";
const KEY_RSYNC_PATH: &str = "PARALLAX_RSYNC_PATH";
const KEY_MIRROR: &str = "PARALLAX_MIRROR";
const KEY_LOG_LEVEL: &str = "PARALLAX_LOG_LEVEL";

/// Directories an overlay store root contains.
const STORE_SUBDIRS: &[&str] = &["overlay", "overlay-images", "overlay-layers"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: invalid line {content:?}", path.display())]
    InvalidLine {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("invalid registries configuration {}: {source}", path.display())]
    Registries {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{what} {}: {reason}", path.display())]
    InvalidPath {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },
}

/// What a run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Migrate,
    Remove,
}

/// Values given explicitly on the command line.  `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub podman_root: Option<PathBuf>,
    pub ro_storage_path: Option<PathBuf>,
    pub mksquashfs_path: Option<PathBuf>,
    pub mksquashfs_opts: Option<String>,
    pub rsync_path: Option<PathBuf>,
    pub mirror: Option<bool>,
    pub log_level: Option<String>,
}

/// The complete configuration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub operation: Operation,
    /// The image reference as given by the user.
    pub image: String,
    /// Graph root of the local (source) store.
    pub podman_root: PathBuf,
    /// Graph root of the shared read-only store.
    pub ro_storage_path: PathBuf,
    pub mksquashfs_path: PathBuf,
    /// Compressor options replacing the defaults.
    pub mksquashfs_opts: Option<Vec<String>>,
    pub rsync_path: PathBuf,
    /// Whether mutations go through a local mirror of the read-only store.
    pub mirror: bool,
    pub log_level: LevelFilter,
}

/// Reads a `KEY=VALUE` file.
///
/// Blank lines and lines starting with `#` are skipped, a value wrapped in
/// double quotes is unwrapped, and a later occurrence of a key wins.
pub fn load_key_value_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut values = BTreeMap::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let invalid = || ConfigError::InvalidLine {
            path: path.to_path_buf(),
            line: index + 1,
            content: raw.to_string(),
        };
        let (key, value) = line.split_once('=').ok_or_else(invalid)?;
        if !is_valid_key(key) {
            return Err(invalid());
        }
        values.insert(key.to_string(), unquote(value).to_string());
    }
    Ok(values)
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Parses the boolean spellings accepted for `PARALLAX_MIRROR`.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_level(key: &str, value: &str) -> Result<LevelFilter, ConfigError> {
    LevelFilter::from_str(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

impl Config {
    /// Layers `overrides` over the values in `file` (if any) over the
    /// defaults.
    pub fn resolve(
        operation: Operation,
        image: impl Into<String>,
        overrides: ConfigOverrides,
        file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let file_values = match file {
            Some(path) => {
                debug!("Loading configuration from {path:?}");
                load_key_value_file(path)?
            }
            None => BTreeMap::new(),
        };
        let from_file = |key: &str| file_values.get(key).cloned();

        let path_setting = |given: Option<PathBuf>, key: &str, default: &str| {
            given
                .or_else(|| from_file(key).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let (opts_key, opts) = match overrides.mksquashfs_opts {
            Some(opts) => ("--mksquashfs-opts", Some(opts)),
            None => (KEY_MKSQUASHFS_OPTS, from_file(KEY_MKSQUASHFS_OPTS)),
        };
        let mksquashfs_opts = match opts.filter(|o| !o.trim().is_empty()) {
            Some(opts) => Some(Compressor::parse_options(&opts).map_err(|e| match e {
                ConfigError::InvalidValue { value, reason, .. } => ConfigError::InvalidValue {
                    key: opts_key.to_string(),
                    value,
                    reason,
                },
                other => other,
            })?),
            None => None,
        };

        let mirror = match overrides.mirror {
            Some(mirror) => mirror,
            None => match from_file(KEY_MIRROR) {
                Some(value) => parse_bool(KEY_MIRROR, &value)?,
                None => true,
            },
        };

        let log_level = match overrides.log_level {
            Some(level) => parse_level("--log-level", &level)?,
            None => match from_file(KEY_LOG_LEVEL) {
                Some(level) => parse_level(KEY_LOG_LEVEL, &level)?,
                None => LevelFilter::Info,
            },
        };

        Ok(Config {
            operation,
            image: image.into(),
            podman_root: path_setting(overrides.podman_root, KEY_PODMAN_ROOT, DEFAULT_PODMAN_ROOT),
            ro_storage_path: path_setting(
                overrides.ro_storage_path,
                KEY_RO_STORAGE_PATH,
                DEFAULT_RO_STORAGE_PATH,
            ),
            mksquashfs_path: path_setting(
                overrides.mksquashfs_path,
                KEY_MKSQUASHFS_PATH,
                DEFAULT_MKSQUASHFS_PATH,
            ),
            mksquashfs_opts,
            rsync_path: path_setting(overrides.rsync_path, KEY_RSYNC_PATH, DEFAULT_RSYNC_PATH),
            mirror,
            log_level,
        })
    }

    /// Checks the paths this run is going to use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "--image".to_string(),
                value: self.image.clone(),
                reason: "an image name is required".to_string(),
            });
        }
        if self.operation == Operation::Migrate {
            require_dir("podman root", &self.podman_root)?;
        }
        require_store_dir(&self.ro_storage_path)?;
        if self.operation == Operation::Migrate {
            require_executable("mksquashfs", &self.mksquashfs_path)?;
        }
        Ok(())
    }

    /// The compressor this run uses.
    pub fn compressor(&self) -> Compressor {
        let compressor = Compressor::new(&self.mksquashfs_path);
        match &self.mksquashfs_opts {
            Some(opts) => compressor.with_options(opts.clone()),
            None => compressor,
        }
    }
}

fn invalid_path(what: &'static str, path: &Path, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidPath {
        what,
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn require_dir(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    let meta = fs::metadata(path).map_err(|e| invalid_path(what, path, e))?;
    if !meta.is_dir() {
        return Err(invalid_path(what, path, "not a directory"));
    }
    Ok(())
}

/// The read-only store must be empty or look like an overlay store.
fn require_store_dir(path: &Path) -> Result<(), ConfigError> {
    const WHAT: &str = "read-only storage path";
    require_dir(WHAT, path)?;
    let mut entries = fs::read_dir(path).map_err(|e| invalid_path(WHAT, path, e))?;
    if entries.next().is_none() {
        return Ok(());
    }
    if STORE_SUBDIRS.iter().any(|dir| path.join(dir).exists()) {
        return Ok(());
    }
    Err(invalid_path(
        WHAT,
        path,
        "not empty and does not look like an overlay store",
    ))
}

fn require_executable(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    let meta = fs::metadata(path).map_err(|e| invalid_path(what, path, e))?;
    if meta.is_dir() {
        return Err(invalid_path(what, path, "is a directory"));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(invalid_path(what, path, "not executable"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{squash::DEFAULT_OPTIONS, test::tempdir};

    fn write_conf(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("parallax.conf");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_key_value_file() {
        let dir = tempdir();
        let path = write_conf(
            dir.path(),
            "# storage\n\nPARALLAX_PODMAN_ROOT=/data/podman\n  PARALLAX_MKSQUASHFS_OPTS=\"-comp zstd\"  \nEMPTY=\nPARALLAX_PODMAN_ROOT=/data/other\n",
        );
        let values = load_key_value_file(&path).unwrap();
        assert_eq!(values["PARALLAX_PODMAN_ROOT"], "/data/other");
        assert_eq!(values["PARALLAX_MKSQUASHFS_OPTS"], "-comp zstd");
        assert_eq!(values["EMPTY"], "");
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_key_value_file_errors() {
        let dir = tempdir();
        for bad in ["JUST_A_KEY", "1KEY=value", "KEY-DASH=value", "=value"] {
            let path = write_conf(dir.path(), &format!("OK=1\n{bad}\n"));
            match load_key_value_file(&path).unwrap_err() {
                ConfigError::InvalidLine { line, .. } => assert_eq!(line, 2, "{bad}"),
                other => panic!("{bad}: unexpected {other}"),
            }
        }
        assert!(matches!(
            load_key_value_file(&dir.path().join("missing")).unwrap_err(),
            ConfigError::Read { .. }
        ));
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(
            Operation::Migrate,
            "alpine",
            ConfigOverrides::default(),
            None,
        )
        .unwrap();
        assert_eq!(config.podman_root, Path::new(DEFAULT_PODMAN_ROOT));
        assert_eq!(config.ro_storage_path, Path::new(DEFAULT_RO_STORAGE_PATH));
        assert_eq!(config.mksquashfs_path, Path::new(DEFAULT_MKSQUASHFS_PATH));
        assert_eq!(config.rsync_path, Path::new(DEFAULT_RSYNC_PATH));
        assert_eq!(config.mksquashfs_opts, None);
        assert!(config.mirror);
        assert_eq!(config.log_level, LevelFilter::Info);
        assert_eq!(config.compressor().options, DEFAULT_OPTIONS);
    }

    #[test]
    fn test_precedence() {
        let dir = tempdir();
        let path = write_conf(
            dir.path(),
            "PARALLAX_PODMAN_ROOT=/from/file\nPARALLAX_RO_STORAGE_PATH=/ro/file\nPARALLAX_MKSQUASHFS_OPTS=\"-comp gzip\"\nPARALLAX_MIRROR=no\nPARALLAX_LOG_LEVEL=debug\n",
        );
        let overrides = ConfigOverrides {
            podman_root: Some("/from/cli".into()),
            log_level: Some("warn".into()),
            ..Default::default()
        };

        let config = Config::resolve(Operation::Remove, "alpine", overrides, Some(&path)).unwrap();
        assert_eq!(config.podman_root, Path::new("/from/cli"));
        assert_eq!(config.ro_storage_path, Path::new("/ro/file"));
        assert_eq!(config.mksquashfs_path, Path::new(DEFAULT_MKSQUASHFS_PATH));
        assert_eq!(
            config.mksquashfs_opts,
            Some(vec!["-comp".to_string(), "gzip".to_string()])
        );
        assert!(!config.mirror);
        assert_eq!(config.log_level, LevelFilter::Warn);
        assert_eq!(config.compressor().options, vec!["-comp", "gzip"]);
    }

    #[test]
    fn test_invalid_values() {
        let overrides = ConfigOverrides {
            log_level: Some("loud".into()),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(Operation::Migrate, "alpine", overrides, None).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));

        let overrides = ConfigOverrides {
            mksquashfs_opts: Some("-e 'open".into()),
            ..Default::default()
        };
        match Config::resolve(Operation::Migrate, "alpine", overrides, None).unwrap_err() {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "--mksquashfs-opts"),
            other => panic!("unexpected {other}"),
        }

        assert!(parse_bool(KEY_MIRROR, "maybe").is_err());
        assert!(parse_bool(KEY_MIRROR, "ON").unwrap());
    }

    fn config_for(podman: &Path, ro: &Path, mksquashfs: &Path) -> Config {
        let overrides = ConfigOverrides {
            podman_root: Some(podman.into()),
            ro_storage_path: Some(ro.into()),
            mksquashfs_path: Some(mksquashfs.into()),
            ..Default::default()
        };
        Config::resolve(Operation::Migrate, "alpine", overrides, None).unwrap()
    }

    #[test]
    fn test_validate() {
        let podman = tempdir();
        let ro = tempdir();
        let tools = tempdir();
        let mksquashfs = tools.path().join("mksquashfs");
        fs::write(&mksquashfs, "#!/bin/sh\n").unwrap();

        // not executable yet
        let config = config_for(podman.path(), ro.path(), &mksquashfs);
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidPath { what: "mksquashfs", .. }
        ));
        fs::set_permissions(&mksquashfs, fs::Permissions::from_mode(0o755)).unwrap();
        config.validate().unwrap();

        // removal does not need the compressor
        let mut removal = config_for(podman.path(), ro.path(), &tools.path().join("missing"));
        removal.operation = Operation::Remove;
        removal.validate().unwrap();

        // a non-empty directory that is not a store is refused
        fs::write(ro.path().join("random-file"), "").unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::InvalidPath { .. }
        ));
        fs::create_dir(ro.path().join("overlay-images")).unwrap();
        config.validate().unwrap();

        let missing = config_for(&podman.path().join("nope"), ro.path(), &mksquashfs);
        assert!(matches!(
            missing.validate().unwrap_err(),
            ConfigError::InvalidPath { what: "podman root", .. }
        ));
    }
}
