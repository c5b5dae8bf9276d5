//! Turning user supplied image references into the names images are stored
//! under.
//!
//! A reference is `name[:tag]`.  The tag is whatever follows the last `:`
//! after the last `/`, so a registry port (`registry:5000/app`) is never
//! mistaken for a tag.  Names whose first component looks like a host are
//! fully qualified; anything else is a short name which goes through a
//! [`ShortNameResolver`], normally the system's `registries.conf`.

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::Deserialize;

use crate::{
    config::ConfigError,
    error::{Error, Result},
};

/// Tag used when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB: &str = "docker.io";

/// A parsed `name[:tag]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Resolution {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.contains('@') {
            return Err(invalid("digest references are not supported"));
        }

        let last_slash = reference.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match reference[last_slash..].rfind(':') {
            Some(i) => (
                &reference[..last_slash + i],
                &reference[last_slash + i + 1..],
            ),
            None => (reference, ""),
        };

        if name.is_empty() || name.ends_with('/') || name.starts_with('/') {
            return Err(invalid("empty image name"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid("image names cannot contain whitespace"));
        }

        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Returns true if the name starts with a registry host.
    pub fn is_fully_qualified(&self) -> bool {
        match self.name.split_once('/') {
            Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
            None => false,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Expands short names into fully qualified names.
pub trait ShortNameResolver {
    /// Returns the fully qualified names (without tag) `short_name` may refer
    /// to, most preferred first.
    fn candidates(&self, short_name: &str) -> Result<Vec<String>>;
}

/// The names an image reference stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNames {
    /// `registry/name:tag`.
    pub canonical: String,
    /// The reference as the user typed it, if that differs from `canonical`.
    pub literal: Option<String>,
}

impl ResolvedNames {
    /// The canonical name followed by the literal one, if any.
    pub fn names(&self) -> Vec<String> {
        std::iter::once(self.canonical.clone())
            .chain(self.literal.clone())
            .collect()
    }
}

impl fmt::Display for ResolvedNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Resolves `reference` into its canonical name plus the literal spelling.
pub fn resolve_names<R: ShortNameResolver + ?Sized>(
    reference: &str,
    resolver: &R,
) -> Result<ResolvedNames> {
    let parsed = ImageReference::parse(reference)?;

    let name = if parsed.is_fully_qualified() {
        parsed.name.clone()
    } else {
        let candidates = resolver
            .candidates(&parsed.name)
            .map_err(|e| Error::Resolution {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Candidates for {:?}: {candidates:?}", parsed.name);
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::Resolution {
                reference: reference.to_string(),
                reason: "no registry candidates for short name".to_string(),
            })?
    };

    let canonical = format!("{name}:{}", parsed.tag);
    let literal = (reference != canonical).then(|| reference.to_string());
    Ok(ResolvedNames { canonical, literal })
}

/// The subset of a `registries.conf` file relevant to short names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RegistriesFile {
    unqualified_search_registries: Option<Vec<String>>,
    aliases: Option<BTreeMap<String, String>>,
}

/// Short-name configuration merged from the system's registries.conf files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistriesConf {
    /// Registries tried, in order, for short names without an alias.
    pub search_registries: Vec<String>,
    /// Short name to fully qualified name.
    pub aliases: BTreeMap<String, String>,
}

impl RegistriesConf {
    /// Parses one configuration file.
    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        let mut conf = Self::default();
        conf.merge(toml::from_str(contents)?);
        Ok(conf)
    }

    fn merge(&mut self, file: RegistriesFile) {
        if let Some(registries) = file.unqualified_search_registries {
            self.search_registries = registries;
        }
        self.aliases.extend(file.aliases.unwrap_or_default());
    }

    /// Loads and merges `paths` in order.  Missing files are skipped.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut conf = Self::default();
        for path in paths {
            let path = path.as_ref();
            let contents = match fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    }
                    .into())
                }
            };
            let file = toml::from_str(&contents).map_err(|source| ConfigError::Registries {
                path: path.to_path_buf(),
                source,
            })?;
            debug!("Loaded registries configuration from {path:?}");
            conf.merge(file);
        }
        Ok(conf)
    }

    /// The files consulted by [`load_default`](Self::load_default), lowest
    /// precedence first.
    pub fn default_paths() -> Vec<PathBuf> {
        if let Some(path) = std::env::var_os("CONTAINERS_REGISTRIES_CONF") {
            return vec![PathBuf::from(path)];
        }

        let mut paths = vec![];
        let mut add_tree = |dir: PathBuf| {
            paths.push(dir.join("registries.conf"));
            let dropins = dir.join("registries.conf.d");
            match fs::read_dir(&dropins) {
                Ok(entries) => {
                    let mut confs: Vec<PathBuf> = entries
                        .filter_map(|e| e.ok().map(|e| e.path()))
                        .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
                        .collect();
                    confs.sort();
                    paths.extend(confs);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot list {dropins:?}: {e}"),
            }
        };

        add_tree(PathBuf::from("/etc/containers"));
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            add_tree(home.join(".config/containers"));
            paths.push(home.join(".cache/containers/short-name-aliases.conf"));
        }
        paths
    }

    /// Loads the system configuration.
    pub fn load_default() -> Result<Self> {
        Self::load_files(&Self::default_paths())
    }
}

/// Prefixes single-component Docker Hub names with `library/`.
fn normalize_docker_hub(name: String) -> String {
    match name.strip_prefix("docker.io/") {
        Some(rest) if !rest.contains('/') => format!("{DOCKER_HUB}/library/{rest}"),
        _ => name,
    }
}

impl ShortNameResolver for RegistriesConf {
    fn candidates(&self, short_name: &str) -> Result<Vec<String>> {
        let alias = self.aliases.get(short_name).cloned();
        let searched = self
            .search_registries
            .iter()
            .map(|registry| format!("{registry}/{short_name}"));

        let mut candidates: Vec<String> = Vec::new();
        for name in alias.into_iter().chain(searched).map(normalize_docker_hub) {
            if !candidates.contains(&name) {
                candidates.push(name);
            }
        }
        Ok(candidates)
    }
}
