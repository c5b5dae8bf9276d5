//! Migrating container images into a squashfs-backed read-only store.
//!
//! An image from a local containers-storage overlay store is flattened into a
//! single layer, ingested into a second (typically shared, read-only) store
//! and accompanied by a squashfs image of its root filesystem.  The sidecar
//! lives at `<root>/squash/<link>.squash` and is exposed next to the layer's
//! short link as `<root>/overlay/l/<link>.squash`, so that a runtime which
//! knows the layer can mount the squashfs image instead of the directory.
//!
//! The entry points are [`migrate::run_migration`] and
//! [`remove::run_removal`]; the lower level [`migrate::migrate_image`] and
//! [`remove::remove_image`] work on any [`storage::ImageStore`].

#![forbid(unsafe_code)]
#![deny(missing_debug_implementations)]

pub mod config;
pub mod detect;
pub mod digest;
pub mod error;
pub mod flatten;
pub mod fs;
pub mod manifest;
pub mod migrate;
pub mod mirror;
pub mod reference;
pub mod remove;
pub mod squash;
pub mod storage;
pub mod tempdir;


pub use config::{Config, ConfigOverrides, Operation};
pub use error::{Error, Result};
pub use migrate::{migrate_image, run_migration, MigrationOutcome};
pub use reference::{resolve_names, RegistriesConf, ResolvedNames, ShortNameResolver};
pub use remove::{remove_image, run_removal, RemovalOutcome};
