//! Error types for the migration and removal pipelines.
//!
//! Every fatal condition bubbles up as an [`Error`].  Non-fatal conditions
//! (a sidecar that could not be removed, an auxiliary blob that could not be
//! copied) are logged as warnings at the point where they happen and never
//! become an `Error`.
//!
//! - [`Resolution`]: the reference cannot be canonicalized; nothing was touched yet.
//! - [`NotFound`]: the source image is absent.
//! - [`Integrity`]: an image record lacks a required field.
//! - [`Archive`]: flattening the root filesystem failed.
//! - [`ExternalTool`]: the compressor or the sync tool exited unsuccessfully.
//! - [`Manifest`]: the manifest or config could not be (de)serialized.
//! - [`Store`]: the store engine failed, including digest mismatches on ingest.
//!
//! [`Resolution`]: Error::Resolution
//! [`NotFound`]: Error::NotFound
//! [`Integrity`]: Error::Integrity
//! [`Archive`]: Error::Archive
//! [`ExternalTool`]: Error::ExternalTool
//! [`Manifest`]: Error::Manifest
//! [`Store`]: Error::Store

use std::{path::PathBuf, process::ExitStatus};

use crate::{config::ConfigError, storage::StoreError};

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the migration and removal pipelines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image reference could not be turned into a canonical name.
    #[error("cannot resolve image reference {reference:?}: {reason}")]
    Resolution { reference: String, reason: String },

    /// No image with the requested name exists.
    #[error("image not found: {0}")]
    NotFound(String),

    /// An image record is missing something every image must have.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Serializing a root filesystem into a layer archive failed.
    #[error("archive error at {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external program exited unsuccessfully.  `output` holds its
    /// combined stdout and stderr.
    #[error("{tool} failed ({status}):\n{output}")]
    ExternalTool {
        tool: String,
        status: ExitStatus,
        output: String,
    },

    /// The manifest or config documents could not be processed.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// The store engine reported an error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error outside of the store and the archive walk.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wraps an I/O error with a short description of what was being done.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if this error means "the image does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Store(StoreError::ImageNotFound(_))
        )
    }
}
