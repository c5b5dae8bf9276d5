//! Error types for the store façade.
//!
//! # Error Categories
//!
//! - **Entity errors**: [`ImageNotFound`], [`LayerNotFound`], [`BigDataNotFound`]
//! - **Ingest errors**: [`DigestMismatch`]
//! - **Storage errors**: [`InvalidStorage`]
//! - **System errors**: [`Io`], [`JsonParse`], [`Lock`]
//!
//! [`ImageNotFound`]: StoreError::ImageNotFound
//! [`LayerNotFound`]: StoreError::LayerNotFound
//! [`BigDataNotFound`]: StoreError::BigDataNotFound
//! [`DigestMismatch`]: StoreError::DigestMismatch
//! [`InvalidStorage`]: StoreError::InvalidStorage
//! [`Io`]: StoreError::Io
//! [`JsonParse`]: StoreError::JsonParse
//! [`Lock`]: StoreError::Lock

use crate::digest::LayerDigest;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by an [`ImageStore`](super::ImageStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No image carries the requested name or id.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The requested layer does not exist.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// The image has no blob under the requested key.
    #[error("image {image} has no big data {key:?}")]
    BigDataNotFound { image: String, key: String },

    /// The diff stream did not reproduce the declared digest and size.  The
    /// store treats this as corruption and discards the layer.
    #[error("layer content mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: LayerDigest,
        actual: LayerDigest,
    },

    /// The store directory or one of its index files is malformed.
    #[error("invalid storage: {0}")]
    InvalidStorage(String),

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Lock file operation failed.
    #[error("lock error: {0}")]
    Lock(#[from] super::lockfile::LockError),
}
