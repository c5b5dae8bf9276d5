//! Rewriting an image's manifest and config for its flattened layer.
//!
//! The config is edited as plain JSON so that every field, including ones
//! the OCI types do not model, survives.  Only `rootfs` is replaced and one
//! `history` entry is appended.  The manifest is rebuilt from scratch with a
//! single uncompressed layer.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use oci_spec::image::{DescriptorBuilder, Digest, ImageManifest, ImageManifestBuilder, MediaType};
use serde_json::{json, Map, Value};

use crate::{
    digest::{sha256_digest, LayerDigest},
    error::{Error, Result},
};

/// `created_by` of the history entry recording the flattening.
pub const HISTORY_CREATED_BY: &str = "parallax";

/// The documents of a flattened image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenImage {
    pub config: Vec<u8>,
    pub config_digest: String,
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
}

fn manifest_error(what: &str, reason: impl fmt::Display) -> Error {
    Error::Manifest(format!("{what}: {reason}"))
}

/// Parses an image manifest.
pub fn parse_manifest(data: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(data).map_err(|e| manifest_error("parsing source manifest", e))
}

fn parse_digest(digest: &str) -> Result<Digest> {
    digest
        .parse()
        .map_err(|e: oci_spec::OciSpecError| manifest_error("invalid digest", e))
}

/// Points the config at the single `layer` and records the flattening.
fn rewrite_config(
    source_config: &[u8],
    layer: &LayerDigest,
    source_image_id: &str,
    created: Option<DateTime<Utc>>,
) -> Result<Vec<u8>> {
    let mut config: Map<String, Value> = serde_json::from_slice(source_config)
        .map_err(|e| manifest_error("parsing source config", e))?;

    config.insert(
        "rootfs".to_string(),
        json!({"type": "layers", "diff_ids": [layer.digest]}),
    );

    let mut entry = Map::new();
    if let Some(created) = created {
        entry.insert(
            "created".to_string(),
            Value::String(created.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }
    entry.insert("created_by".to_string(), json!(HISTORY_CREATED_BY));
    entry.insert(
        "comment".to_string(),
        json!(format!("Flattened layers from image {source_image_id}")),
    );

    match config.get_mut("history") {
        Some(Value::Array(history)) => history.push(Value::Object(entry)),
        None | Some(Value::Null) => {
            config.insert("history".to_string(), json!([entry]));
        }
        Some(other) => {
            return Err(Error::Manifest(format!(
                "config history is not a list: {other}"
            )))
        }
    }

    serde_json::to_vec(&config).map_err(|e| manifest_error("serializing config", e))
}

/// Produces the config and manifest of the flattened image.
///
/// `created` stamps the appended history entry; passing the source image's
/// creation time keeps the output identical across runs.
pub fn rewrite(
    source_manifest: &ImageManifest,
    source_config: &[u8],
    layer: &LayerDigest,
    source_image_id: &str,
    created: Option<DateTime<Utc>>,
) -> Result<RewrittenImage> {
    let config = rewrite_config(source_config, layer, source_image_id, created)?;
    let config_digest = sha256_digest(&config);
    debug!("New config {config_digest} ({} bytes)", config.len());

    let build_error = |e: oci_spec::OciSpecError| manifest_error("building manifest", e);
    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(parse_digest(&config_digest)?)
        .size(config.len() as u64)
        .build()
        .map_err(build_error)?;
    let layer_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageLayer)
        .digest(parse_digest(&layer.digest)?)
        .size(layer.size)
        .build()
        .map_err(build_error)?;

    let mut builder = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(vec![layer_descriptor]);
    if let Some(annotations) = source_manifest.annotations() {
        builder = builder.annotations(annotations.clone());
    }
    let manifest = builder.build().map_err(build_error)?;

    let manifest = serde_json::to_vec(&manifest)
        .map_err(|e| manifest_error("serializing manifest", e))?;
    let manifest_digest = sha256_digest(&manifest);
    debug!("New manifest {manifest_digest} ({} bytes)", manifest.len());

    Ok(RewrittenImage {
        config,
        config_digest,
        manifest,
        manifest_digest,
    })
}
