//! Image metadata model
//!
//! Structured record of an image's layer inventory, serialized as a JSON
//! label on the image itself. Individual layers also materialize on disk
//! as a TOML config document next to the layer directory, paired with a
//! `.sha` sidecar holding the digest of the last exported content.
//!
//! A missing or malformed label is never fatal: callers get empty
//! metadata and a warning, and every layer is treated as new.

use crate::error::StrataResult;
use crate::image::Image;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Image label under which the serialized [`AppImageMetadata`] is stored
pub const METADATA_LABEL: &str = "io.strata.image.metadata";

/// Env var on the output image pointing at the layers root
pub const ENV_LAYERS_DIR: &str = "STRATA_LAYERS_DIR";

/// Env var on the output image pointing at the application directory
pub const ENV_APP_DIR: &str = "STRATA_APP_DIR";

/// Opaque buildpack-defined key/value data carried per layer.
///
/// Preserved as-is across label and config (de)serialization; the core
/// never interprets it. `serde_json`'s `preserve_order` feature keeps
/// key order stable across round trips.
pub type LayerData = serde_json::Map<String, serde_json::Value>;

/// Full layer inventory of a built image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppImageMetadata {
    pub app: LayerRef,
    pub config: LayerRef,
    pub launcher: LayerRef,
    #[serde(rename = "runImage")]
    pub run_image: RunImageMetadata,
    pub buildpacks: Vec<BuildpackMetadata>,
}

/// Reference to a single logical layer by content digest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerRef {
    pub sha: String,
}

/// Identity of the base image the app layers were stacked on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunImageMetadata {
    #[serde(rename = "topLayer")]
    pub top_layer: String,
    pub sha: String,
}

/// Per-buildpack layer inventory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildpackMetadata {
    #[serde(rename = "key")]
    pub id: String,
    pub version: String,
    pub layers: BTreeMap<String, LayerMetadata>,
}

/// Metadata for one buildpack layer.
///
/// `sha` is always the digest of the uncompressed layer content (the
/// diff ID), never a compressed blob digest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerMetadata {
    pub sha: String,
    pub data: LayerData,
    pub launch: bool,
    pub build: bool,
    pub cache: bool,
}

impl AppImageMetadata {
    /// Look up a buildpack's metadata by id
    pub fn buildpack(&self, id: &str) -> Option<&BuildpackMetadata> {
        self.buildpacks.iter().find(|bp| bp.id == id)
    }

    /// Look up a single layer's metadata by buildpack id and layer name
    pub fn layer(&self, buildpack_id: &str, layer: &str) -> Option<&LayerMetadata> {
        self.buildpack(buildpack_id)
            .and_then(|bp| bp.layers.get(layer))
    }
}

impl LayerMetadata {
    /// The on-disk config document for this layer
    pub fn config(&self) -> LayerConfig {
        LayerConfig {
            launch: self.launch,
            build: self.build,
            cache: self.cache,
            data: self.data.clone(),
        }
    }
}

/// Per-layer TOML config document.
///
/// `launch`/`build`/`cache` are the layer flags; every other top-level
/// key belongs to the buildpack and is carried opaquely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(flatten)]
    pub data: LayerData,
}

impl LayerConfig {
    /// Parse a config document from a TOML string
    pub fn parse(content: &str) -> StrataResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize back to a TOML string
    pub fn to_toml(&self) -> StrataResult<String> {
        Ok(toml::to_string(self)?)
    }

    /// Attach a content digest, producing the label-side metadata record
    pub fn into_metadata(self, sha: impl Into<String>) -> LayerMetadata {
        LayerMetadata {
            sha: sha.into(),
            data: self.data,
            launch: self.launch,
            build: self.build,
            cache: self.cache,
        }
    }
}

/// Strip the `sha256:` prefix from a digest, if present.
///
/// Sidecar files store the raw form; metadata stores the prefixed form.
pub fn raw_digest(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Whether two digests identify the same content, ignoring prefix form.
/// Empty digests never match anything.
pub fn digests_match(a: &str, b: &str) -> bool {
    let (a, b) = (raw_digest(a), raw_digest(b));
    !a.is_empty() && a == b
}

/// Read the digest sidecar next to a layer directory, if present.
/// An unreadable sidecar counts as absent.
pub async fn read_sidecar(dir: &Path, name: &str) -> Option<String> {
    let path = dir.join(format!("{name}.sha"));
    match tokio::fs::read_to_string(&path).await {
        Ok(s) => {
            let s = s.trim().to_string();
            (!s.is_empty()).then_some(s)
        }
        Err(_) => None,
    }
}

/// Read an image's metadata label, falling back to empty metadata.
///
/// Every failure mode (image absent, label missing, label unparsable)
/// is a warning, never an error: the build proceeds as if there were no
/// previous image.
pub async fn read_image_metadata(image: &dyn Image) -> AppImageMetadata {
    match image.found().await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                "image '{}' not found or requires authentication to access",
                image.name()
            );
            return AppImageMetadata::default();
        }
        Err(e) => {
            warn!("could not query image '{}': {}", image.name(), e);
            return AppImageMetadata::default();
        }
    }

    let label = match image.label(METADATA_LABEL).await {
        Ok(label) => label,
        Err(e) => {
            warn!(
                "could not read '{}' label of image '{}': {}",
                METADATA_LABEL,
                image.name(),
                e
            );
            return AppImageMetadata::default();
        }
    };

    if label.is_empty() {
        warn!(
            "previous image '{}' does not have '{}' label",
            image.name(),
            METADATA_LABEL
        );
        return AppImageMetadata::default();
    }

    match serde_json::from_str(&label) {
        Ok(metadata) => metadata,
        Err(_) => {
            warn!(
                "previous image '{}' has incompatible '{}' label",
                image.name(),
                METADATA_LABEL
            );
            AppImageMetadata::default()
        }
    }
}
