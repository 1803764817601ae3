//! Image store abstraction
//!
//! The analyzer and exporter consume images only through the [`Image`]
//! trait; whether an implementation is backed by a registry, a local
//! daemon, or nothing at all is irrelevant to them. Retry policy for
//! transient store failures belongs to implementations, never to the
//! callers.

use crate::error::{StrataError, StrataResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Handle to a layer blob inside an existing image, addressed by the
/// digest of its uncompressed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayer {
    pub diff_id: String,
}

/// Abstract image store interface
///
/// Mutators operate on an already-layered image in place; appending
/// layers and then setting labels, env, entrypoint or command must not
/// require re-layering. Nothing is durable until `save`.
#[async_trait]
pub trait Image: Send + Sync {
    /// Reference the image is known by
    fn name(&self) -> &str;

    /// Whether the image exists and is accessible
    async fn found(&self) -> StrataResult<bool>;

    /// Read a label; an unset label is the empty string
    async fn label(&self, key: &str) -> StrataResult<String>;

    /// Read an environment entry
    async fn env(&self, key: &str) -> StrataResult<Option<String>>;

    /// Current entrypoint
    async fn entrypoint(&self) -> StrataResult<Vec<String>>;

    /// Current command
    async fn cmd(&self) -> StrataResult<Vec<String>>;

    /// Digest identifying the image itself
    async fn digest(&self) -> StrataResult<String>;

    /// Digest of the image's topmost layer
    async fn top_layer(&self) -> StrataResult<String>;

    /// Locate a layer blob by the digest of its uncompressed content
    async fn layer_by_digest(&self, diff_id: &str) -> StrataResult<ImageLayer>;

    /// Append a freshly built tar layer
    async fn add_layer(&mut self, tar_path: &Path) -> StrataResult<()>;

    /// Append an existing blob taken from another image
    async fn reuse_layer(&mut self, layer: ImageLayer) -> StrataResult<()>;

    async fn set_label(&mut self, key: &str, value: &str) -> StrataResult<()>;

    async fn set_env(&mut self, key: &str, value: &str) -> StrataResult<()>;

    async fn set_entrypoint(&mut self, entrypoint: &[String]) -> StrataResult<()>;

    async fn set_cmd(&mut self, cmd: &[String]) -> StrataResult<()>;

    /// Persist the image. The sole durability point: until this
    /// succeeds nothing partial is visible anywhere.
    async fn save(&mut self) -> StrataResult<String>;
}

/// In-memory image store used for offline (dry-run) composition.
///
/// Records every mutation without persisting anything; `save` returns a
/// digest over the accumulated state. Also doubles as the "previous
/// image is absent" case via [`DryRunImage::not_found`].
#[derive(Debug, Clone, Default)]
pub struct DryRunImage {
    name: String,
    found: bool,
    digest: String,
    top_layer: String,
    labels: HashMap<String, String>,
    env: HashMap<String, String>,
    entrypoint: Vec<String>,
    cmd: Vec<String>,
    layers: Vec<String>,
    saved: bool,
}

impl DryRunImage {
    /// An existing (empty) base image
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            found: true,
            ..Self::default()
        }
    }

    /// An image that does not exist in the store
    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            found: false,
            ..Self::default()
        }
    }

    /// Diff IDs of appended layers, in order
    pub fn layer_digests(&self) -> &[String] {
        &self.layers
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }
}

#[async_trait]
impl Image for DryRunImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn found(&self) -> StrataResult<bool> {
        Ok(self.found)
    }

    async fn label(&self, key: &str) -> StrataResult<String> {
        Ok(self.labels.get(key).cloned().unwrap_or_default())
    }

    async fn env(&self, key: &str) -> StrataResult<Option<String>> {
        Ok(self.env.get(key).cloned())
    }

    async fn entrypoint(&self) -> StrataResult<Vec<String>> {
        Ok(self.entrypoint.clone())
    }

    async fn cmd(&self) -> StrataResult<Vec<String>> {
        Ok(self.cmd.clone())
    }

    async fn digest(&self) -> StrataResult<String> {
        Ok(self.digest.clone())
    }

    async fn top_layer(&self) -> StrataResult<String> {
        Ok(self.top_layer.clone())
    }

    async fn layer_by_digest(&self, diff_id: &str) -> StrataResult<ImageLayer> {
        Err(StrataError::LayerNotFound {
            image: self.name.clone(),
            digest: diff_id.to_string(),
        })
    }

    async fn add_layer(&mut self, tar_path: &Path) -> StrataResult<()> {
        // digest-named tars carry their identity in the file name
        let stem = tar_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                StrataError::image_store("add layer", format!("bad tar path {tar_path:?}"))
            })?;
        self.layers.push(format!("sha256:{stem}"));
        Ok(())
    }

    async fn reuse_layer(&mut self, layer: ImageLayer) -> StrataResult<()> {
        self.layers.push(layer.diff_id);
        Ok(())
    }

    async fn set_label(&mut self, key: &str, value: &str) -> StrataResult<()> {
        self.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_env(&mut self, key: &str, value: &str) -> StrataResult<()> {
        self.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_entrypoint(&mut self, entrypoint: &[String]) -> StrataResult<()> {
        self.entrypoint = entrypoint.to_vec();
        Ok(())
    }

    async fn set_cmd(&mut self, cmd: &[String]) -> StrataResult<()> {
        self.cmd = cmd.to_vec();
        Ok(())
    }

    async fn save(&mut self) -> StrataResult<String> {
        let mut hasher = Sha256::new();
        for layer in &self.layers {
            hasher.update(layer.as_bytes());
        }
        let mut labels: Vec<(&String, &String)> = self.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        self.saved = true;
        self.digest = format!("sha256:{}", hex::encode(hasher.finalize()));
        Ok(self.digest.clone())
    }
}

/// Where dry-run artifacts land when the caller does not pick a spot
pub fn default_artifacts_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("strata")
        .join("artifacts")
}
