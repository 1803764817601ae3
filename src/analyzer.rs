//! Cache reconciliation
//!
//! Before a build runs, the analyzer compares the on-disk layer cache
//! against the previous image's metadata and decides, per layer, what
//! survives: stale launch layers are deleted, valid ones are kept, and
//! layers whose content can be reused straight from the previous image
//! get their config document rewritten so the exporter can satisfy them
//! without a local copy.
//!
//! Classification is a pure function of the scanned state
//! ([`classify_cache`] / [`classify_layer`]); filesystem effects are
//! applied afterwards from the resulting plan.

use crate::error::{StrataError, StrataResult};
use crate::group::Buildpack;
use crate::image::Image;
use crate::metadata::{
    digests_match, read_image_metadata, read_sidecar, AppImageMetadata, BuildpackMetadata,
    LayerConfig, LayerMetadata,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reconciles cached layers against a previous image's metadata
#[derive(Debug)]
pub struct Analyzer {
    /// Active build group; buildpacks outside it lose their cache
    pub buildpacks: Vec<Buildpack>,
    /// Application directory (never pruned, even under the layers root)
    pub app_dir: PathBuf,
    /// Root of the on-disk layer cache
    pub layers_dir: PathBuf,
}

/// What the analyzer found on disk for one layer
#[derive(Debug, Clone, Default)]
pub struct CachedLayer {
    /// Parsed config document; `None` when absent or unparsable
    pub config: Option<LayerConfig>,
    /// Sidecar digest of the last exported content, raw form
    pub digest: Option<String>,
    /// Whether a local content directory exists
    pub has_content: bool,
}

/// Validity of a cached layer's content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Nothing cached, or no digest recorded: new layer, no action
    NoCache,
    /// Not a launch layer; validity is undecidable, leave untouched
    NonLaunch,
    /// Launch layer with no entry in current metadata: delete
    StaleNoMetadata,
    /// Launch layer whose digest diverged from metadata: delete
    StaleWrongSha,
    /// Digest matches metadata: keep
    Valid,
}

/// What to do about a layer's config document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerClass {
    /// No config document on disk; nothing actionable
    NoConfig,
    /// Config present but current metadata has no entry (build layer)
    NoMetadataBuild,
    /// Config present but current metadata has no entry (launch layer)
    NoMetadataLaunch,
    /// Recorded digest differs from metadata; rebuild happens later
    OutdatedBuild,
    /// Recorded digest differs from metadata; rebuild happens later
    OutdatedLaunch,
    /// Digest matches but content is absent: rewrite the config so the
    /// exporter can satisfy the layer purely by reuse
    RestoreConfig,
    /// Digest matches and content is present: no action
    UpToDate,
}

/// Per-layer reconciliation decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlan {
    pub name: String,
    pub cache: CacheClass,
    pub layer: LayerClass,
}

/// Classify a cached layer's content validity.
///
/// Pure in (previous digest, recorded digest, presence, flags) so the
/// reuse decision is unit-testable without a filesystem.
pub fn classify_cache(meta: Option<&LayerMetadata>, cached: Option<&CachedLayer>) -> CacheClass {
    let Some(cached) = cached else {
        return CacheClass::NoCache;
    };
    let Some(config) = &cached.config else {
        return CacheClass::NoCache;
    };
    let Some(digest) = &cached.digest else {
        return CacheClass::NoCache;
    };
    if !config.launch {
        return CacheClass::NonLaunch;
    }
    let Some(meta) = meta else {
        return CacheClass::StaleNoMetadata;
    };
    if !digests_match(&meta.sha, digest) {
        return CacheClass::StaleWrongSha;
    }
    CacheClass::Valid
}

/// Classify a layer's config document against current metadata
pub fn classify_layer(meta: Option<&LayerMetadata>, cached: Option<&CachedLayer>) -> LayerClass {
    let Some(cached) = cached else {
        return LayerClass::NoConfig;
    };
    let Some(config) = &cached.config else {
        return LayerClass::NoConfig;
    };
    let Some(meta) = meta else {
        return if config.launch {
            LayerClass::NoMetadataLaunch
        } else {
            LayerClass::NoMetadataBuild
        };
    };
    if let Some(digest) = &cached.digest {
        if !digests_match(&meta.sha, digest) {
            return if meta.build {
                LayerClass::OutdatedBuild
            } else {
                LayerClass::OutdatedLaunch
            };
        }
    }
    if !cached.has_content {
        return LayerClass::RestoreConfig;
    }
    LayerClass::UpToDate
}

/// Build the reconciliation plan for one buildpack: every layer in
/// current metadata or with on-disk state gets a decision.
pub fn plan_buildpack(
    meta: Option<&BuildpackMetadata>,
    cached: &BTreeMap<String, CachedLayer>,
) -> Vec<LayerPlan> {
    let mut names: BTreeSet<&str> = cached.keys().map(String::as_str).collect();
    if let Some(meta) = meta {
        names.extend(meta.layers.keys().map(String::as_str));
    }

    names
        .into_iter()
        .map(|name| {
            let layer_meta = meta.and_then(|m| m.layers.get(name));
            let cached_layer = cached.get(name);
            LayerPlan {
                name: name.to_string(),
                cache: classify_cache(layer_meta, cached_layer),
                layer: classify_layer(layer_meta, cached_layer),
            }
        })
        .collect()
}

impl Analyzer {
    /// Reconcile against the previous image's metadata label.
    ///
    /// A missing, inaccessible or unlabeled previous image is a
    /// warning; reconciliation proceeds from empty metadata.
    pub async fn analyze(&self, previous: &dyn Image) -> StrataResult<()> {
        let metadata = read_image_metadata(previous).await;
        self.reconcile(&metadata).await
    }

    /// Reconcile the on-disk cache against explicit metadata
    pub async fn reconcile(&self, metadata: &AppImageMetadata) -> StrataResult<()> {
        self.prune_unknown_buildpacks().await?;

        for buildpack in &self.buildpacks {
            let dir = self.layers_dir.join(buildpack.escaped_id());
            let cached = scan_layers(&dir).await?;
            let bp_meta = metadata.buildpack(&buildpack.id);
            let plan = plan_buildpack(bp_meta, &cached);
            self.apply(buildpack, bp_meta, &dir, &plan).await?;
        }
        Ok(())
    }

    /// Delete cached state of every buildpack outside the build group.
    ///
    /// The application directory is left alone even when it lives under
    /// the layers root.
    async fn prune_unknown_buildpacks(&self) -> StrataResult<()> {
        let group: HashSet<String> = self.buildpacks.iter().map(|b| b.escaped_id()).collect();
        let app_dir = tokio::fs::canonicalize(&self.app_dir).await.ok();

        let mut entries = match tokio::fs::read_dir(&self.layers_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StrataError::io(
                    format!("reading layers dir {}", self.layers_dir.display()),
                    e,
                ));
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StrataError::io("listing cached buildpacks", e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StrataError::io("inspecting cached buildpack dir", e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if group.contains(&name) {
                continue;
            }
            if app_dir.is_some() && tokio::fs::canonicalize(entry.path()).await.ok() == app_dir {
                continue;
            }

            info!("removing cached layers for buildpack '{}' not in group", name);
            remove_ignoring_absent(&entry.path(), &name).await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        buildpack: &Buildpack,
        bp_meta: Option<&BuildpackMetadata>,
        dir: &Path,
        plan: &[LayerPlan],
    ) -> StrataResult<()> {
        for decision in plan {
            let full_name = format!("{}/{}", buildpack.id, decision.name);

            match decision.cache {
                CacheClass::StaleNoMetadata => {
                    info!("removing stale cached layer '{}', not in metadata", full_name);
                    self.remove_layer(dir, &decision.name, &full_name).await?;
                }
                CacheClass::StaleWrongSha => {
                    info!("removing stale cached launch layer '{}'", full_name);
                    self.remove_layer(dir, &decision.name, &full_name).await?;
                }
                CacheClass::NonLaunch => debug!("using cached layer '{}'", full_name),
                CacheClass::Valid => debug!("using cached launch layer '{}'", full_name),
                CacheClass::NoCache => {}
            }

            match decision.layer {
                LayerClass::RestoreConfig => {
                    let Some(layer_meta) = bp_meta.and_then(|m| m.layers.get(&decision.name))
                    else {
                        warn!("metadata unavailable for layer '{}'", full_name);
                        continue;
                    };
                    info!("writing layer config for '{}'", full_name);
                    self.write_config(dir, &decision.name, layer_meta).await?;
                }
                LayerClass::NoMetadataBuild => {
                    debug!("no metadata for build layer '{}'", full_name)
                }
                LayerClass::NoMetadataLaunch => {
                    debug!("no metadata for launch layer '{}'", full_name)
                }
                LayerClass::OutdatedBuild => {
                    debug!("build layer '{}' is outdated", full_name)
                }
                LayerClass::OutdatedLaunch => {
                    debug!("launch layer '{}' is outdated", full_name)
                }
                LayerClass::NoConfig | LayerClass::UpToDate => {}
            }
        }
        Ok(())
    }

    /// Remove a layer's content directory, sidecar and config document.
    /// Already-absent pieces are fine; any other removal failure aborts
    /// the reconciliation.
    async fn remove_layer(&self, dir: &Path, name: &str, full_name: &str) -> StrataResult<()> {
        remove_ignoring_absent(&dir.join(name), full_name).await?;

        for ext in ["sha", "toml"] {
            let path = dir.join(format!("{name}.{ext}"));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StrataError::LayerRemove {
                        layer: full_name.to_string(),
                        source: e,
                    });
                }
            }
        }
        Ok(())
    }

    async fn write_config(
        &self,
        dir: &Path,
        name: &str,
        layer_meta: &LayerMetadata,
    ) -> StrataResult<()> {
        let content = layer_meta.config().to_toml()?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StrataError::io(format!("creating {}", dir.display()), e))?;
        let path = dir.join(format!("{name}.toml"));
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| StrataError::io(format!("writing {}", path.display()), e))
    }
}

async fn remove_ignoring_absent(path: &Path, layer: &str) -> StrataResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::LayerRemove {
            layer: layer.to_string(),
            source: e,
        }),
    }
}

/// Scan a buildpack's cache directory: every `<layer>.toml` (except the
/// group-level `launch.toml`) names a layer; its sidecar and content
/// directory are picked up alongside. An unparsable config document
/// degrades that one layer to no-cache.
async fn scan_layers(dir: &Path) -> StrataResult<BTreeMap<String, CachedLayer>> {
    let mut layers = BTreeMap::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(layers),
        Err(e) => {
            return Err(StrataError::io(
                format!("reading buildpack dir {}", dir.display()),
                e,
            ));
        }
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StrataError::io("listing cached layers", e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if name == "launch" {
            continue;
        }

        let config = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match LayerConfig::parse(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("ignoring unreadable layer config {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("ignoring unreadable layer config {}: {}", path.display(), e);
                None
            }
        };

        let digest = read_sidecar(dir, name).await;
        let has_content = tokio::fs::metadata(dir.join(name))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

        layers.insert(
            name.to_string(),
            CachedLayer {
                config,
                digest,
                has_content,
            },
        );
    }
    Ok(layers)
}
