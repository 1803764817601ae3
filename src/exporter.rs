//! Image export
//!
//! Assembles the output image on top of a supplied base image: the
//! application tree, the build config, the launch orchestrator, then
//! one filesystem layer per buildpack layer. Every logical layer is
//! either reused from the previous image (when its content digest is
//! unchanged) or packaged fresh; identical content is never re-uploaded.
//!
//! Nothing is durable until the store's `save` succeeds, so a failed
//! export leaves no partial image behind.

use crate::archive::{self, Chown, PackagedLayer};
use crate::error::{StrataError, StrataResult};
use crate::group::Buildpack;
use crate::image::Image;
use crate::metadata::{
    digests_match, raw_digest, read_image_metadata, AppImageMetadata, BuildpackMetadata,
    LayerConfig, RunImageMetadata, ENV_APP_DIR, ENV_LAYERS_DIR, METADATA_LABEL,
};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Composes the output image from on-disk layers and a previous image
#[derive(Debug)]
pub struct Exporter {
    /// Build group, in composition order
    pub buildpacks: Vec<Buildpack>,
    /// Where digest-named layer tarballs are staged
    pub artifacts_dir: PathBuf,
    /// Numeric ownership stamped on packaged layers
    pub chown: Option<Chown>,
}

/// One layer of the output image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedLayer {
    pub name: String,
    pub digest: String,
}

/// Outcome of an export: the saved image digest and the exact
/// partition of output layers into reused and freshly added.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub image_digest: String,
    pub added: Vec<ExportedLayer>,
    pub reused: Vec<ExportedLayer>,
}

impl Exporter {
    /// Export the image.
    ///
    /// `image` is the base (run) image, mutated in place into the
    /// output; `previous` is the prior build of this app, consulted for
    /// reusable blobs. `launcher`, when given, is layered as a single
    /// file and becomes the entrypoint.
    pub async fn export(
        &self,
        layers_dir: &Path,
        app_dir: &Path,
        launcher: Option<&Path>,
        image: &mut dyn Image,
        previous: &dyn Image,
    ) -> StrataResult<ExportReport> {
        self.cleanup_layers_dir(layers_dir).await?;

        // base image identity, captured before any mutation
        let run_image = RunImageMetadata {
            top_layer: image.top_layer().await?,
            sha: image.digest().await?,
        };

        let prev_metadata = read_image_metadata(previous).await;

        let mut report = ExportReport::default();
        let mut metadata = AppImageMetadata {
            run_image,
            ..AppImageMetadata::default()
        };

        let packaged = self
            .package_dir(app_dir, app_dir)
            .await
            .map_err(|e| StrataError::export_layer("app", e))?;
        metadata.app.sha = packaged.digest.clone();
        self.add_or_reuse(
            image,
            previous,
            "app",
            &packaged,
            &prev_metadata.app.sha,
            &mut report,
        )
        .await?;

        let config_dir = layers_dir.join("config");
        let packaged = self
            .package_dir(&config_dir, &config_dir)
            .await
            .map_err(|e| StrataError::export_layer("config", e))?;
        metadata.config.sha = packaged.digest.clone();
        self.add_or_reuse(
            image,
            previous,
            "config",
            &packaged,
            &prev_metadata.config.sha,
            &mut report,
        )
        .await?;

        if let Some(launcher_path) = launcher {
            let packaged = self
                .package_file(launcher_path, launcher_path)
                .await
                .map_err(|e| StrataError::export_layer("launcher", e))?;
            metadata.launcher.sha = packaged.digest.clone();
            self.add_or_reuse(
                image,
                previous,
                "launcher",
                &packaged,
                &prev_metadata.launcher.sha,
                &mut report,
            )
            .await?;
        }

        for buildpack in &self.buildpacks {
            let bp_metadata = self
                .export_buildpack(
                    buildpack,
                    layers_dir,
                    image,
                    previous,
                    &prev_metadata,
                    &mut report,
                )
                .await?;
            metadata.buildpacks.push(bp_metadata);
        }

        let label = serde_json::to_string(&metadata)?;
        image.set_label(METADATA_LABEL, &label).await?;
        image
            .set_env(ENV_LAYERS_DIR, &layers_dir.display().to_string())
            .await?;
        image
            .set_env(ENV_APP_DIR, &app_dir.display().to_string())
            .await?;
        if let Some(launcher_path) = launcher {
            image
                .set_entrypoint(&[launcher_path.display().to_string()])
                .await?;
        }
        image.set_cmd(&[]).await?;

        report.image_digest = image.save().await?;
        info!("Image: {}@{}", image.name(), report.image_digest);
        Ok(report)
    }

    /// Export one buildpack: every layer with a config document becomes
    /// an image layer, packaged from its content directory or reused
    /// from the previous image when no local copy exists.
    async fn export_buildpack(
        &self,
        buildpack: &Buildpack,
        layers_dir: &Path,
        image: &mut dyn Image,
        previous: &dyn Image,
        prev_metadata: &AppImageMetadata,
        report: &mut ExportReport,
    ) -> StrataResult<BuildpackMetadata> {
        let mut bp_metadata = BuildpackMetadata {
            id: buildpack.id.clone(),
            version: buildpack.version.clone(),
            ..BuildpackMetadata::default()
        };

        let dir = layers_dir.join(buildpack.escaped_id());
        for (name, config) in scan_layer_configs(&dir).await? {
            let full_name = format!("{}/{}", buildpack.id, name);
            let content_dir = dir.join(&name);

            let digest = if content_dir.is_dir() {
                let packaged = self
                    .package_dir(&content_dir, &content_dir)
                    .await
                    .map_err(|e| StrataError::export_layer(full_name.clone(), e))?;
                let prev_sha = prev_metadata
                    .layer(&buildpack.id, &name)
                    .map(|l| l.sha.as_str())
                    .unwrap_or("");
                self.add_or_reuse(image, previous, &full_name, &packaged, prev_sha, report)
                    .await?;
                self.write_sidecar(&dir, &name, &packaged.digest).await?;
                packaged.digest
            } else {
                // no local copy: the reconciler left this layer for
                // pure reuse, so the previous image must have it
                self.reuse_from_previous(image, previous, buildpack, &name, prev_metadata, report)
                    .await?
            };

            bp_metadata.layers.insert(name, config.into_metadata(digest));
        }
        Ok(bp_metadata)
    }

    /// Append the layer, reusing the previous image's blob when the
    /// digest is unchanged
    async fn add_or_reuse(
        &self,
        image: &mut dyn Image,
        previous: &dyn Image,
        name: &str,
        packaged: &PackagedLayer,
        previous_digest: &str,
        report: &mut ExportReport,
    ) -> StrataResult<()> {
        if digests_match(previous_digest, &packaged.digest) {
            let layer = previous
                .layer_by_digest(&packaged.digest)
                .await
                .map_err(|e| StrataError::ReuseMissingBlob {
                    layer: name.to_string(),
                    digest: packaged.digest.clone(),
                    source: Box::new(e),
                })?;
            image.reuse_layer(layer).await?;
            info!("reusing layer '{}' with digest '{}'", name, packaged.digest);
            report.reused.push(ExportedLayer {
                name: name.to_string(),
                digest: packaged.digest.clone(),
            });
        } else {
            image.add_layer(&packaged.tar_path).await?;
            info!("adding layer '{}' with digest '{}'", name, packaged.digest);
            report.added.push(ExportedLayer {
                name: name.to_string(),
                digest: packaged.digest.clone(),
            });
        }
        Ok(())
    }

    /// Reuse a layer that has no local content at all. Failure here is
    /// unrecoverable: the content exists nowhere else.
    async fn reuse_from_previous(
        &self,
        image: &mut dyn Image,
        previous: &dyn Image,
        buildpack: &Buildpack,
        name: &str,
        prev_metadata: &AppImageMetadata,
        report: &mut ExportReport,
    ) -> StrataResult<String> {
        let Some(layer_meta) = prev_metadata.layer(&buildpack.id, name) else {
            return Err(StrataError::ReuseMissingMetadata {
                buildpack: buildpack.id.clone(),
                layer: name.to_string(),
            });
        };

        let full_name = format!("{}/{}", buildpack.id, name);
        let layer = previous
            .layer_by_digest(&layer_meta.sha)
            .await
            .map_err(|e| StrataError::ReuseMissingBlob {
                layer: full_name.clone(),
                digest: layer_meta.sha.clone(),
                source: Box::new(e),
            })?;
        image.reuse_layer(layer).await?;
        info!("reusing layer '{}' with digest '{}'", full_name, layer_meta.sha);
        report.reused.push(ExportedLayer {
            name: full_name,
            digest: layer_meta.sha.clone(),
        });
        Ok(layer_meta.sha.clone())
    }

    /// Purge directories under the layers root that belong to no
    /// current buildpack and are not the app/config/launcher trees.
    async fn cleanup_layers_dir(&self, layers_dir: &Path) -> StrataResult<()> {
        let keep: HashSet<String> = ["app", "config", "launcher"]
            .into_iter()
            .map(String::from)
            .chain(self.buildpacks.iter().map(|b| b.escaped_id()))
            .collect();

        let mut entries = match tokio::fs::read_dir(layers_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StrataError::io(
                    format!("reading layers dir {}", layers_dir.display()),
                    e,
                ));
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StrataError::io("listing layers dir", e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StrataError::io("inspecting layers dir entry", e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                continue;
            }
            debug!("removing unknown directory '{}' from layers root", name);
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StrataError::io(format!("removing layers dir '{name}'"), e));
                }
            }
        }
        Ok(())
    }

    /// Record the exported content digest next to the layer so the next
    /// build's reconciler can compare against it
    async fn write_sidecar(&self, dir: &Path, name: &str, digest: &str) -> StrataResult<()> {
        let path = dir.join(format!("{name}.sha"));
        tokio::fs::write(&path, raw_digest(digest))
            .await
            .map_err(|e| StrataError::io(format!("writing {}", path.display()), e))
    }

    async fn package_dir(&self, src: &Path, dest: &Path) -> StrataResult<PackagedLayer> {
        let artifacts = self.artifacts_dir.clone();
        let chown = self.chown;
        let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
        tokio::task::spawn_blocking(move || archive::package_dir(&artifacts, &src, &dest, chown))
            .await
            .map_err(|e| StrataError::Internal(format!("layer packaging task failed: {e}")))?
    }

    async fn package_file(&self, src: &Path, dest: &Path) -> StrataResult<PackagedLayer> {
        let artifacts = self.artifacts_dir.clone();
        let chown = self.chown;
        let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
        tokio::task::spawn_blocking(move || archive::package_file(&artifacts, &src, &dest, chown))
            .await
            .map_err(|e| StrataError::Internal(format!("layer packaging task failed: {e}")))?
    }
}

/// Layer config documents of a buildpack directory, in name order.
/// The buildpack's own `launch.toml` is not a layer. Unlike the
/// reconciler, the exporter cannot shrug off a broken document: the
/// layer is about to ship.
async fn scan_layer_configs(dir: &Path) -> StrataResult<BTreeMap<String, LayerConfig>> {
    let mut configs = BTreeMap::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(configs),
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
        .map_err(|e| StrataError::io("listing layer configs", e))?
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

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
        let config = LayerConfig::parse(&content).map_err(|e| StrataError::LayerConfigInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        configs.insert(name.to_string(), config);
    }
    Ok(configs)
}
