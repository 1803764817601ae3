//! CLI argument definitions and command dispatch
//!
//! Two subcommands mirror the two build phases: `analyze` reconciles
//! the on-disk layer cache before a build, `export` composes the
//! layers afterwards. Export runs against the dry-run store; wiring a
//! registry or daemon store happens in embedding tools, not here.

use crate::analyzer::Analyzer;
use crate::archive::Chown;
use crate::error::{StrataError, StrataResult};
use crate::exporter::Exporter;
use crate::group::BuildpackGroup;
use crate::image::{default_artifacts_dir, DryRunImage, Image};
use crate::metadata::{AppImageMetadata, METADATA_LABEL};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;

/// strata - layer-aware container image export
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile cached layers against previous image metadata
    Analyze(AnalyzeArgs),

    /// Compose the output image from on-disk layers
    Export(ExportArgs),
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Root of the on-disk layer cache
    #[arg(long)]
    pub layers: PathBuf,

    /// Application directory
    #[arg(long)]
    pub app: PathBuf,

    /// Buildpack group file (group.toml)
    #[arg(long)]
    pub group: PathBuf,

    /// Previous image metadata as a JSON file; omit to start clean
    #[arg(long)]
    pub metadata: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Name for the composed image
    pub image: String,

    /// Root of the on-disk layer cache
    #[arg(long)]
    pub layers: PathBuf,

    /// Application directory
    #[arg(long)]
    pub app: PathBuf,

    /// Buildpack group file (group.toml)
    #[arg(long)]
    pub group: PathBuf,

    /// Launch orchestrator binary to layer in and set as entrypoint
    #[arg(long)]
    pub launcher: Option<PathBuf>,

    /// Directory for digest-named layer tarballs and metadata.json
    #[arg(long)]
    pub artifacts: Option<PathBuf>,

    /// Numeric owner stamped on layer contents (requires --gid)
    #[arg(long, requires = "gid")]
    pub uid: Option<u32>,

    /// Numeric group stamped on layer contents (requires --uid)
    #[arg(long, requires = "uid")]
    pub gid: Option<u32>,
}

/// Run cache reconciliation
pub async fn analyze(args: AnalyzeArgs) -> StrataResult<()> {
    let group = BuildpackGroup::from_file(&args.group).await?;

    let metadata = match &args.metadata {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("ignoring incompatible metadata {}: {}", path.display(), e);
                    AppImageMetadata::default()
                }
            },
            Err(e) => {
                warn!("ignoring unreadable metadata {}: {}", path.display(), e);
                AppImageMetadata::default()
            }
        },
        None => AppImageMetadata::default(),
    };

    let analyzer = Analyzer {
        buildpacks: group.buildpacks,
        app_dir: args.app,
        layers_dir: args.layers,
    };
    analyzer.reconcile(&metadata).await
}

/// Run a dry-run export into the artifacts directory
pub async fn export(args: ExportArgs) -> StrataResult<()> {
    let group = BuildpackGroup::from_file(&args.group).await?;
    let artifacts_dir = args.artifacts.unwrap_or_else(default_artifacts_dir);

    let chown = match (args.uid, args.gid) {
        (Some(uid), Some(gid)) => Some(Chown { uid, gid }),
        _ => None,
    };

    let exporter = Exporter {
        buildpacks: group.buildpacks,
        artifacts_dir: artifacts_dir.clone(),
        chown,
    };

    let mut image = DryRunImage::new(args.image.as_str());
    let previous = DryRunImage::not_found(args.image.as_str());

    let report = exporter
        .export(
            &args.layers,
            &args.app,
            args.launcher.as_deref(),
            &mut image,
            &previous,
        )
        .await?;

    // the label is the provenance record; keep a copy with the tars
    let label = image.label(METADATA_LABEL).await?;
    let metadata_path = artifacts_dir.join("metadata.json");
    tokio::fs::write(&metadata_path, label)
        .await
        .map_err(|e| StrataError::io(format!("writing {}", metadata_path.display()), e))?;

    println!(
        "Exported {} layers ({} added, {} reused) into {}",
        report.added.len() + report.reused.len(),
        report.added.len(),
        report.reused.len(),
        artifacts_dir.display(),
    );
    println!("Image: {}@{}", args.image, report.image_digest);
    Ok(())
}
