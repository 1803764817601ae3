//! Export composition scenarios

use crate::fakes::FakeImage;
use std::path::{Path, PathBuf};
use strata::archive::Chown;
use strata::exporter::{ExportReport, Exporter};
use strata::group::Buildpack;
use strata::metadata::{AppImageMetadata, ENV_APP_DIR, ENV_LAYERS_DIR, METADATA_LABEL};

fn exporter(artifacts: &Path, ids: &[&str]) -> Exporter {
    Exporter {
        buildpacks: ids
            .iter()
            .map(|id| Buildpack {
                id: id.to_string(),
                version: "0.1.0".to_string(),
            })
            .collect(),
        artifacts_dir: artifacts.to_path_buf(),
        chown: Some(Chown {
            uid: 1234,
            gid: 4321,
        }),
    }
}

/// Minimal exportable tree: an app dir, a config dir, and one
/// buildpack with a single layer
async fn setup_tree(tmp: &Path) -> (PathBuf, PathBuf) {
    let layers = tmp.join("layers");
    let app = tmp.join("app");

    tokio::fs::create_dir_all(&app).await.unwrap();
    tokio::fs::write(app.join(".hidden.txt"), "some-hidden-text\n")
        .await
        .unwrap();

    let config = layers.join("config");
    tokio::fs::create_dir_all(&config).await.unwrap();
    tokio::fs::write(
        config.join("metadata.toml"),
        "[[processes]]\ntype = \"web\"\ncommand = \"npm start\"\n",
    )
    .await
    .unwrap();

    let bp = layers.join("bp");
    tokio::fs::create_dir_all(bp.join("layer1")).await.unwrap();
    tokio::fs::write(bp.join("layer1/file-from-layer-1"), "text from layer 1\n")
        .await
        .unwrap();
    tokio::fs::write(bp.join("layer1.toml"), "launch = true\nsomekey = \"someval\"\n")
        .await
        .unwrap();

    (layers, app)
}

fn names(layers: &[strata::exporter::ExportedLayer]) -> Vec<&str> {
    layers.iter().map(|l| l.name.as_str()).collect()
}

fn parsed_label(image: &FakeImage) -> AppImageMetadata {
    serde_json::from_str(image.labels.get(METADATA_LABEL).unwrap()).unwrap()
}

async fn export_fresh(
    layers: &Path,
    app: &Path,
    artifacts: &Path,
    image: &mut FakeImage,
) -> ExportReport {
    let previous = FakeImage::not_found("app/image");
    exporter(artifacts, &["bp"])
        .export(layers, app, None, image, &previous)
        .await
        .unwrap()
}

#[tokio::test]
async fn fresh_export_adds_every_layer() {
    // no previous image: app, config and the buildpack layer are all new
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    let artifacts = tmp.path().join("artifacts");

    let mut image = FakeImage::new("app/image");
    let report = export_fresh(&layers, &app, &artifacts, &mut image).await;

    assert_eq!(names(&report.added), ["app", "config", "bp/layer1"]);
    assert!(report.reused.is_empty());
    assert_eq!(image.num_layers(), 3);
    assert!(image.saved);
    assert_eq!(report.image_digest, "sha256:saved-image-digest");

    // every added layer has its tarball staged under its digest
    for layer in &report.added {
        let tar = artifacts.join(format!(
            "{}.tar",
            strata::metadata::raw_digest(&layer.digest)
        ));
        assert!(tar.is_file(), "missing {}", tar.display());
    }
}

#[tokio::test]
async fn label_records_digests_and_run_image() {
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;

    let mut image = FakeImage::new("app/image");
    let report = export_fresh(&layers, &app, &tmp.path().join("artifacts"), &mut image).await;

    let metadata = parsed_label(&image);
    assert_eq!(metadata.app.sha, report.added[0].digest);
    assert_eq!(metadata.config.sha, report.added[1].digest);
    assert_eq!(metadata.run_image.top_layer, "sha256:run-top-layer");
    assert_eq!(metadata.run_image.sha, "sha256:run-image-digest");

    let layer = metadata.layer("bp", "layer1").unwrap();
    assert_eq!(layer.sha, report.added[2].digest);
    assert!(layer.launch);
    assert_eq!(layer.data.get("somekey").unwrap(), "someval");
}

#[tokio::test]
async fn env_entries_point_at_disk_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;

    let mut image = FakeImage::new("app/image");
    export_fresh(&layers, &app, &tmp.path().join("artifacts"), &mut image).await;

    assert_eq!(
        image.env.get(ENV_LAYERS_DIR).unwrap(),
        &layers.display().to_string()
    );
    assert_eq!(
        image.env.get(ENV_APP_DIR).unwrap(),
        &app.display().to_string()
    );
    // inherited command is always cleared
    assert_eq!(image.cmd, Vec::<String>::new());
    assert!(image.entrypoint.is_empty());
}

#[tokio::test]
async fn launcher_layer_becomes_entrypoint() {
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    let launcher = tmp.path().join("launcher");
    tokio::fs::write(&launcher, "some-launcher").await.unwrap();

    let mut image = FakeImage::new("app/image");
    let previous = FakeImage::not_found("app/image");
    let report = exporter(&tmp.path().join("artifacts"), &["bp"])
        .export(&layers, &app, Some(&launcher), &mut image, &previous)
        .await
        .unwrap();

    assert_eq!(names(&report.added), ["app", "config", "launcher", "bp/layer1"]);
    assert_eq!(image.entrypoint, [launcher.display().to_string()]);
    assert_eq!(image.cmd, Vec::<String>::new());

    let metadata = parsed_label(&image);
    assert!(metadata.launcher.sha.starts_with("sha256:"));
}

#[tokio::test]
async fn unchanged_layers_are_reused() {
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    let artifacts = tmp.path().join("artifacts");

    // first build: everything fresh
    let mut first = FakeImage::new("app/image");
    let report = export_fresh(&layers, &app, &artifacts, &mut first).await;

    // previous image now carries the label and can serve every blob
    let mut previous = FakeImage::new("app/image")
        .with_label(METADATA_LABEL, first.labels.get(METADATA_LABEL).unwrap());
    for layer in &report.added {
        previous = previous.with_blob(&layer.digest);
    }

    let mut second = FakeImage::new("app/image");
    let report = exporter(&artifacts, &["bp"])
        .export(&layers, &app, None, &mut second, &previous)
        .await
        .unwrap();

    assert!(report.added.is_empty());
    assert_eq!(names(&report.reused), ["app", "config", "bp/layer1"]);
    assert!(second.added.is_empty());
    assert_eq!(second.num_layers(), 3);
}

#[tokio::test]
async fn changed_app_is_rebuilt_rest_reused() {
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    let artifacts = tmp.path().join("artifacts");

    let mut first = FakeImage::new("app/image");
    let report = export_fresh(&layers, &app, &artifacts, &mut first).await;

    let mut previous = FakeImage::new("app/image")
        .with_label(METADATA_LABEL, first.labels.get(METADATA_LABEL).unwrap());
    for layer in &report.added {
        previous = previous.with_blob(&layer.digest);
    }

    tokio::fs::write(app.join(".hidden.txt"), "changed\n")
        .await
        .unwrap();

    let mut second = FakeImage::new("app/image");
    let report = exporter(&artifacts, &["bp"])
        .export(&layers, &app, None, &mut second, &previous)
        .await
        .unwrap();

    // the partition is exact: changed layers added, the rest reused
    assert_eq!(names(&report.added), ["app"]);
    assert_eq!(names(&report.reused), ["config", "bp/layer1"]);
    assert_eq!(second.num_layers(), 3);
}

#[tokio::test]
async fn config_only_layer_resolves_by_pure_reuse() {
    // the reconciler leaves launch layers as a bare config document
    // when their content lives in the previous image
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    tokio::fs::write(layers.join("bp/layer2.toml"), "launch = true\n")
        .await
        .unwrap();

    let previous = FakeImage::new("app/image")
        .with_label(
            METADATA_LABEL,
            r#"{"buildpacks":[{"key":"bp","layers":{"layer2":{"sha":"sha256:l2digest","launch":true}}}]}"#,
        )
        .with_blob("sha256:l2digest");

    let mut image = FakeImage::new("app/image");
    let report = exporter(&tmp.path().join("artifacts"), &["bp"])
        .export(&layers, &app, None, &mut image, &previous)
        .await
        .unwrap();

    assert!(names(&report.reused).contains(&"bp/layer2"));
    assert_eq!(image.reused, ["sha256:l2digest"]);

    let metadata = parsed_label(&image);
    assert_eq!(metadata.layer("bp", "layer2").unwrap().sha, "sha256:l2digest");
}

#[tokio::test]
async fn pure_reuse_without_metadata_fails_before_save() {
    // Scenario: previous image exists but its label has no entry for a
    // layer that only exists as a config document
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    tokio::fs::write(layers.join("bp/layer3.toml"), "launch = true\n")
        .await
        .unwrap();

    let previous = FakeImage::new("app/image")
        .with_label(METADATA_LABEL, r#"{"buildpacks":[{"key":"bp","layers":{}}]}"#);

    let mut image = FakeImage::new("app/image");
    let err = exporter(&tmp.path().join("artifacts"), &["bp"])
        .export(&layers, &app, None, &mut image, &previous)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("bp"), "unexpected error: {message}");
    assert!(message.contains("layer3"), "unexpected error: {message}");
    assert!(!image.saved);
}

#[tokio::test]
async fn pure_reuse_with_missing_blob_fails_before_save() {
    // label and image content diverged: the digest is recorded but the
    // blob cannot be located
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    tokio::fs::write(layers.join("bp/layer2.toml"), "launch = true\n")
        .await
        .unwrap();

    let previous = FakeImage::new("app/image").with_label(
        METADATA_LABEL,
        r#"{"buildpacks":[{"key":"bp","layers":{"layer2":{"sha":"sha256:l2digest","launch":true}}}]}"#,
    );

    let mut image = FakeImage::new("app/image");
    let err = exporter(&tmp.path().join("artifacts"), &["bp"])
        .export(&layers, &app, None, &mut image, &previous)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("sha256:l2digest"));
    assert!(!image.saved);
}

#[tokio::test]
async fn stray_directories_are_purged_before_composition() {
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;
    tokio::fs::create_dir_all(layers.join("nonbuildpackdir"))
        .await
        .unwrap();
    tokio::fs::create_dir_all(layers.join("app")).await.unwrap();

    let mut image = FakeImage::new("app/image");
    export_fresh(&layers, &app, &tmp.path().join("artifacts"), &mut image).await;

    assert!(!layers.join("nonbuildpackdir").exists());
    // app/config/launcher and group members are never purged
    assert!(layers.join("app").exists());
    assert!(layers.join("config").exists());
    assert!(layers.join("bp").exists());
}

#[tokio::test]
async fn sidecar_records_exported_digest_unprefixed() {
    let tmp = tempfile::tempdir().unwrap();
    let (layers, app) = setup_tree(tmp.path()).await;

    let mut image = FakeImage::new("app/image");
    let report = export_fresh(&layers, &app, &tmp.path().join("artifacts"), &mut image).await;

    let sidecar = tokio::fs::read_to_string(layers.join("bp/layer1.sha"))
        .await
        .unwrap();
    let layer1 = report
        .added
        .iter()
        .find(|l| l.name == "bp/layer1")
        .unwrap();
    assert_eq!(sidecar, strata::metadata::raw_digest(&layer1.digest));
    assert!(!sidecar.starts_with("sha256:"));
}
