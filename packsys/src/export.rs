//! The export phase: assemble the final image from contributed layers,
//! launcher assets, and sliced app content, reusing layers from a previous
//! image by digest whenever possible.

use crate::api::ApiVersion;
use crate::buildpack::GroupEntry;
use crate::error::PhaseError;
use crate::launch::{LaunchMetadata, LAUNCHER_PATH, PROCESS_DIR};
use crate::layers::factory::{Layer, LayerFactory};
use crate::layers::{for_launch, read_buildpack_layers_dir};
use crate::metadata::{
    read_build_metadata, BuildMetadata, BuildpackLayersMetadata, LauncherMetadata, LayersMetadata,
    ProjectMetadata, StackMetadata, BUILD_METADATA_LABEL, DEPRECATION_MODE_QUIET,
    ENV_APP_DIR, ENV_DEPRECATION_MODE, ENV_LAYERS_DIR, ENV_PLATFORM_API, ENV_PROCESS_TYPE,
    LAYER_METADATA_LABEL, PROJECT_METADATA_LABEL,
};
use anyhow::{Context, Result};
use image_store::Image;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::instrument;

const PATH_LIST_SEPARATOR: &str = ":";

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub path: PathBuf,
    pub metadata: LauncherMetadata,
}

pub struct ExportOptions<'a> {
    pub layers_dir: PathBuf,
    pub app_dir: PathBuf,
    pub working_image: &'a mut dyn Image,
    pub run_image_ref: String,
    pub orig_metadata: LayersMetadata,
    pub additional_tags: Vec<String>,
    pub launcher_config: LauncherConfig,
    pub stack: StackMetadata,
    pub project: ProjectMetadata,
    pub default_process_type: Option<String>,
}

/// Written as `report.toml` once the image is saved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportReport {
    pub image: ImageReport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageReport {
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

pub struct Exporter {
    pub buildpacks: Vec<GroupEntry>,
    pub layer_factory: LayerFactory,
    pub platform_api: ApiVersion,
}

impl Exporter {
    #[instrument(level = "trace", skip_all, fields(image = %opts.working_image.name()))]
    pub async fn export(&self, mut opts: ExportOptions<'_>) -> Result<ExportReport> {
        opts.layers_dir = crate::common::fs::canonicalize(&opts.layers_dir)
            .await
            .context("layers dir absolute path")?;
        opts.app_dir = crate::common::fs::canonicalize(&opts.app_dir)
            .await
            .context("app dir absolute path")?;

        let mut meta = LayersMetadata {
            stack: opts.stack.clone(),
            ..Default::default()
        };
        // A fresh store may hold no run image yet; top layer is best-effort.
        meta.run_image.top_layer = opts.working_image.top_layer().unwrap_or_default();
        meta.run_image.reference = opts.run_image_ref.clone();

        let mut build_md = read_build_metadata(&opts.layers_dir).await?;

        self.add_buildpack_layers(&mut opts, &mut meta).await?;
        self.add_launcher_layers(&mut opts, &build_md, &mut meta)
            .await?;
        self.add_app_layers(&mut opts, &build_md, &mut meta)
            .await
            .context("exporting app layers")?;

        self.set_labels(&mut opts, &meta, &mut build_md)?;
        let launch_md = build_md.to_launch_metadata();
        self.set_env(&mut opts, &launch_md)?;

        let entrypoint = self
            .entrypoint(&launch_md, opts.default_process_type.as_deref())
            .context("determining entrypoint")?;
        opts.working_image.set_entrypoint(&entrypoint);
        // Command intentionally empty; the launcher owns process selection.
        opts.working_image.set_cmd(&[]);

        let saved = opts
            .working_image
            .save(&opts.additional_tags)
            .await
            .map_err(|source| PhaseError::ImageIo { source })
            .context("saving image")?;
        Ok(ExportReport {
            image: ImageReport {
                tags: saved.tags,
                image_id: saved.image_id,
                digest: saved.digest,
            },
        })
    }

    async fn add_buildpack_layers(
        &self,
        opts: &mut ExportOptions<'_>,
        meta: &mut LayersMetadata,
    ) -> Result<()> {
        for bp in &self.buildpacks {
            let bp_dir = read_buildpack_layers_dir(&opts.layers_dir, bp)
                .await
                .context(format!("reading layers for buildpack '{}'", bp.id))?;
            let mut bp_md = BuildpackLayersMetadata {
                id: bp.id.to_string(),
                version: bp.version.clone(),
                store: bp_dir.store.clone(),
                ..Default::default()
            };
            for layer in bp_dir.find_layers(for_launch).await {
                let layer_metadata = layer
                    .read()
                    .await
                    .context(format!("reading '{}' metadata", layer.identifier()))?;
                let previous_sha = opts.orig_metadata.layer_sha(bp.id.as_str(), &layer.name());

                let sha = if layer.has_local_contents() {
                    let materialized = self
                        .layer_factory
                        .dir_layer(layer.identifier(), layer.path())
                        .await
                        .context("creating layer")?;
                    self.add_or_reuse(opts.working_image, &materialized, previous_sha)
                        .await?
                } else {
                    if layer_metadata.cache {
                        anyhow::bail!(
                            "layer '{}' is cache=true but has no contents",
                            layer.identifier()
                        );
                    }
                    let previous_sha =
                        previous_sha.ok_or_else(|| PhaseError::ReuseMissingMetadata {
                            layer: layer.identifier().to_string(),
                        })?;
                    info!("Reusing layer '{}'", layer.identifier());
                    debug!("Layer '{}' SHA: {previous_sha}", layer.identifier());
                    opts.working_image
                        .reuse_layer(previous_sha)
                        .await
                        .map_err(|source| PhaseError::ImageIo { source })
                        .context(format!("reusing layer: '{}'", layer.identifier()))?;
                    previous_sha.to_string()
                };

                bp_md.layers.insert(
                    layer.name(),
                    crate::metadata::BuildpackLayerMetadata {
                        sha,
                        launch: layer_metadata.launch,
                        build: layer_metadata.build,
                        cache: layer_metadata.cache,
                        data: layer_metadata.metadata,
                    },
                );
            }
            meta.buildpacks.push(bp_md);

            let malformed = bp_dir.malformed_layers().await;
            if !malformed.is_empty() {
                let ids = malformed
                    .iter()
                    .map(|layer| layer.identifier().to_string())
                    .collect();
                return Err(PhaseError::MalformedLayer { ids }.into());
            }
        }
        Ok(())
    }

    async fn add_launcher_layers(
        &self,
        opts: &mut ExportOptions<'_>,
        build_md: &BuildMetadata,
        meta: &mut LayersMetadata,
    ) -> Result<()> {
        let launcher_layer = self
            .layer_factory
            .launcher_layer(&opts.launcher_config.path)
            .await
            .context("creating launcher layers")?;
        meta.launcher.sha = self
            .add_or_reuse(
                opts.working_image,
                &launcher_layer,
                as_opt(&opts.orig_metadata.launcher.sha),
            )
            .await
            .context("exporting launcher layer")?;

        let config_layer = self
            .layer_factory
            .dir_layer("config", &opts.layers_dir.join("config"))
            .await
            .context("creating layer 'config'")?;
        meta.config.sha = self
            .add_or_reuse(
                opts.working_image,
                &config_layer,
                as_opt(&opts.orig_metadata.config.sha),
            )
            .await
            .context("exporting config layer")?;

        if self.supports_multicall_launcher() && !build_md.processes.is_empty() {
            let process_types_layer = self
                .layer_factory
                .process_types_layer(&build_md.to_launch_metadata())
                .await
                .context("creating layer 'process-types'")?;
            meta.process_types.sha = self
                .add_or_reuse(
                    opts.working_image,
                    &process_types_layer,
                    as_opt(&opts.orig_metadata.process_types.sha),
                )
                .await
                .context("exporting layer 'process-types'")?;
        }
        Ok(())
    }

    async fn add_app_layers(
        &self,
        opts: &mut ExportOptions<'_>,
        build_md: &BuildMetadata,
        meta: &mut LayersMetadata,
    ) -> Result<()> {
        let slice_layers = self
            .layer_factory
            .slice_layers(&opts.app_dir, &build_md.slices)
            .await
            .context("creating app layers")?;

        let mut reused = 0;
        let total = slice_layers.len();
        for slice in slice_layers {
            let found = opts
                .orig_metadata
                .app
                .iter()
                .any(|previous| previous.sha == slice.digest);
            if found {
                reused += 1;
                opts.working_image
                    .reuse_layer(&slice.digest)
                    .await
                    .map_err(|source| PhaseError::ImageIo { source })
                    .context(format!("reusing layer: '{}'", slice.id))?;
            } else {
                opts.working_image
                    .add_layer_with_diff_id(&slice.tar_path, &slice.digest)
                    .await
                    .map_err(|source| PhaseError::ImageIo { source })
                    .context(format!("adding layer: '{}'", slice.id))?;
            }
            debug!("Layer '{}' SHA: {}", slice.id, slice.digest);
            meta.app.push(crate::metadata::LayerMetadata {
                sha: slice.digest.clone(),
            });
        }

        if reused > 0 {
            info!("Reusing {reused}/{total} app layer(s)");
        }
        if total - reused != 0 {
            info!("Adding {}/{} app layer(s)", total - reused, total);
        }
        Ok(())
    }

    fn set_labels(
        &self,
        opts: &mut ExportOptions<'_>,
        meta: &LayersMetadata,
        build_md: &mut BuildMetadata,
    ) -> Result<()> {
        let layers_json = serde_json::to_string(meta).context("marshall metadata")?;
        info!("Adding label '{LAYER_METADATA_LABEL}'");
        opts.working_image.set_label(LAYER_METADATA_LABEL, &layers_json);

        build_md.launcher = Some(opts.launcher_config.metadata.clone());
        let build_json = serde_json::to_string(build_md).context("marshall build metadata")?;
        info!("Adding label '{BUILD_METADATA_LABEL}'");
        opts.working_image.set_label(BUILD_METADATA_LABEL, &build_json);

        let project_json =
            serde_json::to_string(&opts.project).context("marshall project metadata")?;
        info!("Adding label '{PROJECT_METADATA_LABEL}'");
        opts.working_image
            .set_label(PROJECT_METADATA_LABEL, &project_json);

        for label in &build_md.labels {
            info!("Adding label '{}'", label.key);
            opts.working_image.set_label(&label.key, &label.value);
        }
        Ok(())
    }

    fn set_env(&self, opts: &mut ExportOptions<'_>, launch_md: &LaunchMetadata) -> Result<()> {
        let image = &mut *opts.working_image;
        image.set_env(ENV_LAYERS_DIR, &opts.layers_dir.display().to_string());
        image.set_env(ENV_APP_DIR, &opts.app_dir.display().to_string());
        image.set_env(ENV_PLATFORM_API, &self.platform_api.to_string());
        image.set_env(ENV_DEPRECATION_MODE, DEPRECATION_MODE_QUIET);

        if self.supports_multicall_launcher() {
            let path = match image.env_var("PATH") {
                Some(existing) if !existing.is_empty() => {
                    format!("{PROCESS_DIR}{PATH_LIST_SEPARATOR}{existing}")
                }
                _ => PROCESS_DIR.to_string(),
            };
            image.set_env("PATH", &path);
        } else if let Some(default_process) = opts.default_process_type.as_deref() {
            if launch_md.find_process_type(default_process).is_none() {
                return Err(missing_process_type(launch_md, default_process));
            }
            image.set_env(ENV_PROCESS_TYPE, default_process);
        }
        Ok(())
    }

    fn entrypoint(
        &self,
        launch_md: &LaunchMetadata,
        default_process_type: Option<&str>,
    ) -> Result<String> {
        if !self.supports_multicall_launcher() {
            return Ok(LAUNCHER_PATH.to_string());
        }
        let Some(default_process) = default_process_type else {
            if launch_md.processes.len() == 1 {
                return Ok(launch_md.processes[0].path());
            }
            return Ok(LAUNCHER_PATH.to_string());
        };
        match launch_md.find_process_type(default_process) {
            Some(process) => Ok(process.path()),
            None => Err(missing_process_type(launch_md, default_process)),
        }
    }

    /// The single home of layer identity: equal digests reuse the previous
    /// blob, anything else uploads fresh. Returns the digest either way.
    async fn add_or_reuse(
        &self,
        image: &mut dyn Image,
        layer: &Layer,
        previous_sha: Option<&str>,
    ) -> Result<String> {
        if Some(layer.digest.as_str()) == previous_sha {
            info!("Reusing layer '{}'", layer.id);
            debug!("Layer '{}' SHA: {}", layer.id, layer.digest);
            image
                .reuse_layer(&layer.digest)
                .await
                .map_err(|source| PhaseError::ImageIo { source })
                .context(format!("reusing layer: '{}'", layer.id))?;
        } else {
            info!("Adding layer '{}'", layer.id);
            debug!("Layer '{}' SHA: {}", layer.id, layer.digest);
            image
                .add_layer_with_diff_id(&layer.tar_path, &layer.digest)
                .await
                .map_err(|source| PhaseError::ImageIo { source })
                .context(format!("adding layer: '{}'", layer.id))?;
        }
        Ok(layer.digest.clone())
    }

    fn supports_multicall_launcher(&self) -> bool {
        self.platform_api >= ApiVersion::new(0, 4)
    }
}

fn missing_process_type(launch_md: &LaunchMetadata, requested: &str) -> anyhow::Error {
    PhaseError::MissingProcessType {
        requested: requested.to_string(),
        available: launch_md.process_types(),
    }
    .into()
}

fn as_opt(sha: &str) -> Option<&str> {
    (!sha.is_empty()).then_some(sha)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::launch::Process;
    use crate::metadata::{write_build_metadata, BuildMetadata};
    use async_trait::async_trait;
    use image_store::SaveReport;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    /// An image double that records every store interaction.
    #[derive(Debug, Default)]
    struct RecordingImage {
        added: Vec<String>,
        reused: Vec<String>,
        labels: BTreeMap<String, String>,
        env: BTreeMap<String, String>,
        entrypoint: Option<String>,
        cmd: Option<Vec<String>>,
        saved_tags: Vec<String>,
    }

    #[async_trait]
    impl Image for RecordingImage {
        fn name(&self) -> &str {
            "app:test"
        }

        fn label(&self, key: &str) -> Option<String> {
            self.labels.get(key).cloned()
        }

        fn env_var(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }

        fn top_layer(&self) -> image_store::Result<String> {
            Ok("sha256:toplayer".to_string())
        }

        fn set_label(&mut self, key: &str, value: &str) {
            self.labels.insert(key.into(), value.into());
        }

        fn set_env(&mut self, key: &str, value: &str) {
            self.env.insert(key.into(), value.into());
        }

        fn set_entrypoint(&mut self, entrypoint: &str) {
            self.entrypoint = Some(entrypoint.to_string());
        }

        fn set_cmd(&mut self, cmd: &[String]) {
            self.cmd = Some(cmd.to_vec());
        }

        async fn add_layer_with_diff_id(
            &mut self,
            _tar_path: &Path,
            diff_id: &str,
        ) -> image_store::Result<()> {
            self.added.push(diff_id.to_string());
            Ok(())
        }

        async fn reuse_layer(&mut self, diff_id: &str) -> image_store::Result<()> {
            self.reused.push(diff_id.to_string());
            Ok(())
        }

        async fn save(&mut self, additional_tags: &[String]) -> image_store::Result<SaveReport> {
            let mut tags = vec![self.name().to_string()];
            tags.extend(additional_tags.iter().cloned());
            self.saved_tags = tags.clone();
            Ok(SaveReport {
                tags,
                image_id: "sha256:imageid".to_string(),
                digest: None,
            })
        }
    }

    struct Fixture {
        temp: tempfile::TempDir,
        layers_dir: PathBuf,
        app_dir: PathBuf,
        launcher: PathBuf,
    }

    async fn fixture(build_md: BuildMetadata) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let layers_dir = temp.path().join("layers");
        let app_dir = temp.path().join("app");
        let launcher = temp.path().join("launcher");
        tokio::fs::create_dir_all(layers_dir.join("config")).await.unwrap();
        tokio::fs::create_dir_all(&app_dir).await.unwrap();
        tokio::fs::write(app_dir.join("main.js"), "app").await.unwrap();
        tokio::fs::write(&launcher, "ELF").await.unwrap();
        write_build_metadata(&layers_dir, &build_md).await.unwrap();
        Fixture {
            temp,
            layers_dir,
            app_dir,
            launcher,
        }
    }

    async fn add_launch_layer(fixture: &Fixture, bp: &str, name: &str, contents: &str) {
        let dir = fixture.layers_dir.join(bp).join(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("data"), contents).await.unwrap();
        tokio::fs::write(
            fixture.layers_dir.join(bp).join(format!("{name}.toml")),
            "launch = true\n",
        )
        .await
        .unwrap();
    }

    fn exporter(fixture: &Fixture, buildpacks: Vec<GroupEntry>, platform: &str) -> Exporter {
        Exporter {
            buildpacks,
            layer_factory: LayerFactory::new(fixture.temp.path()),
            platform_api: platform.parse().unwrap(),
        }
    }

    fn options<'a>(
        fixture: &Fixture,
        image: &'a mut RecordingImage,
        orig: LayersMetadata,
        default_process_type: Option<&str>,
    ) -> ExportOptions<'a> {
        ExportOptions {
            layers_dir: fixture.layers_dir.clone(),
            app_dir: fixture.app_dir.clone(),
            working_image: image,
            run_image_ref: "run@sha256:runref".to_string(),
            orig_metadata: orig,
            additional_tags: vec![],
            launcher_config: LauncherConfig {
                path: fixture.launcher.clone(),
                metadata: LauncherMetadata::default(),
            },
            stack: StackMetadata::default(),
            project: ProjectMetadata::default(),
            default_process_type: default_process_type.map(str::to_string),
        }
    }

    fn bp(id: &str, api: &str) -> GroupEntry {
        let mut entry = GroupEntry::new(id, "1.0");
        entry.api = Some(api.parse().unwrap());
        entry
    }

    #[tokio::test]
    async fn first_export_adds_all_layers_and_records_metadata() {
        let fixture = fixture(BuildMetadata::default()).await;
        add_launch_layer(&fixture, "node", "deps", "modules").await;

        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![bp("node", "0.5")], "0.3");
        let report = exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), None))
            .await
            .unwrap();

        assert!(image.reused.is_empty());
        // deps + launcher + config + app.
        assert_eq!(image.added.len(), 4);
        assert_eq!(report.image.tags, vec!["app:test".to_string()]);

        let meta =
            LayersMetadata::parse(image.labels.get(LAYER_METADATA_LABEL).unwrap()).unwrap();
        assert_eq!(meta.run_image.top_layer, "sha256:toplayer");
        assert_eq!(meta.run_image.reference, "run@sha256:runref");
        let recorded = meta.layer_sha("node", "deps").unwrap();
        // The recorded sha is the digest of a layer the image received.
        assert!(image.added.contains(&recorded.to_string()));
        assert!(!meta.launcher.sha.is_empty());
        assert!(!meta.config.sha.is_empty());
        assert_eq!(meta.app.len(), 1);
        assert_eq!(image.cmd, Some(vec![]));
        assert_eq!(image.entrypoint.as_deref(), Some(LAUNCHER_PATH));
        assert_eq!(image.env.get(ENV_PLATFORM_API).unwrap(), "0.3");
        assert_eq!(image.env.get(ENV_DEPRECATION_MODE).unwrap(), "quiet");
    }

    #[tokio::test]
    async fn unchanged_content_is_reused_not_readded() {
        // Identical content on a rebuild leads to pure reuse.
        let fixture = fixture(BuildMetadata::default()).await;
        add_launch_layer(&fixture, "node", "deps", "modules").await;
        let exporter = exporter(&fixture, vec![bp("node", "0.5")], "0.3");

        let mut first = RecordingImage::default();
        exporter
            .export(options(&fixture, &mut first, LayersMetadata::default(), None))
            .await
            .unwrap();
        let previous =
            LayersMetadata::parse(first.labels.get(LAYER_METADATA_LABEL).unwrap()).unwrap();

        let mut second = RecordingImage::default();
        exporter
            .export(options(&fixture, &mut second, previous, None))
            .await
            .unwrap();
        assert!(
            second.added.is_empty(),
            "expected pure reuse, got adds: {:?}",
            second.added
        );
        assert_eq!(second.reused.len(), 4);
    }

    #[tokio::test]
    async fn contents_less_layer_reuses_by_previous_metadata() {
        let fixture = fixture(BuildMetadata::default()).await;
        // Metadata-only layer: toml, no directory.
        tokio::fs::create_dir_all(fixture.layers_dir.join("node")).await.unwrap();
        tokio::fs::write(
            fixture.layers_dir.join("node/deps.toml"),
            "launch = true\n",
        )
        .await
        .unwrap();

        let mut orig = LayersMetadata::default();
        orig.buildpacks.push(BuildpackLayersMetadata {
            id: "node".into(),
            version: "1.0".into(),
            layers: [(
                "deps".to_string(),
                crate::metadata::BuildpackLayerMetadata {
                    sha: "sha256:previous".into(),
                    launch: true,
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            store: None,
        });

        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![bp("node", "0.5")], "0.3");
        exporter
            .export(options(&fixture, &mut image, orig, None))
            .await
            .unwrap();
        assert!(image.reused.contains(&"sha256:previous".to_string()));
    }

    #[tokio::test]
    async fn contents_less_layer_without_history_fails() {
        let fixture = fixture(BuildMetadata::default()).await;
        tokio::fs::create_dir_all(fixture.layers_dir.join("node")).await.unwrap();
        tokio::fs::write(
            fixture.layers_dir.join("node/deps.toml"),
            "launch = true\n",
        )
        .await
        .unwrap();

        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![bp("node", "0.5")], "0.3");
        let err = exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot reuse 'node:deps'"));
    }

    #[tokio::test]
    async fn malformed_layer_metadata_is_fatal() {
        let fixture = fixture(BuildMetadata::default()).await;
        tokio::fs::create_dir_all(fixture.layers_dir.join("node")).await.unwrap();
        tokio::fs::write(fixture.layers_dir.join("node/bad.toml"), "launch = \"??")
            .await
            .unwrap();

        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![bp("node", "0.5")], "0.3");
        let err = exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to parse metadata for layers"));
        assert!(err.to_string().contains("node:bad"));
    }

    fn two_process_metadata() -> BuildMetadata {
        BuildMetadata {
            processes: vec![
                Process {
                    r#type: "web".into(),
                    command: "serve".into(),
                    args: vec![],
                    direct: false,
                    buildpack_id: "node".into(),
                },
                Process {
                    r#type: "worker".into(),
                    command: "work".into(),
                    args: vec![],
                    direct: false,
                    buildpack_id: "node".into(),
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn default_process_selects_the_entrypoint_on_modern_platforms() {
        // Platform 0.5 with two processes and a default of "worker".
        let fixture = fixture(two_process_metadata()).await;
        let mut image = RecordingImage::default();
        image.env.insert("PATH".into(), "/usr/bin".into());
        let exporter = exporter(&fixture, vec![], "0.5");
        exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), Some("worker")))
            .await
            .unwrap();

        assert_eq!(image.entrypoint.as_deref(), Some("/cnb/process/worker"));
        assert_eq!(image.cmd, Some(vec![]));
        assert!(image.env.get(ENV_PROCESS_TYPE).is_none());
        assert_eq!(image.env.get("PATH").unwrap(), "/cnb/process:/usr/bin");
        // The process-types layer is exported on multicall platforms.
        let meta =
            LayersMetadata::parse(image.labels.get(LAYER_METADATA_LABEL).unwrap()).unwrap();
        assert!(!meta.process_types.sha.is_empty());
    }

    #[tokio::test]
    async fn sole_process_becomes_entrypoint_without_a_default() {
        let mut build_md = two_process_metadata();
        build_md.processes.truncate(1);
        let fixture = fixture(build_md).await;
        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![], "0.4");
        exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), None))
            .await
            .unwrap();
        assert_eq!(image.entrypoint.as_deref(), Some("/cnb/process/web"));
    }

    #[tokio::test]
    async fn missing_default_process_lists_available_types() {
        let fixture = fixture(two_process_metadata()).await;
        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![], "0.5");
        let err = exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), Some("gone")))
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("'gone'"));
        assert!(message.contains("web"));
        assert!(message.contains("worker"));
    }

    #[tokio::test]
    async fn old_platforms_export_the_default_process_as_env() {
        let fixture = fixture(two_process_metadata()).await;
        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![], "0.3");
        exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), Some("worker")))
            .await
            .unwrap();
        assert_eq!(image.entrypoint.as_deref(), Some(LAUNCHER_PATH));
        assert_eq!(image.env.get(ENV_PROCESS_TYPE).unwrap(), "worker");
    }

    #[tokio::test]
    async fn buildpack_labels_land_on_the_image() {
        let build_md = BuildMetadata {
            labels: vec![crate::launch::Label {
                key: "team".into(),
                value: "runtime".into(),
            }],
            ..Default::default()
        };
        let fixture = fixture(build_md).await;
        let mut image = RecordingImage::default();
        let exporter = exporter(&fixture, vec![], "0.3");
        exporter
            .export(options(&fixture, &mut image, LayersMetadata::default(), None))
            .await
            .unwrap();
        assert_eq!(image.labels.get("team").unwrap(), "runtime");
        assert!(image.labels.contains_key(BUILD_METADATA_LABEL));
        assert!(image.labels.contains_key(PROJECT_METADATA_LABEL));
    }
}
