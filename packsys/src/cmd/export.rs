use crate::api::ApiVersion;
use crate::auth::{read_env_var, ENV_REGISTRY_AUTH};
use crate::buildpack::read_group;
use crate::cache::Cacher;
use crate::common::fs;
use crate::export::{ExportOptions, Exporter, LauncherConfig};
use crate::layers::factory::LayerFactory;
use crate::metadata::{
    GitMetadata, LauncherMetadata, LauncherSource, LayersMetadata, ProjectMetadata,
    StackMetadata, LAYER_METADATA_LABEL,
};
use anyhow::{Context, Result};
use clap::Parser;
use image_store::{LocalCache, LocalImage};
use log::{debug, info};
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub(crate) struct ExportCmd {
    /// Directory holding the built buildpack layers.
    #[clap(long = "layers", default_value = "/layers")]
    pub(crate) layers_dir: PathBuf,

    /// Directory containing the application source.
    #[clap(long = "app", default_value = ".")]
    pub(crate) app_dir: PathBuf,

    /// The group selected by detect.
    #[clap(long = "group", default_value = "group.toml")]
    pub(crate) group_path: PathBuf,

    /// Root directory of the local image store.
    #[clap(long = "image-store", default_value = "./images")]
    pub(crate) image_store_dir: PathBuf,

    /// Run image the app image is built on; must be present in the store.
    #[clap(long = "run-image")]
    pub(crate) run_image: Option<String>,

    /// The launcher binary to embed in the image.
    #[clap(long = "launcher")]
    pub(crate) launcher_path: PathBuf,

    /// Persist cache=true layers into this cache directory after export.
    #[clap(long = "cache-dir")]
    pub(crate) cache_dir: Option<PathBuf>,

    /// Process type to launch by default.
    #[clap(long = "process-type")]
    pub(crate) default_process_type: Option<String>,

    /// The platform API this invocation was written against.
    #[clap(long = "platform-api", env = "CNB_PLATFORM_API", default_value = "0.5")]
    pub(crate) platform_api: ApiVersion,

    /// `stack.toml` describing the stack's run image.
    #[clap(long = "stack")]
    pub(crate) stack_path: Option<PathBuf>,

    /// `project-metadata.toml` recorded on the image verbatim.
    #[clap(long = "project-metadata")]
    pub(crate) project_metadata_path: Option<PathBuf>,

    /// Where to write the export report.
    #[clap(long = "report", default_value = "report.toml")]
    pub(crate) report_path: PathBuf,

    /// Image name to save, followed by any additional tags.
    #[clap(required = true)]
    pub(crate) image_names: Vec<String>,
}

impl ExportCmd {
    pub(crate) async fn run(&self) -> Result<()> {
        super::verify_platform_api(&self.platform_api)?;
        let group = read_group(&self.group_path).await?;
        let report = export_image(ExportArgs {
            layers_dir: &self.layers_dir,
            app_dir: &self.app_dir,
            group: group.clone(),
            image_store_dir: &self.image_store_dir,
            run_image: self.run_image.as_deref(),
            launcher_path: &self.launcher_path,
            default_process_type: self.default_process_type.as_deref(),
            platform_api: self.platform_api,
            stack_path: self.stack_path.as_deref(),
            project_metadata_path: self.project_metadata_path.as_deref(),
            image_names: &self.image_names,
        })
        .await?;
        let serialized = toml::to_string(&report).context("failed to serialize export report")?;
        fs::write(&self.report_path, serialized).await?;

        if let Some(cache_dir) = &self.cache_dir {
            let mut cache = LocalCache::open(cache_dir)
                .await
                .context("opening cache store")?;
            let artifacts = tempfile::tempdir().context("creating cache artifacts dir")?;
            let cacher = Cacher {
                buildpacks: group,
                layer_factory: LayerFactory::new(artifacts.path()),
            };
            cacher.cache(&self.layers_dir, &mut cache).await?;
        }
        Ok(())
    }
}

pub(crate) struct ExportArgs<'a> {
    pub(crate) layers_dir: &'a std::path::Path,
    pub(crate) app_dir: &'a std::path::Path,
    pub(crate) group: Vec<crate::buildpack::GroupEntry>,
    pub(crate) image_store_dir: &'a std::path::Path,
    pub(crate) run_image: Option<&'a str>,
    pub(crate) launcher_path: &'a std::path::Path,
    pub(crate) default_process_type: Option<&'a str>,
    pub(crate) platform_api: ApiVersion,
    pub(crate) stack_path: Option<&'a std::path::Path>,
    pub(crate) project_metadata_path: Option<&'a std::path::Path>,
    pub(crate) image_names: &'a [String],
}

/// Shared by `export` and `create`: open the working image, recover the
/// previous build's metadata, and run the exporter.
pub(crate) async fn export_image(args: ExportArgs<'_>) -> Result<crate::export::ExportReport> {
    // Credentials are pass-through only: surfaced here for stores that
    // need them; the local store does not.
    let auths = read_env_var(ENV_REGISTRY_AUTH)?;
    if !auths.is_empty() {
        debug!("Registry credentials provided for {} host(s)", auths.len());
    }

    fs::create_dir_all(args.image_store_dir).await?;
    let (primary, additional_tags) = args
        .image_names
        .split_first()
        .context("at least one image name is required")?;
    let mut image = LocalImage::open(args.image_store_dir, primary, args.run_image)
        .await
        .map_err(|source| crate::error::PhaseError::ImageIo { source })
        .context("opening working image")?;

    let orig_metadata = match image.previous_label(LAYER_METADATA_LABEL) {
        Some(raw) => LayersMetadata::parse(&raw).unwrap_or_else(|e| {
            info!("Ignoring unparseable previous image metadata: {e}");
            LayersMetadata::default()
        }),
        None => LayersMetadata::default(),
    };

    let stack = match args.stack_path {
        Some(path) => {
            let raw = fs::read_to_string(path).await?;
            toml::from_str::<StackMetadata>(&raw)
                .context(format!("Unable to deserialize stack file '{}'", path.display()))?
        }
        None => StackMetadata::default(),
    };
    let project = match args.project_metadata_path {
        Some(path) => {
            let raw = fs::read_to_string(path).await?;
            let value: toml::Value = toml::from_str(&raw).context(format!(
                "Unable to deserialize project metadata '{}'",
                path.display()
            ))?;
            ProjectMetadata(serde_json::to_value(value).context("project metadata to json")?)
        }
        None => ProjectMetadata::default(),
    };

    let artifacts = tempfile::tempdir().context("creating layer artifacts dir")?;
    let exporter = Exporter {
        buildpacks: args.group,
        layer_factory: LayerFactory::new(artifacts.path()),
        platform_api: args.platform_api,
    };
    let report = exporter
        .export(ExportOptions {
            layers_dir: args.layers_dir.to_path_buf(),
            app_dir: args.app_dir.to_path_buf(),
            working_image: &mut image,
            run_image_ref: args.run_image.unwrap_or_default().to_string(),
            orig_metadata,
            additional_tags: additional_tags.to_vec(),
            launcher_config: LauncherConfig {
                path: args.launcher_path.to_path_buf(),
                metadata: launcher_metadata(),
            },
            stack,
            project,
            default_process_type: args.default_process_type.map(str::to_string),
        })
        .await?;
    info!("Saved image '{}' ({})", primary, report.image.image_id);
    Ok(report)
}

fn launcher_metadata() -> LauncherMetadata {
    LauncherMetadata {
        version: env!("CARGO_PKG_VERSION").to_string(),
        source: LauncherSource {
            git: GitMetadata::default(),
        },
    }
}
