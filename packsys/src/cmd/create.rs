use crate::api::ApiVersion;
use crate::build::Builder;
use crate::buildpack::{read_order, write_group, BuildpackStore};
use crate::cache::{read_cache_metadata, Cacher};
use crate::cmd::export::{export_image, ExportArgs};
use crate::detect::Detector;
use crate::env::Env;
use crate::layers::factory::LayerFactory;
use crate::metadata::{write_build_metadata, LayersMetadata, LAYER_METADATA_LABEL};
use crate::plan::write_plan;
use crate::restore::LayerMetadataRestorer;
use anyhow::{bail, Context, Result};
use clap::Parser;
use image_store::{LocalCache, LocalImage};
use log::info;
use std::path::PathBuf;

/// The single-shot driver: detect, restore, build, export, cache.
#[derive(Debug, Parser)]
pub(crate) struct CreateCmd {
    /// Directory containing the application source.
    #[clap(long = "app", default_value = ".")]
    pub(crate) app_dir: PathBuf,

    /// Root of the buildpack registry.
    #[clap(long = "buildpacks", default_value = "/cnb/buildpacks")]
    pub(crate) buildpacks_dir: PathBuf,

    /// Directory with platform-provided configuration for the buildpacks.
    #[clap(long = "platform", default_value = "/platform")]
    pub(crate) platform_dir: PathBuf,

    /// The order of buildpack groups to try.
    #[clap(long = "order", default_value = "order.toml")]
    pub(crate) order_path: PathBuf,

    /// Directory that receives buildpack layers.
    #[clap(long = "layers", default_value = "/layers")]
    pub(crate) layers_dir: PathBuf,

    /// Root directory of the local image store.
    #[clap(long = "image-store", default_value = "./images")]
    pub(crate) image_store_dir: PathBuf,

    /// Run image the app image is built on; must be present in the store.
    #[clap(long = "run-image")]
    pub(crate) run_image: Option<String>,

    /// Persist and restore cache=true layers in this cache directory.
    #[clap(long = "cache-dir")]
    pub(crate) cache_dir: Option<PathBuf>,

    /// The launcher binary to embed in the image.
    #[clap(long = "launcher")]
    pub(crate) launcher_path: PathBuf,

    /// Process type to launch by default.
    #[clap(long = "process-type")]
    pub(crate) default_process_type: Option<String>,

    /// The platform API this invocation was written against.
    #[clap(long = "platform-api", env = "CNB_PLATFORM_API", default_value = "0.5")]
    pub(crate) platform_api: ApiVersion,

    /// Image name to save, followed by any additional tags.
    #[clap(required = true)]
    pub(crate) image_names: Vec<String>,
}

impl CreateCmd {
    pub(crate) async fn run(&self) -> Result<()> {
        // Cooperative cancel: dropping the pipeline kills in-flight
        // buildpack processes, and nothing is saved.
        tokio::select! {
            result = self.pipeline() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; no image was saved");
                bail!("build canceled")
            }
        }
    }

    async fn pipeline(&self) -> Result<()> {
        super::verify_platform_api(&self.platform_api)?;
        let order = read_order(&self.order_path).await?;
        let store = BuildpackStore::new(&self.buildpacks_dir);
        let detector = Detector::new(
            self.app_dir.clone(),
            self.platform_dir.clone(),
            store.clone(),
            Env::from_current(),
        );
        let (group, plan) = detector.detect(&order).await?;

        crate::common::fs::create_dir_all(&self.layers_dir).await?;
        write_group(&self.layers_dir.join("group.toml"), &group).await?;
        write_plan(&self.layers_dir.join("plan.toml"), &plan).await?;

        if let Some(cache_dir) = &self.cache_dir {
            let cache = LocalCache::open(cache_dir)
                .await
                .context("opening cache store")?;
            let cache_metadata = read_cache_metadata(&cache).await?;
            let previous_metadata = self.previous_image_metadata().await?;
            let restorer = LayerMetadataRestorer {
                layers_dir: self.layers_dir.clone(),
                buildpacks: group.clone(),
            };
            restorer
                .restore(&previous_metadata, &cache_metadata, &cache)
                .await?;
        }

        let builder = Builder {
            app_dir: self.app_dir.clone(),
            layers_dir: self.layers_dir.clone(),
            platform_dir: self.platform_dir.clone(),
            group: group.clone(),
            plan,
            store,
            env: Env::from_current(),
        };
        let metadata = builder.build().await?;
        write_build_metadata(&self.layers_dir, &metadata).await?;

        export_image(ExportArgs {
            layers_dir: &self.layers_dir,
            app_dir: &self.app_dir,
            group: group.clone(),
            image_store_dir: &self.image_store_dir,
            run_image: self.run_image.as_deref(),
            launcher_path: &self.launcher_path,
            default_process_type: self.default_process_type.as_deref(),
            platform_api: self.platform_api,
            stack_path: None,
            project_metadata_path: None,
            image_names: &self.image_names,
        })
        .await?;

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

    /// Layers metadata recorded on the previous build of the primary tag,
    /// used to validate cached launch layers before restoring them.
    async fn previous_image_metadata(&self) -> Result<LayersMetadata> {
        let Some(primary) = self.image_names.first() else {
            return Ok(LayersMetadata::default());
        };
        if !self.image_store_dir.is_dir() {
            return Ok(LayersMetadata::default());
        }
        let image = LocalImage::open(&self.image_store_dir, primary, None)
            .await
            .map_err(|source| crate::error::PhaseError::ImageIo { source })
            .context("opening previous image")?;
        Ok(image
            .previous_label(LAYER_METADATA_LABEL)
            .and_then(|raw| LayersMetadata::parse(&raw).ok())
            .unwrap_or_default())
    }
}
