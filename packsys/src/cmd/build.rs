use crate::build::Builder;
use crate::buildpack::{read_group, BuildpackStore};
use crate::env::Env;
use crate::metadata::write_build_metadata;
use crate::plan::read_plan;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub(crate) struct BuildCmd {
    /// Directory containing the application source.
    #[clap(long = "app", default_value = ".")]
    pub(crate) app_dir: PathBuf,

    /// Root of the buildpack registry.
    #[clap(long = "buildpacks", default_value = "/cnb/buildpacks")]
    pub(crate) buildpacks_dir: PathBuf,

    /// Directory that receives buildpack layers.
    #[clap(long = "layers", default_value = "/layers")]
    pub(crate) layers_dir: PathBuf,

    /// Directory with platform-provided configuration for the buildpacks.
    #[clap(long = "platform", default_value = "/platform")]
    pub(crate) platform_dir: PathBuf,

    /// The group selected by detect.
    #[clap(long = "group", default_value = "group.toml")]
    pub(crate) group_path: PathBuf,

    /// The plan resolved by detect.
    #[clap(long = "plan", default_value = "plan.toml")]
    pub(crate) plan_path: PathBuf,
}

impl BuildCmd {
    pub(crate) async fn run(&self) -> Result<()> {
        let group = read_group(&self.group_path).await?;
        let plan = read_plan(&self.plan_path).await?;
        let builder = Builder {
            app_dir: self.app_dir.clone(),
            layers_dir: self.layers_dir.clone(),
            platform_dir: self.platform_dir.clone(),
            group,
            plan,
            store: BuildpackStore::new(&self.buildpacks_dir),
            env: Env::from_current(),
        };
        let metadata = builder.build().await?;
        write_build_metadata(&self.layers_dir, &metadata).await?;
        Ok(())
    }
}
