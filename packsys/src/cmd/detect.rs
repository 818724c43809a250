use crate::buildpack::{read_order, write_group, BuildpackStore};
use crate::detect::Detector;
use crate::env::Env;
use crate::plan::write_plan;
use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub(crate) struct DetectCmd {
    /// Directory containing the application source.
    #[clap(long = "app", default_value = ".")]
    pub(crate) app_dir: PathBuf,

    /// Root of the buildpack registry (`<id>/<version>/buildpack.toml`).
    #[clap(long = "buildpacks", default_value = "/cnb/buildpacks")]
    pub(crate) buildpacks_dir: PathBuf,

    /// Directory with platform-provided configuration for the buildpacks.
    #[clap(long = "platform", default_value = "/platform")]
    pub(crate) platform_dir: PathBuf,

    /// The order of buildpack groups to try.
    #[clap(long = "order", default_value = "order.toml")]
    pub(crate) order_path: PathBuf,

    /// Where to write the winning group.
    #[clap(long = "group", default_value = "group.toml")]
    pub(crate) group_path: PathBuf,

    /// Where to write the resolved build plan.
    #[clap(long = "plan", default_value = "plan.toml")]
    pub(crate) plan_path: PathBuf,
}

impl DetectCmd {
    pub(crate) async fn run(&self) -> Result<()> {
        let order = read_order(&self.order_path).await?;
        let detector = Detector::new(
            self.app_dir.clone(),
            self.platform_dir.clone(),
            BuildpackStore::new(&self.buildpacks_dir),
            Env::from_current(),
        );
        let (group, plan) = detector.detect(&order).await?;
        write_group(&self.group_path, &group).await?;
        write_plan(&self.plan_path, &plan).await?;
        info!(
            "Detection complete: {} buildpack(s), group written to '{}'",
            group.len(),
            self.group_path.display()
        );
        Ok(())
    }
}
