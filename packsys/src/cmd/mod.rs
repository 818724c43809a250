mod build;
mod create;
mod detect;
mod export;

use self::build::BuildCmd;
use self::create::CreateCmd;
use self::detect::DetectCmd;
use self::export::ExportCmd;
use anyhow::Result;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// A tool for building OCI images from an app directory with Cloud Native
/// Buildpacks.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace]. You
    /// can also leave this unset and use the RUST_LOG env variable. See
    /// https://github.com/rust-cli/env_logger/
    #[clap(long = "log-level")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    /// Select the group of buildpacks that will build this app.
    Detect(DetectCmd),

    /// Run the build binaries of a previously detected group.
    Build(BuildCmd),

    /// Assemble the final image from built layers, optionally persisting
    /// the cache.
    Export(ExportCmd),

    /// Run detect, restore, build, export, and cache end to end.
    Create(CreateCmd),
}

/// Entrypoint for the `packsys` command line program.
pub(super) async fn run(args: Args) -> Result<()> {
    match args.subcommand {
        Subcommand::Detect(detect_args) => detect_args.run().await,
        Subcommand::Build(build_args) => build_args.run().await,
        Subcommand::Export(export_args) => export_args.run().await,
        Subcommand::Create(create_args) => create_args.run().await,
    }
}

/// Refuse platform API versions this build of the engine cannot serve.
pub(crate) fn verify_platform_api(requested: &crate::api::ApiVersion) -> Result<()> {
    if !crate::api::is_supported(crate::api::SUPPORTED_PLATFORM_APIS, requested) {
        return Err(crate::error::PhaseError::InvalidArgs {
            message: format!("platform API {requested} is not supported"),
        }
        .into());
    }
    Ok(())
}

/// use `level` if present, or else use `RUST_LOG` if present, or else use a
/// default.
pub(super) fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            // RUST_LOG exists and level does not; use the environment variable.
            Builder::from_default_env().init();
        }
        _ => {
            // use provided log level or default for this crate only.
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}
