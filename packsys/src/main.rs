use crate::cmd::{init_logger, Args};
use clap::error::ErrorKind;
use clap::Parser;

mod api;
mod auth;
mod build;
mod buildpack;
mod cache;
mod cmd;
mod common;
mod detect;
mod env;
mod error;
mod export;
mod launch;
mod layers;
mod metadata;
mod plan;
mod restore;
/// Test code that should only be compiled when running tests.
#[cfg(test)]
mod test;

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => error::CODE_SUCCESS,
                _ => error::CODE_INVALID_ARGS,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_logger(args.log_level);
    if let Err(err) = cmd::run(args).await {
        log::error!("{err:#}");
        std::process::exit(error::exit_code_for(&err));
    }
}
