//! Salsa Milk command-line tool
//!
//! Run with: cargo run -p salsa-milk --bin salsa-milk -- song.mp3 https://youtu.be/<id>

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use salsa_milk::cli::{self, Cli};
use salsa_milk::media::{PipelineTools, SystemRunner};
use salsa_milk::SalsaConfig;

fn main() -> ExitCode {
    let args = Cli::parse();

    // Logs go to stdout alongside the progress bar
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "salsa_milk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    let config = match SalsaConfig::load(None) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let tools = PipelineTools::from(&config.pipeline);

    match cli::run(&args, Arc::new(SystemRunner), tools) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
