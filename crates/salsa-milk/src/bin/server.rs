//! Salsa Milk upload server
//!
//! Run with: cargo run -p salsa-milk --bin salsa-milk-server

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use salsa_milk::{server::SalsaServer, SalsaConfig};

/// Upload server for vocal isolation
#[derive(Parser, Debug)]
#[command(name = "salsa-milk-server", author, version, about)]
struct Args {
    /// TOML configuration file (overrides SALSA_MILK_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "salsa_milk=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SalsaConfig::load(args.config.as_deref())?;
    let serving = &config.serving;

    tracing::info!("salsa-milk {}", salsa_milk::version());
    tracing::info!("Configuration loaded");
    tracing::info!("  - Workers: {} x {} threads", serving.workers, serving.threads);
    tracing::info!("  - Max upload size: {} bytes", config.server.max_upload_size);
    tracing::info!("  - Task directory: {}", serving.task_root().display());
    match serving.task_ttl() {
        Some(ttl) => tracing::info!("  - Uncollected tasks kept for {}s", ttl.as_secs()),
        None => tracing::info!("  - Uncollected tasks kept until restart"),
    }
    if let Some(dir) = &serving.worker_tmp_dir {
        tracing::info!("  - Worker tmp directory: {}", dir.display());
    }
    tracing::info!("  - Default model: {}", config.pipeline.default_model);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(serving.runtime_threads())
        .enable_all()
        .build()?;

    let server = SalsaServer::new(config);
    tracing::info!("Health: http://{}/health", server.address());

    runtime.block_on(server.start())?;
    Ok(())
}
