//! voteflow server binary.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voteflow_server::app;
use voteflow_server::config::Config;

/// High-throughput distributed voting service.
#[derive(Parser, Debug)]
#[command(name = "voteflow-server", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Instance number; the effective listen port is `server.port +
    /// instance - 1`.
    #[arg(long, default_value_t = 1)]
    instance: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "voteflow_server=info,voteflow_core=info,voteflow_kafka=info".into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&cli.config)?;
    info!(config = %cli.config.display(), instance = cli.instance, "configuration loaded");

    app::run(config, cli.instance).await?;
    Ok(())
}
