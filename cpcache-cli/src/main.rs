//! cpcache - caching HTTP proxy for package mirrors.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use cpcache_core::{config, CliLogLevel, Config};
use cpcache_server::{App, Server};

#[derive(Parser)]
#[command(name = "cpcache")]
#[command(about = "Caching HTTP proxy for package mirrors")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Console log level (RUST_LOG overrides).
    #[arg(long, value_enum, default_value = "info")]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cpcache_core::init_tracing(cli.log_level.to_level());

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let app = App::bootstrap(config).await.context("starting cpcache")?;
    let server = Server::bind(app).await.context("binding listen socket")?;
    tracing::info!(address = %server.local_addr()?, "cpcache listening");

    server.run().await.context("accept loop failed")?;
    Ok(())
}
