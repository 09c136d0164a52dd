// ABOUTME: Entry point for the lookout dashboard server.
// ABOUTME: Loads TOML config, applies command-line overrides and serves HTTP + gRPC on one port.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use lookout_control::Config;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lookout-dashboard")]
#[command(about = "Fleet-monitoring dashboard control plane")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults to ~/.config/lookout/dashboard.toml)
    #[arg(short, long, env = "LOOKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for HTTP and gRPC, overriding the config file
    #[arg(short, long, env = "LOOKOUT_LISTEN")]
    listen: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_or_default(&Config::default_path())?,
        };
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
            config.validate()?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    lookout_log::init_for(&["lookout-dashboard", "lookout-control"]);

    let cli = Cli::parse();
    let config = cli.load_config()?;
    info!(listen = %config.listen_addr, "Starting lookout dashboard");

    lookout_control::run(config).await
}
