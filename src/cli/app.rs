use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use super::args::CliArgs;
use super::dispatch::dispatch;
use super::runtime::{init_logging, load_local_env_overrides};
use crate::config::{apply_runtime_overrides, load_config, LoadedConfig};
use crate::metrics;

pub async fn run() -> Result<()> {
    load_local_env_overrides();
    let cli = CliArgs::parse();

    init_logging(&cli.log_level, cli.debug)?;
    let _metrics_server = metrics::spawn_metrics_server(cli.metrics_port);

    info!("starting browser-agent v{}", env!("CARGO_PKG_VERSION"));

    let LoadedConfig { mut config, .. } = load_config(cli.config.as_ref()).await?;
    apply_runtime_overrides(&mut config);

    if let Some(chrome) = &cli.chrome {
        config.cdp.executable = chrome.clone();
    }
    if let Some(headless) = cli.headless {
        config.cdp.headless = headless;
    }

    match dispatch(&cli, &config).await {
        Ok(()) => {
            info!("command completed successfully");
            Ok(())
        }
        Err(err) => {
            error!("command failed: {err}");
            Err(err)
        }
    }
}
