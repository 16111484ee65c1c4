//! Application configuration: YAML file plus environment overrides, in
//! that priority order, with compiled-in defaults underneath both.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use agent_loop::AgentLoopConfig;
use cdp_driver::CdpConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cdp: CdpConfig,
    #[serde(default)]
    pub agent_loop: AgentLoopConfig,
    #[serde(default = "default_policy_server_addr")]
    pub policy_server_addr: String,
    #[serde(default)]
    pub session_record_path: Option<PathBuf>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_policy_server_addr() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cdp: CdpConfig::default(),
            agent_loop: AgentLoopConfig::default(),
            policy_server_addr: default_policy_server_addr(),
            session_record_path: None,
            metrics_port: None,
        }
    }
}

pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
}

/// Priority: explicit `--config` flag, then `./config/config.yaml`, then
/// `~/.config/browser-agent/config.yaml`. Missing files fall back to
/// compiled-in defaults rather than failing.
pub async fn load_config(config_path: Option<&PathBuf>) -> Result<LoadedConfig> {
    let config_path = match config_path {
        Some(path) => path.clone(),
        None => {
            let local_config = PathBuf::from("config/config.yaml");
            if local_config.exists() {
                local_config
            } else {
                let mut path = dirs::config_dir().context("failed to resolve config directory")?;
                path.push("browser-agent");
                path.push("config.yaml");
                path
            }
        }
    };

    if config_path.exists() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .context("failed to read config file")?;
        let config: AppConfig =
            serde_yaml::from_str(&content).context("failed to parse config file")?;
        tracing::info!(target: "browser-agent", path = %config_path.display(), "loaded configuration");
        Ok(LoadedConfig { config, path: config_path })
    } else {
        tracing::warn!(target: "browser-agent", path = %config_path.display(), "config file not found, using defaults");
        Ok(LoadedConfig { config: AppConfig::default(), path: config_path })
    }
}

/// Environment overrides applied on top of the loaded file, mirroring the
/// cascade the CDP driver itself already applies for Chrome discovery.
pub fn apply_runtime_overrides(config: &mut AppConfig) {
    if let Ok(addr) = std::env::var("BROWSER_AGENT_POLICY_ADDR") {
        config.policy_server_addr = addr;
    }
    if let Ok(port) = std::env::var("BROWSER_AGENT_METRICS_PORT") {
        if let Ok(parsed) = port.parse() {
            config.metrics_port = Some(parsed);
        }
    }
}
