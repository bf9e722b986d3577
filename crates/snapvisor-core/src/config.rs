use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_TIMEOUT_MS: u64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionServiceConfig {
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,
    #[serde(default = "default_use_ping")]
    pub use_ping: bool,
}

impl Default for ExecutionServiceConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            termination_timeout_ms: default_termination_timeout_ms(),
            use_ping: default_use_ping(),
        }
    }
}

impl ExecutionServiceConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms.max(MIN_TIMEOUT_MS))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms.max(MIN_TIMEOUT_MS))
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms.max(MIN_TIMEOUT_MS))
    }

    pub fn min_execution_budget(&self) -> Duration {
        self.init_timeout() / 2
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("snapvisor.json")
}

pub fn load_config(config_dir: &Path) -> Result<ExecutionServiceConfig> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(ExecutionServiceConfig::default());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let config: ExecutionServiceConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config_dir: &Path, config: &ExecutionServiceConfig) -> Result<()> {
    fs::create_dir_all(config_dir)
        .with_context(|| format!("create config dir: {}", config_dir.display()))?;

    let path = config_path(config_dir);
    let json = serde_json::to_string_pretty(config)?;
    fs::write(&path, json).with_context(|| format!("write config file: {}", path.display()))?;
    Ok(())
}

const fn default_init_timeout_ms() -> u64 {
    60_000
}

const fn default_ping_timeout_ms() -> u64 {
    2_000
}

const fn default_termination_timeout_ms() -> u64 {
    1_000
}

const fn default_use_ping() -> bool {
    true
}
