use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Engine settings. Every field has a default; a YAML file only lists
/// what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First field of every identity minted by this engine.
    pub engine_id: String,
    /// Pending in-memory messages above which a warning is logged.
    pub queue_capacity: usize,
    /// Upper bound on one participant `consume` call.
    pub dispatch_timeout_ms: u64,
    /// Events kept in the in-process history; 0 keeps everything.
    pub history_capacity: usize,
    /// Worker loops started by `Engine::start_workers`.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: "engine".to_string(),
            queue_capacity: 1024,
            dispatch_timeout_ms: 60_000,
            history_capacity: 10_000,
            workers: 1,
        }
    }
}

impl EngineConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

pub fn load_config_from_yaml(file_path: &str) -> Result<EngineConfig> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file from {}", file_path))?;

    let config: EngineConfig = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize config from {}", file_path))?;

    Ok(config)
}
