use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use ingest::EngineConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub events: EventsConfig,
    pub reconcile: ReconcileConfig,
    pub risk: RiskConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub buffer_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: events::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// humantime, e.g. "10m"
    pub window: String,
    pub interval: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            window: "10m".to_string(),
            interval: "5s".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("smsguard").join("config.toml")
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::path();
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file at {}", config_path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("invalid config file {}", config_path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config file")?;
        if config.events.buffer_capacity == 0 {
            anyhow::bail!("events.buffer_capacity must be at least 1");
        }
        if !(0.0..=1.0).contains(&config.risk.threshold) {
            anyhow::bail!("risk.threshold must be within [0.0, 1.0]");
        }
        Ok(config)
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let reconcile_window = humantime::parse_duration(&self.reconcile.window)
            .with_context(|| format!("invalid reconcile.window {:?}", self.reconcile.window))?;
        Ok(EngineConfig {
            subscriber_capacity: self.events.buffer_capacity,
            reconcile_window,
        })
    }

    pub fn refresh_interval(&self) -> anyhow::Result<Duration> {
        humantime::parse_duration(&self.reconcile.interval)
            .with_context(|| format!("invalid reconcile.interval {:?}", self.reconcile.interval))
    }
}
