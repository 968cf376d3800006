use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod event_schemas_cfg;

pub use event_schemas_cfg::EventSchemasConfig;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine tuning
    pub event_schemas: EventSchemasConfig,

    /// Durable store backing the flush and reload paths
    pub store: StoreCfg,

    /// Log output
    pub logging: LoggingCfg,

    /// Prometheus exporter
    pub metrics: MetricsCfg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreCfg {
    /// SQLite database file holding `event_models` and `schema_versions`.
    Sqlite { path: PathBuf },
    /// Process-local store; state is lost on exit.
    Memory,
}

impl Default for StoreCfg {
    fn default() -> Self {
        StoreCfg::Sqlite {
            path: PathBuf::from("./data/event_schemas.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingCfg {
    /// Either a simple level like "info" or a full EnvFilter string.
    #[serde(default)]
    pub level: Option<String>,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default = "default_true")]
    pub json: bool,

    #[serde(default)]
    pub with_targets: bool,
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self {
            level: Some("info".to_owned()),
            json: true,
            with_targets: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    ([0, 0, 0, 0], 9000).into()
}

/// Parse a YAML document after `${VAR}` expansion.
pub fn load_from_str(raw: &str) -> Result<AppConfig> {
    let with_env =
        shellexpand::env(raw).context("expanding environment variables")?;
    let cfg: AppConfig =
        serde_yaml::from_str(&with_env).context("parsing yaml")?;
    cfg.event_schemas.validate()?;
    Ok(cfg)
}

pub fn load_from_path(file_path: &str) -> Result<AppConfig> {
    let raw = fs::read_to_string(file_path)
        .with_context(|| format!("reading config {file_path}"))?;
    let cfg = load_from_str(&raw)
        .with_context(|| format!("loading config {file_path}"))?;
    debug!(path = %file_path, config = ?cfg, "config loaded");
    Ok(cfg)
}
