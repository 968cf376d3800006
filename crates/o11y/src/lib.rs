pub mod logging;
pub mod sw_metrics;
pub mod panic;

use schemawatch_config::{LoggingCfg, MetricsCfg};

/// Top-level config for observability.
#[derive(Clone, Debug)]
pub struct O11yConfig {
    pub logging: logging::Config,
    pub metrics: sw_metrics::Config,
    pub install_panic_hook: bool,
}

impl Default for O11yConfig {
    fn default() -> Self {
        Self {
            logging: logging::Config::default(),
            metrics: sw_metrics::Config::default(),
            install_panic_hook: true,
        }
    }
}

impl O11yConfig {
    /// Build from the `logging` / `metrics` sections of the app config.
    pub fn from_app(logging: &LoggingCfg, metrics: &MetricsCfg) -> Self {
        Self {
            logging: logging::Config {
                level: logging.level.clone(),
                json: logging.json,
                with_targets: logging.with_targets,
            },
            metrics: sw_metrics::Config {
                enable: metrics.enabled,
                http_listener: Some(metrics.listen),
            },
            install_panic_hook: true,
        }
    }
}

pub fn init_all(cfg: &O11yConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&cfg.logging)?;
    sw_metrics::init(&cfg.metrics)?;
    if cfg.install_panic_hook {
        panic::install_hook("schemawatch");
    }
    Ok(())
}
