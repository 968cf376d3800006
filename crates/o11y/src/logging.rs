use once_cell::sync::OnceCell;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt,
};

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Clone, Debug)]
pub struct Config {
    /// Either a simple level like "info" or a full EnvFilter string
    /// e.g. "info,event_schemas=debug,schema_store=warn".
    pub level: Option<String>,
    /// Emit logs as JSON lines when true; otherwise pretty text.
    pub json: bool,
    /// Include target info in logs.
    pub with_targets: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: Some("info".to_owned()),
            json: true,
            with_targets: false,
        }
    }
}

/// Build the filter. `RUST_LOG` wins over the configured level.
fn build_filter(cfg: &Config) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    cfg.level
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber. Subsequent calls are no-ops.
pub fn init(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    INIT.get_or_try_init(|| -> Result<(), Box<dyn std::error::Error>> {
        let _ = LogTracer::init();

        let fmt_layer = if cfg.json {
            fmt::layer()
                .with_target(cfg.with_targets)
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .boxed()
        } else {
            fmt::layer()
                .with_target(cfg.with_targets)
                .with_ansi(true)
                .boxed()
        };

        let subscriber =
            Registry::default().with(build_filter(cfg)).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    })?;
    Ok(())
}
