use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;

static INSTALLED: OnceCell<()> = OnceCell::new();

#[derive(Clone, Debug)]
pub struct Config {
    pub enable: bool,
    pub http_listener: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable: true,
            http_listener: Some(([0, 0, 0, 0], 9000).into()),
        }
    }
}

/// Install the Prometheus recorder. Must run inside a tokio runtime when an
/// HTTP listener is configured so the exporter is spawned onto it.
pub fn init(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if !cfg.enable {
        return Ok(());
    }

    if INSTALLED.get().is_none() {
        let mut builder = PrometheusBuilder::new();
        if let Some(addr) = cfg.http_listener {
            builder = builder.with_http_listener(addr);
        }
        builder.install()?;
        INSTALLED.set(()).ok();
        tracing::info!(listener = ?cfg.http_listener, "prometheus exporter installed");
    }

    describe_metrics();

    Ok(())
}

pub fn describe_metrics() {
    describe_counter!(
        "event_schemas_batches_received_total",
        Unit::Count,
        "Event batches accepted into the ingestion queue"
    );
    describe_counter!(
        "event_schemas_dropped_batches_total",
        Unit::Count,
        "Event batches dropped because the ingestion queue was full"
    );
    describe_counter!(
        "event_schemas_events_processed_total",
        Unit::Count,
        "Events folded into an event model and schema version"
    );
    describe_counter!(
        "event_schemas_events_rejected_total",
        Unit::Count,
        "Events dropped by the registry, by reason"
    );
    describe_counter!(
        "event_schemas_evicted_models_total",
        Unit::Count,
        "Event models deleted to stay under the per write key limit"
    );
    describe_counter!(
        "event_schemas_dropped_schema_versions_total",
        Unit::Count,
        "Schema versions deleted to stay under the per model limit"
    );
    describe_counter!(
        "event_schemas_offloaded_models_total",
        Unit::Count,
        "Idle event models moved to the cold index"
    );
    describe_counter!(
        "event_schemas_reloaded_models_total",
        Unit::Count,
        "Event models restored from the store on demand"
    );
    describe_counter!(
        "event_schemas_flush_total",
        Unit::Count,
        "Flush transactions, by status"
    );
    describe_gauge!(
        "event_schemas_update_event_model_count",
        Unit::Count,
        "Event model rows written or deleted by the last flush"
    );
    describe_gauge!(
        "event_schemas_update_schema_version_count",
        Unit::Count,
        "Schema version rows written or deleted by the last flush"
    );
    describe_histogram!(
        "event_schemas_flush_latency_seconds",
        Unit::Seconds,
        "Time spent in the flush transaction"
    );
    describe_counter!(
        "schemawatch_panics_total",
        Unit::Count,
        "Panics captured by the process hook"
    );
}
