use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use schema_store::SchemaStore;
use schemawatch_config::EventSchemasConfig;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{EventSchemaError, EventSchemaResult};
use crate::flush::FlushReport;
use crate::pipeline::{self, IngestHandle};
use crate::registry::SchemaRegistry;

/// Owns the registry and every background task around it.
///
/// `start` pre-warms the registry (only its cold index when the cache is
/// disabled) and spawns the ingestion workers, the flush loop and the offload
/// loop. `shutdown` stops them and runs a final flush.
pub struct EventSchemaManager {
    registry: Arc<SchemaRegistry>,
    ingest: IngestHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EventSchemaManager {
    pub async fn start(
        config: EventSchemasConfig,
        store: Arc<dyn SchemaStore>,
        cancel: CancellationToken,
    ) -> EventSchemaResult<Self> {
        let registry = Arc::new(
            SchemaRegistry::new(config.clone(), store).with_cancel(cancel.clone()),
        );

        let loaded = if config.disable_cache {
            info!("event schema cache disabled, models reload on first use");
            registry.load_cold_index().await
        } else {
            registry.load_all().await
        };
        loaded.map_err(|e| EventSchemaError::StartupLoad(Box::new(e)))?;

        let (ingest, queue) = pipeline::channel(config.queue_depth, cancel.clone());
        let mut tasks = queue.spawn_workers(registry.clone(), config.workers);
        tasks.push(tokio::spawn(flush_loop(
            registry.clone(),
            config.flush_interval(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(offload_loop(
            registry.clone(),
            config.offload_interval(),
            cancel.clone(),
        )));

        info!(
            workers = config.workers,
            queue_depth = config.queue_depth,
            flush_interval_secs = config.flush_interval_secs,
            offload_interval_secs = config.offload_interval_secs,
            "event schema manager started"
        );

        Ok(Self {
            registry,
            ingest,
            cancel,
            tasks,
        })
    }

    /// Hand a raw `{"batch": [...]}` payload to the workers. Never blocks and
    /// always returns `true`.
    pub fn record_event_schema(&self, write_key: &str, event_batch: &str) -> bool {
        self.ingest.record_event_schema(write_key, event_batch)
    }

    pub fn ingest_handle(&self) -> IngestHandle {
        self.ingest.clone()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn dropped_batches(&self) -> u64 {
        self.ingest.dropped_batches()
    }

    /// Cancel every task, wait for queued batches to drain, then flush.
    pub async fn shutdown(self) -> EventSchemaResult<FlushReport> {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "event schema task failed");
            }
        }
        let report = self.registry.flush().await?;
        info!(
            models = report.models_written,
            versions = report.versions_written,
            dropped_batches = self.ingest.dropped_batches(),
            "event schema manager stopped"
        );
        Ok(report)
    }
}

async fn flush_loop(
    registry: Arc<SchemaRegistry>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = registry.flush().await {
                    warn!(error = %e, kind = e.kind().as_str(), "periodic flush failed");
                }
            }
        }
    }
}

async fn offload_loop(
    registry: Arc<SchemaRegistry>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                registry.offload_idle_models(Utc::now()).await;
            }
        }
    }
}
