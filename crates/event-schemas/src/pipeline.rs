//! Bounded ingestion queue and worker pool.
//!
//! Producers call [`IngestHandle::record_event_schema`], which never blocks:
//! a full (or shut down) queue drops the batch and counts it. Workers decode
//! each batch and fold its events into the registry one by one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::errors::{ErrorKind, EventSchemaError};
use crate::registry::SchemaRegistry;

/// One raw batch as handed over by the gateway.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub write_key: String,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    #[serde(alias = "Batch")]
    batch: Vec<Value>,
}

/// Producer side of the ingestion queue. Cheap to clone.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<BatchJob>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, turned into workers with [`IngestQueue::spawn_workers`].
pub struct IngestQueue {
    rx: mpsc::Receiver<BatchJob>,
    cancel: CancellationToken,
}

/// Create a queue holding at most `depth` batches.
pub fn channel(depth: usize, cancel: CancellationToken) -> (IngestHandle, IngestQueue) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        IngestHandle {
            tx,
            cancel: cancel.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        IngestQueue { rx, cancel },
    )
}

impl IngestHandle {
    /// Enqueue a batch without waiting. Always returns `true`; drops are
    /// visible only through [`Self::dropped_batches`] and metrics.
    pub fn record_event_schema(&self, write_key: &str, event_batch: &str) -> bool {
        if let Err(e) = self.try_enqueue(write_key, event_batch) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("event_schemas_dropped_batches_total").increment(1);
            debug!(write_key = %write_key, error = %e, "event batch dropped");
        }
        true
    }

    fn try_enqueue(&self, write_key: &str, event_batch: &str) -> Result<(), EventSchemaError> {
        if self.cancel.is_cancelled() {
            return Err(EventSchemaError::Overload);
        }
        self.tx
            .try_send(BatchJob {
                write_key: write_key.to_string(),
                payload: event_batch.to_string(),
            })
            .map_err(|_| EventSchemaError::Overload)?;
        counter!("event_schemas_batches_received_total").increment(1);
        Ok(())
    }

    /// Batches dropped since this queue was created.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl IngestQueue {
    /// Spawn `workers` tasks sharing the queue.
    ///
    /// On cancellation each worker drains what is already queued and exits.
    pub fn spawn_workers(
        self,
        registry: Arc<SchemaRegistry>,
        workers: usize,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(self.rx));
        (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    registry.clone(),
                    rx.clone(),
                    self.cancel.clone(),
                ))
            })
            .collect()
    }
}

async fn worker_loop(
    worker: usize,
    registry: Arc<SchemaRegistry>,
    rx: Arc<Mutex<mpsc::Receiver<BatchJob>>>,
    cancel: CancellationToken,
) {
    trace!(worker, "ingestion worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            break;
        };
        process_batch(&registry, &job).await;
    }

    // drain
    loop {
        let job = rx.lock().await.try_recv();
        let Ok(job) = job else {
            break;
        };
        process_batch(&registry, &job).await;
    }
    trace!(worker, "ingestion worker stopped");
}

/// Decode one batch and fold every event in order. Returns how many events
/// were applied.
pub async fn process_batch(registry: &SchemaRegistry, job: &BatchJob) -> usize {
    let batch: EventBatch = match serde_json::from_str(&job.payload) {
        Ok(b) => b,
        Err(e) => {
            counter!(
                "event_schemas_events_rejected_total",
                "reason" => ErrorKind::MalformedInput.as_str()
            )
            .increment(1);
            warn!(write_key = %job.write_key, error = %e, "undecodable event batch");
            return 0;
        }
    };

    let mut applied = 0usize;
    for event in &batch.batch {
        match registry.handle_event(&job.write_key, event).await {
            Ok(_) => {
                applied += 1;
                counter!("event_schemas_events_processed_total").increment(1);
            }
            Err(e) => {
                let kind = e.kind();
                counter!("event_schemas_events_rejected_total", "reason" => kind.as_str())
                    .increment(1);
                match kind {
                    ErrorKind::MalformedInput => {
                        debug!(write_key = %job.write_key, error = %e, "event dropped")
                    }
                    _ => warn!(write_key = %job.write_key, error = %e, "event dropped"),
                }
            }
        }
    }
    applied
}
