//! Periodic persistence of dirty entities and pending deletions.
//!
//! A flush snapshots rows under both locks, writes them in one store
//! transaction with the locks released, then re-locks to acknowledge. Only
//! dirty entries whose revision did not move during the write are cleared.

use std::time::Instant;

use metrics::{counter, gauge, histogram};
use schema_store::FlushBatch;
use tracing::{debug, info, warn};

use crate::errors::EventSchemaResult;
use crate::registry::SchemaRegistry;

/// Row counts written by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub models_written: usize,
    pub versions_written: usize,
    pub models_deleted: usize,
    pub versions_deleted: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        *self == FlushReport::default()
    }
}

struct Snapshot {
    batch: FlushBatch,
    model_revisions: Vec<(String, u64)>,
    version_revisions: Vec<(String, u64)>,
}

impl SchemaRegistry {
    /// Write everything dirty since the last successful flush.
    ///
    /// On error nothing is acknowledged, so the next call retries the same
    /// entities (with whatever changed since).
    pub async fn flush(&self) -> EventSchemaResult<FlushReport> {
        let snapshot = self.snapshot_dirty().await?;
        if snapshot.batch.is_empty() {
            debug!("nothing to flush");
            return Ok(FlushReport::default());
        }

        let report = FlushReport {
            models_written: snapshot.batch.models.len(),
            versions_written: snapshot.batch.versions.len(),
            models_deleted: snapshot.batch.delete_model_ids.len(),
            versions_deleted: snapshot.batch.delete_version_ids.len(),
        };
        let Snapshot {
            batch,
            model_revisions,
            version_revisions,
        } = snapshot;
        let deleted_models = batch.delete_model_ids.clone();
        let deleted_versions = batch.delete_version_ids.clone();

        let started = Instant::now();
        let written = self.store.write_batch(batch).await;
        histogram!("event_schemas_flush_latency_seconds")
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = written {
            counter!("event_schemas_flush_total", "status" => "error").increment(1);
            warn!(
                error = %e,
                models = report.models_written,
                versions = report.versions_written,
                "flush failed, dirty state kept for retry"
            );
            return Err(e.into());
        }

        let mut models = self.models.lock().await;
        let mut versions = self.versions.lock().await;
        for (id, revision) in model_revisions {
            if models.dirty.get(&id) == Some(&revision) {
                models.dirty.remove(&id);
            }
        }
        for (id, revision) in version_revisions {
            if versions.dirty.get(&id).map(|d| d.revision) == Some(revision) {
                versions.dirty.remove(&id);
            }
        }
        for id in &deleted_models {
            models.pending_deletes.remove(id);
        }
        for id in &deleted_versions {
            versions.pending_deletes.remove(id);
        }
        drop(versions);
        drop(models);

        counter!("event_schemas_flush_total", "status" => "ok").increment(1);
        gauge!("event_schemas_update_event_model_count")
            .set((report.models_written + report.models_deleted) as f64);
        gauge!("event_schemas_update_schema_version_count")
            .set((report.versions_written + report.versions_deleted) as f64);
        info!(
            models = report.models_written,
            versions = report.versions_written,
            deleted_models = report.models_deleted,
            deleted_versions = report.versions_deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "event schemas flushed"
        );
        Ok(report)
    }

    async fn snapshot_dirty(&self) -> EventSchemaResult<Snapshot> {
        let mut models = self.models.lock().await;
        let mut versions = self.versions.lock().await;

        let mut batch = FlushBatch::default();
        let mut model_revisions = Vec::with_capacity(models.dirty.len());
        let mut stale_models = Vec::new();
        for (id, revision) in &models.dirty {
            match models.by_id(id) {
                Some(model) => {
                    batch.models.push(model.to_row()?);
                    model_revisions.push((id.clone(), *revision));
                }
                None => stale_models.push(id.clone()),
            }
        }

        let mut version_revisions = Vec::with_capacity(versions.dirty.len());
        let mut stale_versions = Vec::new();
        for (id, dirty) in &versions.dirty {
            match versions.get(&dirty.model_id, &dirty.hash) {
                Some(version) if &version.id == id => {
                    batch.versions.push(version.to_row()?);
                    version_revisions.push((id.clone(), dirty.revision));
                }
                _ => stale_versions.push(id.clone()),
            }
        }

        // Entries with nothing left to write.
        if !stale_models.is_empty() || !stale_versions.is_empty() {
            warn!(
                models = stale_models.len(),
                versions = stale_versions.len(),
                "dropping dirty entries without a hot entity"
            );
            for id in stale_models {
                models.dirty.remove(&id);
            }
            for id in stale_versions {
                versions.dirty.remove(&id);
            }
        }

        batch.delete_model_ids = models.pending_deletes.iter().cloned().collect();
        batch.delete_version_ids =
            versions.pending_deletes.iter().cloned().collect();

        Ok(Snapshot {
            batch,
            model_revisions,
            version_revisions,
        })
    }
}
