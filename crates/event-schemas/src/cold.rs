//! Idle-model offload and on-demand reload.
//!
//! Offloading swaps a hot model (and its versions) for an [`OffloadedModel`]
//! stub. Only flushed models are offloaded, so every stub has durable rows
//! to come back from.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use metrics::counter;
use schema_store::StoreError;
use tracing::{debug, info, warn};

use crate::errors::{EventSchemaError, EventSchemaResult};
use crate::model::{EventModel, ModelKey, OffloadedModel, SchemaVersion};
use crate::registry::{ModelState, SchemaRegistry, VersionState};

impl SchemaRegistry {
    /// Demote hot models not seen since `now - offload_threshold`.
    /// Returns how many were offloaded.
    pub async fn offload_idle_models(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.config.offload_threshold())
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
        else {
            return 0;
        };

        let mut models = self.models.lock().await;
        let mut versions = self.versions.lock().await;

        let idle: Vec<(String, String, ModelKey)> = models
            .hot
            .values()
            .flat_map(|per_key| per_key.values())
            .filter(|m| m.last_seen < cutoff)
            .map(|m| (m.id.clone(), m.write_key.clone(), m.key.clone()))
            .collect();
        if idle.is_empty() {
            return 0;
        }

        let idle_ids: HashSet<&str> = idle.iter().map(|(id, _, _)| id.as_str()).collect();
        let with_dirty_versions = versions.has_dirty(&idle_ids);

        let mut offloaded = 0usize;
        let mut skipped = 0usize;
        for (id, write_key, key) in &idle {
            if models.dirty.contains_key(id) || with_dirty_versions.contains(id) {
                skipped += 1;
                continue;
            }
            let Some(model) = models.remove_hot(write_key, key) else {
                continue;
            };
            let dropped = versions.by_model.remove(id).map_or(0, |v| v.len());
            models.insert_cold(model.stub());
            offloaded += 1;
            debug!(
                write_key = %write_key,
                model_id = %id,
                versions = dropped,
                "offloaded idle event model"
            );
        }

        if offloaded > 0 || skipped > 0 {
            counter!("event_schemas_offloaded_models_total").increment(offloaded as u64);
            info!(offloaded, skipped_dirty = skipped, "offload sweep finished");
        }
        offloaded
    }

    /// Bring an offloaded model and its versions back into the hot maps.
    ///
    /// Runs with both locks held and is bounded by `reload_timeout` and by the
    /// registry's cancellation token. On any failure the stub stays in place
    /// and nothing else changes.
    pub(crate) async fn reload_model(
        &self,
        models: &mut ModelState,
        versions: &mut VersionState,
        stub: &OffloadedModel,
    ) -> EventSchemaResult<()> {
        let timeout = self.config.reload_timeout();
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(model_id = %stub.id, "reload cancelled");
                return Err(StoreError::Cancelled(format!("reload of model {}", stub.id)).into());
            }
            fetched = tokio::time::timeout(timeout, self.fetch_model(stub)) => fetched,
        };

        let (model, model_versions) = match fetched {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                warn!(model_id = %stub.id, error = %e, "reload failed");
                return Err(e);
            }
            Err(_) => {
                warn!(
                    model_id = %stub.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "reload timed out"
                );
                return Err(EventSchemaError::ReloadTimeout {
                    model_id: stub.id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        models.remove_cold(&stub.write_key, &stub.key);
        let restored = model_versions.len();
        models.insert_hot(model);
        for v in model_versions {
            versions.insert(v);
        }

        counter!("event_schemas_reloaded_models_total").increment(1);
        info!(
            write_key = %stub.write_key,
            model_id = %stub.id,
            versions = restored,
            "reloaded offloaded event model"
        );
        Ok(())
    }

    async fn fetch_model(
        &self,
        stub: &OffloadedModel,
    ) -> EventSchemaResult<(EventModel, Vec<SchemaVersion>)> {
        let ids = [stub.id.clone()];
        let sizing = self.sizing();

        let Some(row) = self
            .store
            .load_models(Some(&ids[..]))
            .await?
            .into_iter()
            .find(|r| r.id == stub.id)
        else {
            return Err(EventSchemaError::ReloadMissing {
                model_id: stub.id.clone(),
            });
        };
        let model = EventModel::from_row(row, sizing)?;

        let version_rows = self.store.load_versions(Some(&ids[..])).await?;
        let versions = version_rows
            .into_iter()
            .map(|row| SchemaVersion::from_row(row, sizing))
            .collect::<EventSchemaResult<Vec<_>>>()?;

        Ok((model, versions))
    }
}
