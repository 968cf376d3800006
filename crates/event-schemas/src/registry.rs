//! Two-level in-memory maps of event models and schema versions.
//!
//! `(writeKey, eventType, eventIdentifier) → EventModel` and
//! `(modelId, schemaHash) → SchemaVersion`, plus the bookkeeping the flush and
//! offload loops need: dirty revisions, pending deletions and the cold index.
//!
//! Lock order is always `models` then `versions`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use schema_store::SchemaStore;
use schemawatch_config::EventSchemasConfig;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::errors::{EventSchemaError, EventSchemaResult};
use crate::flatten::flatten_event;
use crate::model::{EventModel, ModelKey, OffloadedModel, SchemaVersion, Sizing};
use crate::shape::{Schema, extract_schema, schema_hash};

const TRACK_EVENT: &str = "track";

/// What a single `handle_event` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub model_id: String,
    pub version_id: String,
    pub new_model: bool,
    pub reloaded_model: bool,
    pub new_version: bool,
    pub evicted_models: Vec<String>,
    pub evicted_versions: Vec<String>,
}

/// Read-only copy of a hot model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelView {
    pub id: String,
    pub write_key: String,
    pub event_type: String,
    pub event_identifier: String,
    pub schema: Schema,
    pub last_seen: DateTime<Utc>,
    pub total_count: u64,
    pub sample: Vec<Value>,
}

impl From<&EventModel> for ModelView {
    fn from(m: &EventModel) -> Self {
        Self {
            id: m.id.clone(),
            write_key: m.write_key.clone(),
            event_type: m.key.event_type.clone(),
            event_identifier: m.key.event_identifier.clone(),
            schema: m.schema.clone(),
            last_seen: m.last_seen,
            total_count: m.total_count(),
            sample: m.sample.items().to_vec(),
        }
    }
}

/// Read-only copy of a hot schema version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionView {
    pub id: String,
    pub model_id: String,
    pub hash: String,
    pub schema: Schema,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_count: u64,
    pub sample: Vec<Value>,
}

impl From<&SchemaVersion> for VersionView {
    fn from(v: &SchemaVersion) -> Self {
        Self {
            id: v.id.clone(),
            model_id: v.model_id.clone(),
            hash: v.hash.clone(),
            schema: v.schema.clone(),
            first_seen: v.first_seen,
            last_seen: v.last_seen,
            total_count: v.total_count(),
            sample: v.sample.items().to_vec(),
        }
    }
}

/// Point-in-time sizes of the registry's maps and sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub hot_models: usize,
    pub cold_models: usize,
    pub versions: usize,
    pub dirty_models: usize,
    pub dirty_versions: usize,
    pub pending_model_deletes: usize,
    pub pending_version_deletes: usize,
}

// ---------------------------------------------------------------------------
// Lock-protected state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct ModelState {
    pub hot: HashMap<String, HashMap<ModelKey, EventModel>>,
    pub cold: HashMap<String, HashMap<ModelKey, OffloadedModel>>,
    /// model id → (writeKey, key) for every hot model.
    pub index: HashMap<String, (String, ModelKey)>,
    /// model id → revision of the latest unflushed change.
    pub dirty: HashMap<String, u64>,
    pub pending_deletes: HashSet<String>,
    revision: u64,
}

impl ModelState {
    pub fn get(&self, write_key: &str, key: &ModelKey) -> Option<&EventModel> {
        self.hot.get(write_key).and_then(|m| m.get(key))
    }

    fn get_mut(
        &mut self,
        write_key: &str,
        key: &ModelKey,
    ) -> Option<&mut EventModel> {
        self.hot.get_mut(write_key).and_then(|m| m.get_mut(key))
    }

    pub fn by_id(&self, id: &str) -> Option<&EventModel> {
        let (write_key, key) = self.index.get(id)?;
        self.get(write_key, key)
    }

    fn stub(&self, write_key: &str, key: &ModelKey) -> Option<&OffloadedModel> {
        self.cold.get(write_key).and_then(|m| m.get(key))
    }

    pub fn insert_hot(&mut self, model: EventModel) {
        self.index
            .insert(model.id.clone(), (model.write_key.clone(), model.key.clone()));
        self.hot
            .entry(model.write_key.clone())
            .or_default()
            .insert(model.key.clone(), model);
    }

    pub fn remove_hot(
        &mut self,
        write_key: &str,
        key: &ModelKey,
    ) -> Option<EventModel> {
        let per_key = self.hot.get_mut(write_key)?;
        let model = per_key.remove(key)?;
        if per_key.is_empty() {
            self.hot.remove(write_key);
        }
        self.index.remove(&model.id);
        Some(model)
    }

    pub fn insert_cold(&mut self, stub: OffloadedModel) {
        self.cold
            .entry(stub.write_key.clone())
            .or_default()
            .insert(stub.key.clone(), stub);
    }

    pub fn remove_cold(
        &mut self,
        write_key: &str,
        key: &ModelKey,
    ) -> Option<OffloadedModel> {
        let per_key = self.cold.get_mut(write_key)?;
        let stub = per_key.remove(key)?;
        if per_key.is_empty() {
            self.cold.remove(write_key);
        }
        Some(stub)
    }

    /// Hot plus cold models under one write key.
    pub fn count(&self, write_key: &str) -> usize {
        self.hot.get(write_key).map_or(0, HashMap::len)
            + self.cold.get(write_key).map_or(0, HashMap::len)
    }

    /// Oldest `lastSeen` across hot and cold entries; ties by key order.
    fn oldest(&self, write_key: &str) -> Option<ModelKey> {
        let hot = self
            .hot
            .get(write_key)
            .into_iter()
            .flat_map(|m| m.values().map(|m| (m.last_seen, &m.key)));
        let cold = self
            .cold
            .get(write_key)
            .into_iter()
            .flat_map(|m| m.values().map(|s| (s.last_seen, &s.key)));
        hot.chain(cold).min().map(|(_, key)| key.clone())
    }

    pub fn mark_dirty(&mut self, id: &str) {
        self.revision += 1;
        self.dirty.insert(id.to_string(), self.revision);
    }

    /// `(id, lastSeen)` of whatever holds a key, hot or cold.
    fn occupant(
        &self,
        write_key: &str,
        key: &ModelKey,
    ) -> Option<(String, DateTime<Utc>)> {
        self.get(write_key, key)
            .map(|m| (m.id.clone(), m.last_seen))
            .or_else(|| self.stub(write_key, key).map(|s| (s.id.clone(), s.last_seen)))
    }

    /// Make room for a stored row `id` under `key` before inserting it.
    ///
    /// One key maps to one model: when the key is already held, the most
    /// recently seen of the two rows wins (the earlier row on a tie) and the
    /// other is queued for deletion. Returns the id that lost, if any.
    pub fn claim_key(
        &mut self,
        write_key: &str,
        key: &ModelKey,
        id: &str,
        last_seen: DateTime<Utc>,
    ) -> Option<String> {
        let (current, current_seen) = self.occupant(write_key, key)?;
        let loser = if current_seen >= last_seen {
            id.to_string()
        } else {
            self.remove_hot(write_key, key);
            self.remove_cold(write_key, key);
            current
        };
        self.pending_deletes.insert(loser.clone());
        Some(loser)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirtyVersion {
    pub model_id: String,
    pub hash: String,
    pub revision: u64,
}

#[derive(Debug, Default)]
pub(crate) struct VersionState {
    pub by_model: HashMap<String, HashMap<String, SchemaVersion>>,
    /// version id → location and revision of the latest unflushed change.
    pub dirty: HashMap<String, DirtyVersion>,
    pub pending_deletes: HashSet<String>,
    revision: u64,
}

impl VersionState {
    pub fn get(&self, model_id: &str, hash: &str) -> Option<&SchemaVersion> {
        self.by_model.get(model_id).and_then(|m| m.get(hash))
    }

    pub fn insert(&mut self, version: SchemaVersion) {
        self.by_model
            .entry(version.model_id.clone())
            .or_default()
            .insert(version.hash.clone(), version);
    }

    pub fn count(&self, model_id: &str) -> usize {
        self.by_model.get(model_id).map_or(0, HashMap::len)
    }

    fn oldest(&self, model_id: &str) -> Option<String> {
        self.by_model
            .get(model_id)?
            .values()
            .map(|v| (v.last_seen, &v.hash))
            .min()
            .map(|(_, hash)| hash.clone())
    }

    pub fn mark_dirty(&mut self, id: &str, model_id: &str, hash: &str) {
        self.revision += 1;
        self.dirty.insert(
            id.to_string(),
            DirtyVersion {
                model_id: model_id.to_string(),
                hash: hash.to_string(),
                revision: self.revision,
            },
        );
    }

    /// Drop every hot version of a model along with its dirty entries.
    pub fn remove_model(&mut self, model_id: &str) -> Vec<SchemaVersion> {
        let Some(versions) = self.by_model.remove(model_id) else {
            return Vec::new();
        };
        versions
            .into_values()
            .inspect(|v| {
                self.dirty.remove(&v.id);
            })
            .collect()
    }

    pub fn has_dirty(&self, model_ids: &HashSet<&str>) -> HashSet<String> {
        self.dirty
            .values()
            .filter(|d| model_ids.contains(d.model_id.as_str()))
            .map(|d| d.model_id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared event schema state. One instance per engine, shared by `Arc`
/// between ingestion workers and the flush and offload loops.
pub struct SchemaRegistry {
    pub(crate) config: EventSchemasConfig,
    pub(crate) store: Arc<dyn SchemaStore>,
    pub(crate) models: Mutex<ModelState>,
    pub(crate) versions: Mutex<VersionState>,
    /// Aborts in-flight reloads on shutdown.
    pub(crate) cancel: CancellationToken,
}

impl SchemaRegistry {
    pub fn new(config: EventSchemasConfig, store: Arc<dyn SchemaStore>) -> Self {
        Self {
            config,
            store,
            models: Mutex::new(ModelState::default()),
            versions: Mutex::new(VersionState::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie reloads to `cancel`: once it fires, a reload in progress gives up
    /// and the event that triggered it is dropped.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EventSchemasConfig {
        &self.config
    }

    pub(crate) fn sizing(&self) -> Sizing {
        Sizing {
            sample_size: self.config.sample_size,
            counter_capacity: self.config.frequency_counter_capacity,
        }
    }

    /// Fold one event into the registry.
    pub async fn handle_event(
        &self,
        write_key: &str,
        event: &Value,
    ) -> EventSchemaResult<Observation> {
        self.handle_event_at(write_key, event, Utc::now()).await
    }

    /// [`Self::handle_event`] with an explicit clock.
    pub async fn handle_event_at(
        &self,
        write_key: &str,
        event: &Value,
        now: DateTime<Utc>,
    ) -> EventSchemaResult<Observation> {
        let key = event_key(event)?;
        let flat = flatten_event(event)?;
        let shape = extract_schema(&flat, self.config.capture_unknowns);
        let hash = schema_hash(&shape);
        let sizing = self.sizing();

        let mut models = self.models.lock().await;
        let mut versions = self.versions.lock().await;
        let mut obs = Observation::default();

        if models.get(write_key, &key).is_none() {
            if let Some(stub) = models.stub(write_key, &key).cloned() {
                self.reload_model(&mut models, &mut versions, &stub).await?;
                obs.reloaded_model = true;
            } else {
                while models.count(write_key) >= self.config.event_model_limit {
                    let Some(evicted) =
                        evict_oldest_model(&mut models, &mut versions, write_key)
                    else {
                        break;
                    };
                    obs.evicted_models.push(evicted);
                }
                let model = EventModel::new(write_key, key.clone(), now, sizing);
                info!(
                    write_key = %write_key,
                    event_type = %key.event_type,
                    event_identifier = %key.event_identifier,
                    model_id = %model.id,
                    "new event model"
                );
                models.insert_hot(model);
                obs.new_model = true;
            }
        }

        let Some(model) = models.get_mut(write_key, &key) else {
            // insert_hot and reload_model both leave the model hot
            return Err(EventSchemaError::malformed(format!(
                "model {}/{} vanished while locked",
                key.event_type, key.event_identifier
            )));
        };
        model.observe(event, &flat, &shape, now);
        let model_id = model.id.clone();
        models.mark_dirty(&model_id);
        obs.model_id = model_id.clone();

        if versions.get(&model_id, &hash).is_none() {
            while versions.count(&model_id)
                >= self.config.schema_version_per_model_limit
            {
                let Some(evicted) = evict_oldest_version(&mut versions, &model_id)
                else {
                    break;
                };
                obs.evicted_versions.push(evicted);
            }
            let version =
                SchemaVersion::new(&model_id, &hash, shape, now, sizing);
            debug!(
                model_id = %model_id,
                version_id = %version.id,
                schema_hash = %hash,
                "new schema version"
            );
            versions.insert(version);
            obs.new_version = true;
        }

        let Some(version) = versions
            .by_model
            .get_mut(&model_id)
            .and_then(|m| m.get_mut(&hash))
        else {
            return Err(EventSchemaError::malformed(format!(
                "schema version {hash} of model {model_id} vanished while locked"
            )));
        };
        version.observe(event, &flat, now);
        obs.version_id = version.id.clone();
        versions.mark_dirty(&obs.version_id, &model_id, &hash);

        trace!(
            write_key = %write_key,
            model_id = %obs.model_id,
            version_id = %obs.version_id,
            "event folded"
        );
        Ok(obs)
    }

    /// Pre-warm the hot maps with every persisted model and version.
    pub async fn load_all(&self) -> EventSchemaResult<()> {
        let model_rows = self.store.load_models(None).await?;
        let version_rows = self.store.load_versions(None).await?;
        let sizing = self.sizing();

        let mut models = self.models.lock().await;
        let mut versions = self.versions.lock().await;

        let mut duplicates = 0usize;
        for row in model_rows {
            let model = EventModel::from_row(row, sizing)?;
            let lost =
                models.claim_key(&model.write_key, &model.key, &model.id, model.last_seen);
            if lost.is_some() {
                duplicates += 1;
            }
            if lost.as_deref() != Some(model.id.as_str()) {
                models.insert_hot(model);
            }
        }
        let mut orphans = 0usize;
        for row in version_rows {
            if models.pending_deletes.contains(&row.event_model_id) {
                continue;
            }
            if !models.index.contains_key(&row.event_model_id) {
                orphans += 1;
                continue;
            }
            versions.insert(SchemaVersion::from_row(row, sizing)?);
        }
        if duplicates > 0 {
            warn!(duplicates, "collapsed event models stored twice under one key");
        }
        if orphans > 0 {
            warn!(orphans, "skipped schema versions without an event model");
        }

        info!(
            models = models.index.len(),
            versions = versions.by_model.values().map(HashMap::len).sum::<usize>(),
            "event schemas loaded from store"
        );
        Ok(())
    }

    /// Register every persisted model as offloaded without decoding it, so
    /// the first event for each key reloads it from the store.
    pub async fn load_cold_index(&self) -> EventSchemaResult<()> {
        let rows = self.store.load_model_identities().await?;

        let mut models = self.models.lock().await;
        let mut duplicates = 0usize;
        for row in rows {
            let key = ModelKey::new(row.event_type, row.event_identifier);
            if let Some(lost) =
                models.claim_key(&row.write_key, &key, &row.id, row.last_seen)
            {
                duplicates += 1;
                if lost == row.id {
                    continue;
                }
            }
            models.insert_cold(OffloadedModel {
                id: row.id,
                write_key: row.write_key,
                key,
                last_seen: row.last_seen,
            });
        }
        if duplicates > 0 {
            warn!(duplicates, "collapsed event models stored twice under one key");
        }

        info!(
            models = models.cold.values().map(HashMap::len).sum::<usize>(),
            "event schema cold index loaded from store"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Hot plus offloaded models for a write key.
    pub async fn model_count(&self, write_key: &str) -> usize {
        self.models.lock().await.count(write_key)
    }

    pub async fn model(
        &self,
        write_key: &str,
        event_type: &str,
        event_identifier: &str,
    ) -> Option<ModelView> {
        let key = ModelKey::new(event_type, event_identifier);
        self.models
            .lock()
            .await
            .get(write_key, &key)
            .map(ModelView::from)
    }

    pub async fn models(&self, write_key: &str) -> Vec<ModelView> {
        let models = self.models.lock().await;
        let mut out: Vec<ModelView> = models
            .hot
            .get(write_key)
            .map(|m| m.values().map(ModelView::from).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| {
            (&a.event_type, &a.event_identifier)
                .cmp(&(&b.event_type, &b.event_identifier))
        });
        out
    }

    pub async fn is_offloaded(
        &self,
        write_key: &str,
        event_type: &str,
        event_identifier: &str,
    ) -> bool {
        let key = ModelKey::new(event_type, event_identifier);
        self.models.lock().await.stub(write_key, &key).is_some()
    }

    /// Hot versions of a model, oldest first.
    pub async fn versions(&self, model_id: &str) -> Vec<VersionView> {
        let _models = self.models.lock().await;
        let versions = self.versions.lock().await;
        let mut out: Vec<VersionView> = versions
            .by_model
            .get(model_id)
            .map(|m| m.values().map(VersionView::from).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| (a.first_seen, &a.hash).cmp(&(b.first_seen, &b.hash)));
        out
    }

    pub async fn stats(&self) -> RegistryStats {
        let models = self.models.lock().await;
        let versions = self.versions.lock().await;
        RegistryStats {
            hot_models: models.index.len(),
            cold_models: models.cold.values().map(HashMap::len).sum(),
            versions: versions.by_model.values().map(HashMap::len).sum(),
            dirty_models: models.dirty.len(),
            dirty_versions: versions.dirty.len(),
            pending_model_deletes: models.pending_deletes.len(),
            pending_version_deletes: versions.pending_deletes.len(),
        }
    }
}

/// `(type, identifier)` of an event. Only `track` events carry an identifier.
fn event_key(event: &Value) -> EventSchemaResult<ModelKey> {
    let Some(raw_type) = event.get("type") else {
        return Err(EventSchemaError::malformed("event has no type"));
    };
    let Some(event_type) = raw_type.as_str() else {
        return Err(EventSchemaError::malformed("event type is not a string"));
    };
    if event_type != TRACK_EVENT {
        return Ok(ModelKey::new(event_type, ""));
    }
    match event.get("event").and_then(Value::as_str) {
        Some(identifier) => Ok(ModelKey::new(event_type, identifier)),
        None => Err(EventSchemaError::malformed(
            "track event has no string event name",
        )),
    }
}

/// Permanently delete the oldest model of a write key, hot or cold.
fn evict_oldest_model(
    models: &mut ModelState,
    versions: &mut VersionState,
    write_key: &str,
) -> Option<String> {
    let key = models.oldest(write_key)?;
    let id = match models.remove_hot(write_key, &key) {
        Some(model) => model.id,
        None => models.remove_cold(write_key, &key)?.id,
    };
    models.dirty.remove(&id);
    models.pending_deletes.insert(id.clone());
    // The store drops a deleted model's versions with it.
    let dropped = versions.remove_model(&id);

    counter!("event_schemas_evicted_models_total").increment(1);
    info!(
        write_key = %write_key,
        model_id = %id,
        event_type = %key.event_type,
        event_identifier = %key.event_identifier,
        versions = dropped.len(),
        "evicted event model at capacity"
    );
    Some(id)
}

fn evict_oldest_version(
    versions: &mut VersionState,
    model_id: &str,
) -> Option<String> {
    let hash = versions.oldest(model_id)?;
    let version = versions.by_model.get_mut(model_id)?.remove(&hash)?;
    versions.dirty.remove(&version.id);
    versions.pending_deletes.insert(version.id.clone());

    counter!("event_schemas_dropped_schema_versions_total").increment(1);
    debug!(
        model_id = %model_id,
        version_id = %version.id,
        schema_hash = %hash,
        "dropped schema version at capacity"
    );
    Some(version.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use schema_store::MemSchemaStore;
    use serde_json::json;

    fn registry(cfg: EventSchemasConfig) -> SchemaRegistry {
        SchemaRegistry::new(cfg, Arc::new(MemSchemaStore::new()))
    }

    #[test]
    fn event_key_rules() {
        assert_eq!(
            event_key(&json!({"type": "track", "event": "login"})).unwrap(),
            ModelKey::new("track", "login")
        );
        // identifier ignored for non-track events
        assert_eq!(
            event_key(&json!({"type": "identify", "event": "x"})).unwrap(),
            ModelKey::new("identify", "")
        );
        for bad in [
            json!({"event": "login"}),
            json!({"type": 5}),
            json!({"type": "track"}),
            json!({"type": "track", "event": 1}),
        ] {
            assert_eq!(event_key(&bad).unwrap_err().kind(), ErrorKind::MalformedInput);
        }
    }

    #[tokio::test]
    async fn repeated_shape_reuses_version() {
        let reg = registry(EventSchemasConfig::default());
        let e = json!({"type": "track", "event": "login", "email": "a@x"});

        let first = reg.handle_event("wk", &e).await.unwrap();
        assert!(first.new_model && first.new_version);

        let second = reg.handle_event("wk", &e).await.unwrap();
        assert!(!second.new_model && !second.new_version);
        assert_eq!(first.model_id, second.model_id);
        assert_eq!(first.version_id, second.version_id);

        let versions = reg.versions(&first.model_id).await;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].total_count, 2);
    }

    #[tokio::test]
    async fn oldest_model_ties_break_on_key() {
        let reg = registry(EventSchemasConfig {
            event_model_limit: 2,
            ..Default::default()
        });
        let t0 = Utc::now();
        reg.handle_event_at("wk", &json!({"type": "page"}), t0).await.unwrap();
        reg.handle_event_at("wk", &json!({"type": "identify"}), t0)
            .await
            .unwrap();
        let obs = reg
            .handle_event_at("wk", &json!({"type": "screen"}), t0 + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(obs.evicted_models.len(), 1);
        assert!(reg.model("wk", "identify", "").await.is_none());
        assert!(reg.model("wk", "page", "").await.is_some());
        assert_eq!(reg.model_count("wk").await, 2);
    }

    #[tokio::test]
    async fn write_keys_are_isolated() {
        let reg = registry(EventSchemasConfig {
            event_model_limit: 1,
            ..Default::default()
        });
        reg.handle_event("a", &json!({"type": "page"})).await.unwrap();
        let obs = reg.handle_event("b", &json!({"type": "page"})).await.unwrap();
        assert!(obs.evicted_models.is_empty());
        assert_eq!(reg.model_count("a").await, 1);
        assert_eq!(reg.model_count("b").await, 1);
    }

    #[tokio::test]
    async fn malformed_event_changes_nothing() {
        let reg = registry(EventSchemasConfig::default());
        let err = reg
            .handle_event("wk", &json!({"type": "track", "props": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput);
        assert_eq!(reg.stats().await, RegistryStats::default());
    }
}
