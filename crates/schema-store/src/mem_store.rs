use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    EventModelRow, FlushBatch, ModelIdentityRow, SchemaStore, SchemaVersionRow, StoreError,
    StoreResult,
};

#[derive(Default)]
struct Tables {
    models: BTreeMap<String, EventModelRow>,
    versions: BTreeMap<String, SchemaVersionRow>,
}

/// Process-local store.
///
/// Besides backing `store.type: memory`, it can inject write failures and
/// read or write latency so flush retries, flush races and reload timeouts
/// can be exercised.
#[derive(Default)]
pub struct MemSchemaStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicUsize,
    load_delay_ms: AtomicU64,
    write_delay_ms: AtomicU64,
    commits: AtomicUsize,
}

impl MemSchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `write_batch` fail without applying anything.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Delay every load call by `delay`.
    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every `write_batch` call by `delay` before anything is applied.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successfully committed batches.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn models(&self) -> Vec<EventModelRow> {
        self.tables.lock().models.values().cloned().collect()
    }

    pub fn versions(&self) -> Vec<SchemaVersionRow> {
        self.tables.lock().versions.values().cloned().collect()
    }

    /// Drop a model row behind the engine's back.
    pub fn remove_model(&self, id: &str) -> bool {
        self.tables.lock().models.remove(id).is_some()
    }

    async fn apply_load_delay(&self) {
        sleep_ms(self.load_delay_ms.load(Ordering::SeqCst)).await;
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

async fn sleep_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl SchemaStore for MemSchemaStore {
    async fn load_models(
        &self,
        ids: Option<&[String]>,
    ) -> StoreResult<Vec<EventModelRow>> {
        self.apply_load_delay().await;
        let tables = self.tables.lock();
        Ok(match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| tables.models.get(id).cloned())
                .collect(),
            None => tables.models.values().cloned().collect(),
        })
    }

    async fn load_model_identities(&self) -> StoreResult<Vec<ModelIdentityRow>> {
        self.apply_load_delay().await;
        Ok(self
            .tables
            .lock()
            .models
            .values()
            .map(ModelIdentityRow::from)
            .collect())
    }

    async fn load_versions(
        &self,
        model_ids: Option<&[String]>,
    ) -> StoreResult<Vec<SchemaVersionRow>> {
        self.apply_load_delay().await;
        let tables = self.tables.lock();
        let filter: Option<HashSet<&str>> =
            model_ids.map(|ids| ids.iter().map(String::as_str).collect());
        Ok(tables
            .versions
            .values()
            .filter(|v| {
                filter
                    .as_ref()
                    .is_none_or(|f| f.contains(v.event_model_id.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn write_batch(&self, batch: FlushBatch) -> StoreResult<()> {
        sleep_ms(self.write_delay_ms.load(Ordering::SeqCst)).await;
        if self.take_injected_failure() {
            return Err(StoreError::Injected("write_batch".into()));
        }

        let mut tables = self.tables.lock();
        for id in batch
            .models
            .iter()
            .map(|m| &m.id)
            .chain(batch.delete_model_ids.iter())
        {
            tables.models.remove(id);
        }
        if !batch.delete_model_ids.is_empty() {
            let dropped: HashSet<&str> =
                batch.delete_model_ids.iter().map(String::as_str).collect();
            tables
                .versions
                .retain(|_, v| !dropped.contains(v.event_model_id.as_str()));
        }
        for id in batch
            .versions
            .iter()
            .map(|v| &v.id)
            .chain(batch.delete_version_ids.iter())
        {
            tables.versions.remove(id);
        }
        for row in batch.models {
            tables.models.insert(row.id.clone(), row);
        }
        for row in batch.versions {
            tables.versions.insert(row.id.clone(), row);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn model(id: &str) -> EventModelRow {
        EventModelRow {
            id: id.into(),
            write_key: "wk".into(),
            event_type: "track".into(),
            event_identifier: id.into(),
            schema: "{}".into(),
            metadata: "{}".into(),
            private_data: "{}".into(),
            last_seen: Utc::now(),
            total_count: 1,
        }
    }

    fn version(id: &str, model_id: &str) -> SchemaVersionRow {
        SchemaVersionRow {
            id: id.into(),
            event_model_id: model_id.into(),
            schema_hash: format!("hash-{id}"),
            schema: "{}".into(),
            metadata: "{}".into(),
            private_data: "{}".into(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            total_count: 1,
        }
    }

    #[tokio::test]
    async fn injected_failure_applies_nothing() {
        let store = MemSchemaStore::new();
        store.fail_next_writes(1);

        let batch = FlushBatch {
            models: vec![model("m1")],
            ..Default::default()
        };
        assert!(store.write_batch(batch.clone()).await.is_err());
        assert!(store.models().is_empty());
        assert_eq!(store.commits(), 0);

        store.write_batch(batch).await.unwrap();
        assert_eq!(store.models().len(), 1);
        assert_eq!(store.commits(), 1);
    }

    #[tokio::test]
    async fn deleting_model_drops_its_versions() {
        let store = MemSchemaStore::new();
        store
            .write_batch(FlushBatch {
                models: vec![model("m1"), model("m2")],
                versions: vec![version("v1", "m1"), version("v2", "m2")],
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .write_batch(FlushBatch {
                delete_model_ids: vec!["m1".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let models = store.load_models(None).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "m2");
        let versions = store.load_versions(None).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].id, "v2");
    }

    #[tokio::test]
    async fn filtered_loads() {
        let store = MemSchemaStore::new();
        store
            .write_batch(FlushBatch {
                models: vec![model("m1"), model("m2")],
                versions: vec![
                    version("v1", "m1"),
                    version("v2", "m1"),
                    version("v3", "m2"),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let only = store.load_models(Some(&["m2".to_string()])).await.unwrap();
        assert_eq!(only.len(), 1);
        let vs = store
            .load_versions(Some(&["m1".to_string()]))
            .await
            .unwrap();
        assert_eq!(vs.len(), 2);
        assert!(vs.iter().all(|v| v.event_model_id == "m1"));

        let ids = store.load_model_identities().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].id, "m1");
        assert_eq!(ids[1].event_identifier, "m2");
    }

    #[tokio::test]
    async fn write_delay_holds_the_batch_back() {
        let store = std::sync::Arc::new(MemSchemaStore::new());
        store.set_write_delay(Duration::from_millis(100));

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .write_batch(FlushBatch {
                        models: vec![model("m1")],
                        ..Default::default()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.models().is_empty());

        writer.await.unwrap().unwrap();
        assert_eq!(store.models().len(), 1);
    }
}
