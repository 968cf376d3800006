//! Offload / reload tests.
//!
//! Covers: idle offload, dirty models staying hot, reload round trip,
//! reload timeout and cancellation, reload of a model whose rows vanished,
//! the identity-only cold index used when the cache is disabled.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use event_schemas::{ErrorKind, EventSchemaError, Observation, SchemaRegistry};
use pretty_assertions::assert_eq;
use schema_store::{EventModelRow, FlushBatch, MemSchemaStore, SchemaStore, StoreError};
use schemawatch_config::EventSchemasConfig;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn setup(cfg: EventSchemasConfig) -> (Arc<SchemaRegistry>, Arc<MemSchemaStore>) {
    let store = Arc::new(MemSchemaStore::new());
    let registry = Arc::new(SchemaRegistry::new(
        cfg,
        store.clone() as Arc<dyn SchemaStore>,
    ));
    (registry, store)
}

fn cfg() -> EventSchemasConfig {
    EventSchemasConfig {
        offload_threshold_secs: 60,
        reload_timeout_ms: 100,
        ..Default::default()
    }
}

fn login() -> Value {
    json!({"type": "track", "event": "login", "email": "a@x", "plan": "pro"})
}

/// Observe `login` at `t0`, flush, and offload it.
async fn offloaded(reg: &SchemaRegistry, t0: DateTime<Utc>) -> Observation {
    let obs = reg.handle_event_at("wk", &login(), t0).await.unwrap();
    reg.flush().await.unwrap();
    assert_eq!(reg.offload_idle_models(t0 + Duration::seconds(120)).await, 1);
    obs
}

#[tokio::test]
async fn idle_model_moves_to_cold_index() {
    let (reg, _) = setup(cfg());
    let t0 = Utc::now();
    let obs = offloaded(&reg, t0).await;

    assert!(reg.model("wk", "track", "login").await.is_none());
    assert!(reg.is_offloaded("wk", "track", "login").await);
    assert!(reg.versions(&obs.model_id).await.is_empty());
    assert_eq!(reg.model_count("wk").await, 1);

    let stats = reg.stats().await;
    assert_eq!(stats.hot_models, 0);
    assert_eq!(stats.cold_models, 1);
    assert_eq!(stats.versions, 0);
}

#[tokio::test]
async fn recent_models_stay_hot() {
    let (reg, _) = setup(cfg());
    let t0 = Utc::now();
    reg.handle_event_at("wk", &login(), t0).await.unwrap();
    reg.flush().await.unwrap();
    assert_eq!(reg.offload_idle_models(t0 + Duration::seconds(30)).await, 0);
    assert!(reg.model("wk", "track", "login").await.is_some());
}

#[tokio::test]
async fn dirty_models_are_not_offloaded() {
    let (reg, _) = setup(cfg());
    let t0 = Utc::now();
    reg.handle_event_at("wk", &login(), t0).await.unwrap();

    assert_eq!(reg.offload_idle_models(t0 + Duration::seconds(120)).await, 0);
    assert!(!reg.is_offloaded("wk", "track", "login").await);

    reg.flush().await.unwrap();
    assert_eq!(reg.offload_idle_models(t0 + Duration::seconds(120)).await, 1);
}

#[tokio::test]
async fn reload_restores_identity_and_lineage() {
    let (reg, _) = setup(cfg());
    let t0 = Utc::now();
    let before = offloaded(&reg, t0).await;

    let after = reg
        .handle_event_at("wk", &login(), t0 + Duration::seconds(130))
        .await
        .unwrap();

    assert!(after.reloaded_model);
    assert!(!after.new_model && !after.new_version);
    assert_eq!(after.model_id, before.model_id);
    assert_eq!(after.version_id, before.version_id);
    assert!(!reg.is_offloaded("wk", "track", "login").await);

    let model = reg.model("wk", "track", "login").await.unwrap();
    assert_eq!(model.total_count, 2);
    assert_eq!(model.sample.len(), 2);
    assert_eq!(model.event_type, "track");
    assert_eq!(model.event_identifier, "login");

    let versions = reg.versions(&model.id).await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].total_count, 2);
    assert_eq!(versions[0].first_seen, t0);
}

#[tokio::test]
async fn reload_brings_back_every_version() {
    let (reg, _) = setup(cfg());
    let t0 = Utc::now();
    let a = reg
        .handle_event_at("wk", &json!({"type": "identify", "a": 1}), t0)
        .await
        .unwrap();
    let b = reg
        .handle_event_at("wk", &json!({"type": "identify", "b": 1}), t0)
        .await
        .unwrap();
    reg.flush().await.unwrap();
    reg.offload_idle_models(t0 + Duration::seconds(120)).await;

    let c = reg
        .handle_event_at(
            "wk",
            &json!({"type": "identify", "c": 1}),
            t0 + Duration::seconds(121),
        )
        .await
        .unwrap();
    assert!(c.reloaded_model && c.new_version);

    let mut ids: Vec<String> = reg
        .versions(&a.model_id)
        .await
        .into_iter()
        .map(|v| v.id)
        .collect();
    ids.sort();
    let mut expected = vec![a.version_id, b.version_id, c.version_id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn reload_timeout_drops_event_and_keeps_stub() {
    let (reg, store) = setup(cfg());
    let t0 = Utc::now();
    offloaded(&reg, t0).await;
    let stats_before = reg.stats().await;

    store.set_load_delay(StdDuration::from_millis(1_000));
    let err = reg
        .handle_event_at("wk", &login(), t0 + Duration::seconds(130))
        .await
        .unwrap_err();

    assert!(matches!(err, EventSchemaError::ReloadTimeout { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::StorageTransient);
    assert!(reg.is_offloaded("wk", "track", "login").await);
    assert_eq!(reg.stats().await, stats_before);

    // once the store is responsive again the model comes back
    store.set_load_delay(StdDuration::ZERO);
    let obs = reg
        .handle_event_at("wk", &login(), t0 + Duration::seconds(140))
        .await
        .unwrap();
    assert!(obs.reloaded_model);
    assert_eq!(reg.model("wk", "track", "login").await.unwrap().total_count, 2);
}

#[tokio::test]
async fn reload_stops_on_cancellation() {
    let store = Arc::new(MemSchemaStore::new());
    let cancel = CancellationToken::new();
    let reg = Arc::new(
        SchemaRegistry::new(
            EventSchemasConfig {
                reload_timeout_ms: 10_000,
                ..cfg()
            },
            store.clone() as Arc<dyn SchemaStore>,
        )
        .with_cancel(cancel.clone()),
    );
    let t0 = Utc::now();
    offloaded(&reg, t0).await;

    store.set_load_delay(StdDuration::from_secs(10));
    let pending = {
        let reg = reg.clone();
        tokio::spawn(async move {
            let event = login();
            reg.handle_event_at("wk", &event, t0 + Duration::seconds(130))
                .await
        })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    cancel.cancel();

    let err = tokio::time::timeout(StdDuration::from_secs(2), pending)
        .await
        .expect("reload outlived cancellation")
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, EventSchemaError::Storage(StoreError::Cancelled(_))),
        "{err}"
    );
    assert_eq!(err.kind(), ErrorKind::StorageTransient);
    assert!(reg.is_offloaded("wk", "track", "login").await);
    assert_eq!(reg.stats().await.hot_models, 0);
}

#[tokio::test]
async fn reload_of_missing_row_drops_event() {
    let (reg, store) = setup(cfg());
    let t0 = Utc::now();
    let obs = offloaded(&reg, t0).await;

    assert!(store.remove_model(&obs.model_id));
    let err = reg
        .handle_event_at("wk", &login(), t0 + Duration::seconds(130))
        .await
        .unwrap_err();

    assert!(matches!(err, EventSchemaError::ReloadMissing { .. }), "{err}");
    assert!(reg.is_offloaded("wk", "track", "login").await);
    assert!(reg.model("wk", "track", "login").await.is_none());
    assert_eq!(reg.stats().await.dirty_models, 0);
}

#[tokio::test]
async fn other_keys_proceed_while_a_model_is_cold() {
    let (reg, _) = setup(cfg());
    let t0 = Utc::now();
    offloaded(&reg, t0).await;

    let obs = reg
        .handle_event_at("wk", &json!({"type": "page"}), t0 + Duration::seconds(130))
        .await
        .unwrap();
    assert!(obs.new_model && !obs.reloaded_model);
    assert!(reg.is_offloaded("wk", "track", "login").await);
}

#[tokio::test]
async fn disabled_cache_reloads_the_persisted_model() {
    let (first, store) = setup(cfg());
    let seen = first.handle_event("wk", &login()).await.unwrap();
    first.flush().await.unwrap();

    let second = SchemaRegistry::new(
        EventSchemasConfig {
            disable_cache: true,
            ..cfg()
        },
        store.clone() as Arc<dyn SchemaStore>,
    );
    second.load_cold_index().await.unwrap();
    assert!(second.is_offloaded("wk", "track", "login").await);
    assert_eq!(second.stats().await.hot_models, 0);

    let obs = second.handle_event("wk", &login()).await.unwrap();
    assert!(obs.reloaded_model);
    assert!(!obs.new_model && !obs.new_version);
    assert_eq!(obs.model_id, seen.model_id);
    assert_eq!(obs.version_id, seen.version_id);

    second.flush().await.unwrap();
    let rows = store.models();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_count, 2);
    assert_eq!(store.versions().len(), 1);
}

fn login_row(id: &str, last_seen: DateTime<Utc>) -> EventModelRow {
    EventModelRow {
        id: id.into(),
        write_key: "wk".into(),
        event_type: "track".into(),
        event_identifier: "login".into(),
        schema: r#"{"event":"string","type":"string"}"#.into(),
        metadata: "{}".into(),
        private_data: "{}".into(),
        last_seen,
        total_count: 1,
    }
}

#[tokio::test]
async fn cold_index_collapses_duplicate_keys_to_the_newest() {
    let (reg, store) = setup(cfg());
    let t0 = Utc::now();
    // identities come back in id order, so the newer row is read first
    store
        .write_batch(FlushBatch {
            models: vec![
                login_row("m-new", t0 + Duration::seconds(1)),
                login_row("m-old", t0),
            ],
            ..Default::default()
        })
        .await
        .unwrap();

    reg.load_cold_index().await.unwrap();
    let stats = reg.stats().await;
    assert_eq!(stats.cold_models, 1);
    assert_eq!(stats.pending_model_deletes, 1);
    assert_eq!(reg.model_count("wk").await, 1);

    let obs = reg
        .handle_event_at("wk", &login(), t0 + Duration::seconds(5))
        .await
        .unwrap();
    assert!(obs.reloaded_model);
    assert_eq!(obs.model_id, "m-new");

    let report = reg.flush().await.unwrap();
    assert_eq!(report.models_deleted, 1);
    let ids: Vec<String> = store.models().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["m-new".to_string()]);
}
