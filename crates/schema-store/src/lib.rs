//! Durable sink for event models and schema versions.
//!
//! The engine treats the store as two opaque tables and talks to it through
//! [`SchemaStore`]: full, identity-only or id-filtered reads at startup and on
//! reload, and a single transactional [`FlushBatch`] write per flush tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod errors;
mod mem_store;

#[cfg(feature = "store-sqlite")]
mod sqlite_store;

pub use errors::{StoreError, StoreResult};
pub use mem_store::MemSchemaStore;

#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteSchemaStore;

pub const EVENT_MODELS_TABLE: &str = "event_models";
pub const SCHEMA_VERSIONS_TABLE: &str = "schema_versions";

/// One row of `event_models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventModelRow {
    pub id: String,
    pub write_key: String,
    pub event_type: String,
    pub event_identifier: String,
    /// Merged field:type map, JSON encoded.
    pub schema: String,
    /// Sampled events, total count and frequent values, JSON encoded.
    pub metadata: String,
    /// Full frequency counter state, JSON encoded.
    pub private_data: String,
    pub last_seen: DateTime<Utc>,
    pub total_count: i64,
}

/// One row of `schema_versions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionRow {
    pub id: String,
    pub event_model_id: String,
    pub schema_hash: String,
    /// Exact field:type map, JSON encoded.
    pub schema: String,
    pub metadata: String,
    pub private_data: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_count: i64,
}

/// Identity columns of an `event_models` row, without the JSON blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentityRow {
    pub id: String,
    pub write_key: String,
    pub event_type: String,
    pub event_identifier: String,
    pub last_seen: DateTime<Utc>,
}

impl From<&EventModelRow> for ModelIdentityRow {
    fn from(row: &EventModelRow) -> Self {
        Self {
            id: row.id.clone(),
            write_key: row.write_key.clone(),
            event_type: row.event_type.clone(),
            event_identifier: row.event_identifier.clone(),
            last_seen: row.last_seen,
        }
    }
}

/// Everything a single flush writes, applied atomically.
///
/// Semantics (upsert-by-replace):
/// 1. delete `event_models` rows whose id is in `models` or `delete_model_ids`
/// 2. delete `schema_versions` rows whose owning model is in `delete_model_ids`
/// 3. delete `schema_versions` rows whose id is in `versions` or `delete_version_ids`
/// 4. insert every row of `models` and `versions`
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    pub models: Vec<EventModelRow>,
    pub versions: Vec<SchemaVersionRow>,
    pub delete_model_ids: Vec<String>,
    pub delete_version_ids: Vec<String>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
            && self.versions.is_empty()
            && self.delete_model_ids.is_empty()
            && self.delete_version_ids.is_empty()
    }
}

#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Read event models, optionally restricted to the given ids.
    async fn load_models(
        &self,
        ids: Option<&[String]>,
    ) -> StoreResult<Vec<EventModelRow>>;

    /// Read the identity of every event model, without decoding any blobs.
    async fn load_model_identities(&self) -> StoreResult<Vec<ModelIdentityRow>>;

    /// Read schema versions, optionally restricted to the given owning models.
    async fn load_versions(
        &self,
        model_ids: Option<&[String]>,
    ) -> StoreResult<Vec<SchemaVersionRow>>;

    /// Apply a flush batch in one transaction. On error nothing is applied.
    async fn write_batch(&self, batch: FlushBatch) -> StoreResult<()>;
}
