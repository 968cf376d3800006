//! In-memory entities and their persisted row form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schema_store::{EventModelRow, SchemaVersionRow};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{EventSchemaError, EventSchemaResult};
use crate::flatten::FlatEvent;
use crate::frequency::{CounterSnapshot, FieldCounters, FrequentValue};
use crate::reservoir::ReservoirSample;
use crate::shape::{Schema, merge_schema};

/// `(eventType, eventIdentifier)` within one write key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub event_type: String,
    pub event_identifier: String,
}

impl ModelKey {
    pub fn new(
        event_type: impl Into<String>,
        event_identifier: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_identifier: event_identifier.into(),
        }
    }
}

/// Sizing shared by every model and version.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sizing {
    pub sample_size: usize,
    pub counter_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct MetadataBlob {
    #[serde(default)]
    pub sampled_events: Vec<Value>,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub frequent_values: BTreeMap<String, Vec<FrequentValue>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PrivateDataBlob {
    #[serde(default)]
    pub frequency_counters: Vec<CounterSnapshot>,
}

fn encode<T: Serialize>(
    what: &'static str,
    id: &str,
    value: &T,
) -> EventSchemaResult<String> {
    serde_json::to_string(value).map_err(|e| EventSchemaError::Corrupt {
        what,
        id: id.to_string(),
        details: e.to_string(),
    })
}

fn decode<T: DeserializeOwned + Default>(
    what: &'static str,
    id: &str,
    raw: &str,
) -> EventSchemaResult<T> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|e| EventSchemaError::Corrupt {
        what,
        id: id.to_string(),
        details: e.to_string(),
    })
}

fn metadata_of(
    sample: &ReservoirSample<Value>,
    counters: &FieldCounters,
) -> MetadataBlob {
    MetadataBlob {
        sampled_events: sample.items().to_vec(),
        total_count: sample.total(),
        frequent_values: counters.frequent_values(),
    }
}

fn private_data_of(counters: &FieldCounters) -> PrivateDataBlob {
    PrivateDataBlob {
        frequency_counters: counters.snapshots(),
    }
}

fn resume_sample(
    sizing: Sizing,
    metadata: MetadataBlob,
    row_total: i64,
) -> ReservoirSample<Value> {
    let total = u64::try_from(row_total)
        .unwrap_or(0)
        .max(metadata.total_count);
    ReservoirSample::resume(sizing.sample_size, metadata.sampled_events, total)
}

// ---------------------------------------------------------------------------
// EventModel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EventModel {
    pub id: String,
    pub write_key: String,
    pub key: ModelKey,
    /// Union of every shape seen under this model.
    pub schema: Schema,
    pub last_seen: DateTime<Utc>,
    pub sample: ReservoirSample<Value>,
    pub counters: FieldCounters,
}

impl EventModel {
    pub(crate) fn new(
        write_key: &str,
        key: ModelKey,
        now: DateTime<Utc>,
        sizing: Sizing,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            write_key: write_key.to_string(),
            key,
            schema: Schema::new(),
            last_seen: now,
            sample: ReservoirSample::new(sizing.sample_size),
            counters: FieldCounters::new(sizing.counter_capacity),
        }
    }

    pub(crate) fn observe(
        &mut self,
        event: &Value,
        flat: &FlatEvent<'_>,
        shape: &Schema,
        now: DateTime<Utc>,
    ) {
        merge_schema(&mut self.schema, shape);
        self.counters.observe_event(flat);
        self.sample.add(event.clone(), true);
        self.last_seen = now;
    }

    pub fn total_count(&self) -> u64 {
        self.sample.total()
    }

    pub(crate) fn stub(&self) -> OffloadedModel {
        OffloadedModel {
            id: self.id.clone(),
            write_key: self.write_key.clone(),
            key: self.key.clone(),
            last_seen: self.last_seen,
        }
    }

    pub(crate) fn to_row(&self) -> EventSchemaResult<EventModelRow> {
        Ok(EventModelRow {
            id: self.id.clone(),
            write_key: self.write_key.clone(),
            event_type: self.key.event_type.clone(),
            event_identifier: self.key.event_identifier.clone(),
            schema: encode("model schema", &self.id, &self.schema)?,
            metadata: encode(
                "model metadata",
                &self.id,
                &metadata_of(&self.sample, &self.counters),
            )?,
            private_data: encode(
                "model private data",
                &self.id,
                &private_data_of(&self.counters),
            )?,
            last_seen: self.last_seen,
            total_count: i64::try_from(self.total_count()).unwrap_or(i64::MAX),
        })
    }

    pub(crate) fn from_row(
        row: EventModelRow,
        sizing: Sizing,
    ) -> EventSchemaResult<Self> {
        let schema: Schema = decode("model schema", &row.id, &row.schema)?;
        let metadata: MetadataBlob =
            decode("model metadata", &row.id, &row.metadata)?;
        let private: PrivateDataBlob =
            decode("model private data", &row.id, &row.private_data)?;

        Ok(Self {
            sample: resume_sample(sizing, metadata, row.total_count),
            counters: FieldCounters::rehydrate(
                sizing.counter_capacity,
                private.frequency_counters,
            ),
            key: ModelKey::new(row.event_type, row.event_identifier),
            id: row.id,
            write_key: row.write_key,
            schema,
            last_seen: row.last_seen,
        })
    }
}

// ---------------------------------------------------------------------------
// SchemaVersion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchemaVersion {
    pub id: String,
    pub model_id: String,
    pub hash: String,
    /// Exact shape; hashes to `hash`.
    pub schema: Schema,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample: ReservoirSample<Value>,
    pub counters: FieldCounters,
}

impl SchemaVersion {
    pub(crate) fn new(
        model_id: &str,
        hash: &str,
        schema: Schema,
        now: DateTime<Utc>,
        sizing: Sizing,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            hash: hash.to_string(),
            schema,
            first_seen: now,
            last_seen: now,
            sample: ReservoirSample::new(sizing.sample_size),
            counters: FieldCounters::new(sizing.counter_capacity),
        }
    }

    pub(crate) fn observe(
        &mut self,
        event: &Value,
        flat: &FlatEvent<'_>,
        now: DateTime<Utc>,
    ) {
        self.counters.observe_event(flat);
        self.sample.add(event.clone(), true);
        self.last_seen = now;
    }

    pub fn total_count(&self) -> u64 {
        self.sample.total()
    }

    pub(crate) fn to_row(&self) -> EventSchemaResult<SchemaVersionRow> {
        Ok(SchemaVersionRow {
            id: self.id.clone(),
            event_model_id: self.model_id.clone(),
            schema_hash: self.hash.clone(),
            schema: encode("version schema", &self.id, &self.schema)?,
            metadata: encode(
                "version metadata",
                &self.id,
                &metadata_of(&self.sample, &self.counters),
            )?,
            private_data: encode(
                "version private data",
                &self.id,
                &private_data_of(&self.counters),
            )?,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            total_count: i64::try_from(self.total_count()).unwrap_or(i64::MAX),
        })
    }

    pub(crate) fn from_row(
        row: SchemaVersionRow,
        sizing: Sizing,
    ) -> EventSchemaResult<Self> {
        let schema: Schema = decode("version schema", &row.id, &row.schema)?;
        let metadata: MetadataBlob =
            decode("version metadata", &row.id, &row.metadata)?;
        let private: PrivateDataBlob =
            decode("version private data", &row.id, &row.private_data)?;

        Ok(Self {
            sample: resume_sample(sizing, metadata, row.total_count),
            counters: FieldCounters::rehydrate(
                sizing.counter_capacity,
                private.frequency_counters,
            ),
            id: row.id,
            model_id: row.event_model_id,
            hash: row.schema_hash,
            schema,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
        })
    }
}

/// Identity of a model whose full record lives only in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadedModel {
    pub id: String,
    pub write_key: String,
    pub key: ModelKey,
    pub last_seen: DateTime<Utc>,
}
