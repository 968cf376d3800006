//! Online event schema inference and sampling.
//!
//! Event batches are queued per write key, flattened, typed and hashed. Each
//! distinct `(writeKey, eventType, eventIdentifier)` gets an [`EventModel`]
//! holding the union of every shape seen, and each distinct shape under it a
//! [`SchemaVersion`]. Both keep a reservoir sample and Space-Saving value
//! counters, are bounded by per-key limits, offloaded when idle, and flushed
//! to a [`schema_store::SchemaStore`] on an interval.

mod cold;
mod errors;
pub mod flatten;
mod flush;
pub mod frequency;
mod manager;
mod model;
pub mod pipeline;
mod registry;
pub mod reservoir;
pub mod shape;

pub use errors::{ErrorKind, EventSchemaError, EventSchemaResult};
pub use flush::FlushReport;
pub use manager::EventSchemaManager;
pub use model::{EventModel, ModelKey, OffloadedModel, SchemaVersion};
pub use pipeline::{BatchJob, IngestHandle, IngestQueue};
pub use registry::{
    ModelView, Observation, RegistryStats, SchemaRegistry, VersionView,
};
