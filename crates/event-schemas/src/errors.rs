use std::borrow::Cow;

use schema_store::StoreError;
use thiserror::Error;

/// Closed classification of everything that can go wrong in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad JSON or a missing/invalid type or identifier. The event is dropped.
    MalformedInput,
    /// Ingestion queue full. The batch is dropped.
    Overload,
    /// Store failure that the next flush or event may not hit again.
    StorageTransient,
    /// Persisted state cannot be trusted.
    StorageFatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::Overload => "overload",
            ErrorKind::StorageTransient => "storage_transient",
            ErrorKind::StorageFatal => "storage_fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum EventSchemaError {
    #[error("malformed input: {details}")]
    MalformedInput { details: Cow<'static, str> },

    #[error("ingestion queue full")]
    Overload,

    #[error("store error: {0}")]
    Storage(#[from] StoreError),

    #[error("reload of model {model_id} timed out after {timeout_ms}ms")]
    ReloadTimeout { model_id: String, timeout_ms: u64 },

    #[error("model {model_id} has no durable row to reload")]
    ReloadMissing { model_id: String },

    #[error("corrupt {what} for {id}: {details}")]
    Corrupt {
        what: &'static str,
        id: String,
        details: String,
    },

    #[error("startup load failed: {0}")]
    StartupLoad(Box<EventSchemaError>),
}

impl EventSchemaError {
    pub(crate) fn malformed(details: impl Into<Cow<'static, str>>) -> Self {
        EventSchemaError::MalformedInput {
            details: details.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EventSchemaError::MalformedInput { .. } => ErrorKind::MalformedInput,
            EventSchemaError::Overload => ErrorKind::Overload,
            EventSchemaError::Storage(_)
            | EventSchemaError::ReloadTimeout { .. } => {
                ErrorKind::StorageTransient
            }
            EventSchemaError::ReloadMissing { .. }
            | EventSchemaError::Corrupt { .. }
            | EventSchemaError::StartupLoad(_) => ErrorKind::StorageFatal,
        }
    }
}

impl From<serde_json::Error> for EventSchemaError {
    fn from(e: serde_json::Error) -> Self {
        EventSchemaError::malformed(e.to_string())
    }
}

pub type EventSchemaResult<T> = Result<T, EventSchemaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_the_taxonomy() {
        assert_eq!(
            EventSchemaError::malformed("no type").kind(),
            ErrorKind::MalformedInput
        );
        assert_eq!(EventSchemaError::Overload.kind(), ErrorKind::Overload);
        assert_eq!(
            EventSchemaError::from(StoreError::Database("locked".into())).kind(),
            ErrorKind::StorageTransient
        );
        let startup = EventSchemaError::StartupLoad(Box::new(
            EventSchemaError::Storage(StoreError::Database("gone".into())),
        ));
        assert_eq!(startup.kind(), ErrorKind::StorageFatal);
        assert_eq!(startup.kind().as_str(), "storage_fatal");
    }

    #[test]
    fn bad_json_is_malformed() {
        let err: EventSchemaError =
            serde_json::from_str::<serde_json::Value>("{nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::MalformedInput);
    }
}
