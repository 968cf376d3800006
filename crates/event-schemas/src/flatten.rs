//! Nested event → flat `dotted.path → value` map.
//!
//! Objects are expanded recursively. Arrays, scalars and empty objects are
//! leaves, so `{"context": {"app": {"name": "x"}}, "tags": [1]}` becomes
//! `context.app.name` and `tags`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::errors::{EventSchemaError, EventSchemaResult};

/// Leaves of one event, keyed by path. Borrowed from the decoded event.
pub type FlatEvent<'a> = BTreeMap<String, &'a Value>;

const SEPARATOR: char = '.';

pub fn flatten_event(event: &Value) -> EventSchemaResult<FlatEvent<'_>> {
    let Value::Object(map) = event else {
        return Err(EventSchemaError::malformed("event is not a JSON object"));
    };
    let mut out = FlatEvent::new();
    flatten_into(map, None, &mut out);
    Ok(out)
}

fn flatten_into<'a>(
    map: &'a Map<String, Value>,
    prefix: Option<&str>,
    out: &mut FlatEvent<'a>,
) {
    for (key, value) in map {
        let path = match prefix {
            Some(p) => format!("{p}{SEPARATOR}{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                flatten_into(inner, Some(path.as_str()), out)
            }
            leaf => {
                out.insert(path, leaf);
            }
        }
    }
}
