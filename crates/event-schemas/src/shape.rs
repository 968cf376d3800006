//! Field → type extraction, schema hashing and the union merge.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::flatten::FlatEvent;

/// Field path → type name. For a merged model schema the value may be a
/// comma separated list of type tokens.
pub type Schema = BTreeMap<String, String>;

pub const TYPE_UNKNOWN: &str = "unknown";
pub const TYPE_BOOL: &str = "bool";
pub const TYPE_NUMBER: &str = "float64";
pub const TYPE_STRING: &str = "string";
pub const TYPE_ARRAY: &str = "array";
pub const TYPE_OBJECT: &str = "object";

const TYPE_SEPARATOR: char = ',';

/// Canonical type name of a flattened leaf. `None` means the field is left
/// out of the schema.
pub fn type_name(value: &Value, capture_unknowns: bool) -> Option<&'static str> {
    match value {
        Value::Null if capture_unknowns => Some(TYPE_UNKNOWN),
        Value::Null => None,
        Value::Bool(_) => Some(TYPE_BOOL),
        Value::Number(_) => Some(TYPE_NUMBER),
        Value::String(_) => Some(TYPE_STRING),
        Value::Array(_) => Some(TYPE_ARRAY),
        Value::Object(_) => Some(TYPE_OBJECT),
    }
}

pub fn extract_schema(flat: &FlatEvent<'_>, capture_unknowns: bool) -> Schema {
    flat.iter()
        .filter_map(|(path, value)| {
            type_name(value, capture_unknowns)
                .map(|ty| (path.clone(), ty.to_string()))
        })
        .collect()
}

/// SHA-256 over `path:type,` for every field in lexicographic path order,
/// lowercase hex. Input order does not matter.
pub fn schema_hash<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut pairs: Vec<(&String, &String)> = fields.into_iter().collect();
    pairs.sort_unstable();

    let mut hasher = Sha256::new();
    for (path, ty) in pairs {
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(ty.as_bytes());
        hasher.update(b",");
    }
    hex::encode(hasher.finalize())
}

/// Add `ty` to a comma separated token list unless it is already one of the
/// tokens. Returns whether the list changed.
pub fn merge_type(existing: &mut String, ty: &str) -> bool {
    if existing.split(TYPE_SEPARATOR).any(|token| token == ty) {
        return false;
    }
    if !existing.is_empty() {
        existing.push(TYPE_SEPARATOR);
    }
    existing.push_str(ty);
    true
}

/// Fold one observed shape into a running union. Fields are never removed.
pub fn merge_schema(union: &mut Schema, shape: &Schema) -> bool {
    let mut changed = false;
    for (path, ty) in shape {
        match union.get_mut(path) {
            Some(existing) => changed |= merge_type(existing, ty),
            None => {
                union.insert(path.clone(), ty.clone());
                changed = true;
            }
        }
    }
    changed
}
