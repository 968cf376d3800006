//! Space-Saving approximate top-k counters.
//!
//! A counter tracks at most `capacity` distinct values. Reported counts never
//! under-estimate: for every tracked value
//! `count - error <= true count <= count`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flatten::FlatEvent;

/// One tracked value, as persisted in private data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CounterEntry {
    pub value: String,
    pub count: u64,
    pub error: u64,
}

/// `(value, count)` pair surfaced in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FrequentValue {
    pub value: String,
    pub count: u64,
}

/// Full state of one field counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CounterSnapshot {
    pub field: String,
    pub capacity: usize,
    pub entries: Vec<CounterEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    count: u64,
    error: u64,
}

#[derive(Debug, Clone)]
pub struct FrequencyCounter {
    capacity: usize,
    tallies: HashMap<String, Tally>,
}

impl FrequencyCounter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tallies: HashMap::with_capacity(capacity),
        }
    }

    /// Replay persisted entries, keeping their error bounds. When more
    /// entries than `capacity` are supplied the highest counts win.
    pub fn rehydrate(
        capacity: usize,
        entries: impl IntoIterator<Item = CounterEntry>,
    ) -> Self {
        let mut entries: Vec<CounterEntry> = entries.into_iter().collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));

        let mut counter = Self::new(capacity);
        for e in entries {
            if counter.tallies.len() >= capacity {
                break;
            }
            counter.tallies.entry(e.value).or_insert(Tally {
                count: e.count,
                error: e.error,
            });
        }
        counter
    }

    pub fn observe(&mut self, value: &str) {
        if let Some(t) = self.tallies.get_mut(value) {
            t.count += 1;
            return;
        }
        if self.tallies.len() < self.capacity {
            self.tallies
                .insert(value.to_string(), Tally { count: 1, error: 0 });
            return;
        }
        let Some((victim, floor)) = self
            .tallies
            .iter()
            .min_by(|(va, ta), (vb, tb)| {
                ta.count.cmp(&tb.count).then_with(|| va.cmp(vb))
            })
            .map(|(v, t)| (v.clone(), t.count))
        else {
            // zero capacity
            return;
        };
        self.tallies.remove(&victim);
        self.tallies.insert(
            value.to_string(),
            Tally {
                count: floor + 1,
                error: floor,
            },
        );
    }

    /// Up to `k` entries, highest count first, ties by value.
    pub fn top_k(&self, k: usize) -> Vec<CounterEntry> {
        let mut out: Vec<CounterEntry> = self
            .tallies
            .iter()
            .map(|(value, t)| CounterEntry {
                value: value.clone(),
                count: t.count,
                error: t.error,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        out.truncate(k);
        out
    }

    pub fn entries(&self) -> Vec<CounterEntry> {
        self.top_k(self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tallies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tallies.is_empty()
    }
}

/// Counter text for a flattened leaf. Strings are taken verbatim, everything
/// else uses its JSON rendering.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lazily created counters, one per field path, owned by one model or
/// schema version.
#[derive(Debug, Clone)]
pub struct FieldCounters {
    capacity: usize,
    fields: BTreeMap<String, FrequencyCounter>,
}

impl FieldCounters {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            fields: BTreeMap::new(),
        }
    }

    pub fn rehydrate(
        capacity: usize,
        snapshots: impl IntoIterator<Item = CounterSnapshot>,
    ) -> Self {
        let fields = snapshots
            .into_iter()
            .map(|s| (s.field, FrequencyCounter::rehydrate(capacity, s.entries)))
            .collect();
        Self { capacity, fields }
    }

    pub fn observe_event(&mut self, flat: &FlatEvent<'_>) {
        for (path, value) in flat {
            let text = value_text(value);
            match self.fields.get_mut(path) {
                Some(counter) => counter.observe(&text),
                None => {
                    let mut counter = FrequencyCounter::new(self.capacity);
                    counter.observe(&text);
                    self.fields.insert(path.clone(), counter);
                }
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&FrequencyCounter> {
        self.fields.get(field)
    }

    /// Field → frequent values, for the metadata blob.
    pub fn frequent_values(&self) -> BTreeMap<String, Vec<FrequentValue>> {
        self.fields
            .iter()
            .map(|(field, counter)| {
                let values = counter
                    .entries()
                    .into_iter()
                    .map(|e| FrequentValue {
                        value: e.value,
                        count: e.count,
                    })
                    .collect();
                (field.clone(), values)
            })
            .collect()
    }

    /// Full counter state, for the private data blob.
    pub fn snapshots(&self) -> Vec<CounterSnapshot> {
        self.fields
            .iter()
            .map(|(field, counter)| CounterSnapshot {
                field: field.clone(),
                capacity: counter.capacity(),
                entries: counter.entries(),
            })
            .collect()
    }
}
