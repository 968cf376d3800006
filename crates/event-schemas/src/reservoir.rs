//! Fixed-capacity uniform sample over an unbounded stream.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Reservoir sample (Algorithm R) with a running total.
///
/// Every counted item seen so far is retained with probability
/// `capacity / total`. A sample rebuilt with [`ReservoirSample::resume`]
/// keeps weighting new items against the persisted total, so the guarantee
/// holds across restarts and offload/reload cycles.
#[derive(Debug, Clone)]
pub struct ReservoirSample<T> {
    capacity: usize,
    items: Vec<T>,
    total: u64,
    rng: StdRng,
}

impl<T> ReservoirSample<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_rng(capacity, StdRng::from_entropy())
    }

    /// Deterministic sampler, for tests and reproducible runs.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self::with_rng(capacity, StdRng::seed_from_u64(seed))
    }

    fn with_rng(capacity: usize, rng: StdRng) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity),
            total: 0,
            rng,
        }
    }

    /// Rebuild from a persisted sample and the historical total.
    ///
    /// Seeded items do not count toward the total; the total is clamped to at
    /// least the number of items actually kept.
    pub fn resume(
        capacity: usize,
        seed: impl IntoIterator<Item = T>,
        total: u64,
    ) -> Self {
        let mut sample = Self::new(capacity);
        for item in seed {
            sample.add(item, false);
        }
        sample.total = total.max(sample.items.len() as u64);
        sample
    }

    /// Offer one item.
    ///
    /// With `count` the total is incremented and, once full, the item replaces
    /// a random slot with probability `capacity / total`. Without `count`
    /// ("seed only") the item is kept only while there is free room.
    pub fn add(&mut self, item: T, count: bool) {
        if count {
            self.total += 1;
        }
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        if !count || self.capacity == 0 {
            return;
        }
        let slot = self.rng.gen_range(0..self.total);
        if slot < self.capacity as u64 {
            self.items[slot as usize] = item;
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
