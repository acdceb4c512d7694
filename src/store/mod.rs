//! # Property Stores
//!
//! Sparse per-pooled-object scalar storage with an explicit unset
//! sentinel: `NaN` for `f64` stores, `-1` for non-negative integer
//! stores. The sentinel distinguishes "never computed" from "computed to
//! zero" — a distinction the incremental engine depends on.
//!
//! Stores are keyed by generation-tagged ids, so a value written for an
//! object can never be read back through a recycled slot's new occupant.
//! Thread safety is the caller's responsibility; the parallel engine
//! serializes writes with its own lock.

use crate::graph::PoolIndex;

// ============================================================================
// DoublePropertyStore
// ============================================================================

/// Dense-backed `f64` store. `NaN` marks unset slots.
#[derive(Debug, Clone, Default)]
pub struct DoublePropertyStore {
    values: Vec<f64>,
    gens: Vec<u32>,
}

impl DoublePropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the backing vectors for a pool of `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: vec![f64::NAN; capacity],
            gens: vec![0; capacity],
        }
    }

    pub fn get(&self, index: PoolIndex, generation: u32) -> Option<f64> {
        let i = index as usize;
        if i < self.values.len() && self.gens[i] == generation && !self.values[i].is_nan() {
            Some(self.values[i])
        } else {
            None
        }
    }

    pub fn is_set(&self, index: PoolIndex, generation: u32) -> bool {
        self.get(index, generation).is_some()
    }

    /// Store a value. `NaN` input is rejected — use [`remove`](Self::remove).
    pub fn set(&mut self, index: PoolIndex, generation: u32, value: f64) {
        debug_assert!(!value.is_nan(), "NaN is the unset sentinel");
        let i = index as usize;
        if i >= self.values.len() {
            self.values.resize(i + 1, f64::NAN);
            self.gens.resize(i + 1, 0);
        }
        self.values[i] = value;
        self.gens[i] = generation;
    }

    pub fn remove(&mut self, index: PoolIndex, generation: u32) {
        let i = index as usize;
        if i < self.values.len() && self.gens[i] == generation {
            self.values[i] = f64::NAN;
        }
    }

    pub fn clear(&mut self) {
        self.values.fill(f64::NAN);
    }

    /// Invalidate everything before the owning pool recycles its indices
    /// en masse.
    pub fn before_clear_pool(&mut self) {
        self.clear();
    }

    /// Number of set entries.
    pub fn num_set(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }

    /// Set `(index, generation, value)` triples in slot order.
    pub fn iter_set(&self) -> impl Iterator<Item = (PoolIndex, u32, f64)> + '_ {
        self.values.iter().enumerate().filter_map(|(i, v)| {
            (!v.is_nan()).then_some((i as PoolIndex, self.gens[i], *v))
        })
    }
}

// ============================================================================
// IntPropertyStore
// ============================================================================

/// Dense-backed store for non-negative integers. `-1` marks unset slots.
#[derive(Debug, Clone, Default)]
pub struct IntPropertyStore {
    values: Vec<i64>,
    gens: Vec<u32>,
}

impl IntPropertyStore {
    pub const UNSET: i64 = -1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: vec![Self::UNSET; capacity],
            gens: vec![0; capacity],
        }
    }

    pub fn get(&self, index: PoolIndex, generation: u32) -> Option<i64> {
        let i = index as usize;
        if i < self.values.len() && self.gens[i] == generation && self.values[i] != Self::UNSET {
            Some(self.values[i])
        } else {
            None
        }
    }

    pub fn is_set(&self, index: PoolIndex, generation: u32) -> bool {
        self.get(index, generation).is_some()
    }

    pub fn set(&mut self, index: PoolIndex, generation: u32, value: i64) {
        debug_assert!(value >= 0, "-1 is the unset sentinel; values must be non-negative");
        let i = index as usize;
        if i >= self.values.len() {
            self.values.resize(i + 1, Self::UNSET);
            self.gens.resize(i + 1, 0);
        }
        self.values[i] = value;
        self.gens[i] = generation;
    }

    pub fn remove(&mut self, index: PoolIndex, generation: u32) {
        let i = index as usize;
        if i < self.values.len() && self.gens[i] == generation {
            self.values[i] = Self::UNSET;
        }
    }

    pub fn clear(&mut self) {
        self.values.fill(Self::UNSET);
    }

    pub fn before_clear_pool(&mut self) {
        self.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
