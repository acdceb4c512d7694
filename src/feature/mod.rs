//! # Feature & Projection Model
//!
//! A *feature* is a named, derived attribute over spots or links. It
//! exposes one or more scalar *projections* (e.g. "Mean", "Std"), each
//! with physical units. Multiplicity describes how projections multiply
//! with image channels: one set per feature, one per channel, or one per
//! channel pair.
//!
//! Design rule: NO image types, NO computer types here. This module is
//! pure model — computers fill features in, serializers move them across
//! save/load, the [`FeatureModel`] registry holds them.

pub mod model;

pub use model::{FeatureModel, FeatureModelEvent};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::graph::PoolIndex;
use crate::store::DoublePropertyStore;

// ============================================================================
// Target & multiplicity
// ============================================================================

/// What kind of object a feature is defined on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    Vertex,
    Edge,
}

/// How a feature's projections multiply with image channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Multiplicity {
    /// One value per object.
    Single,
    /// One value per object per channel.
    OnSources,
    /// One value per object per unordered channel pair.
    OnSourcePairs,
}

impl Multiplicity {
    /// The channel index tuples a projection is instantiated for.
    pub fn channel_sets(self, n_channels: u32) -> Vec<SmallVec<[u32; 2]>> {
        match self {
            Multiplicity::Single => vec![SmallVec::new()],
            Multiplicity::OnSources => (0..n_channels).map(|c| SmallVec::from_slice(&[c])).collect(),
            Multiplicity::OnSourcePairs => {
                let mut sets = Vec::new();
                for c1 in 0..n_channels {
                    for c2 in (c1 + 1)..n_channels {
                        sets.push(SmallVec::from_slice(&[c1, c2]));
                    }
                }
                sets
            }
        }
    }
}

// ============================================================================
// Dimensions & units
// ============================================================================

/// Physical dimension of a projection, resolved to a unit string against
/// the dataset's space and time units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    None,
    Length,
    Velocity,
    Intensity,
    IntensitySquared,
    Time,
}

impl Dimension {
    pub fn units(self, space_unit: &str, time_unit: &str) -> String {
        match self {
            Dimension::None => String::new(),
            Dimension::Length => space_unit.to_string(),
            Dimension::Velocity => format!("{space_unit}/{time_unit}"),
            Dimension::Intensity => "Counts".to_string(),
            Dimension::IntensitySquared => "Counts²".to_string(),
            Dimension::Time => time_unit.to_string(),
        }
    }
}

// ============================================================================
// Specs
// ============================================================================

/// Declares one projection of a feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectionSpec {
    pub key: String,
    pub dimension: Dimension,
}

impl ProjectionSpec {
    pub fn new(key: impl Into<String>, dimension: Dimension) -> Self {
        Self { key: key.into(), dimension }
    }
}

/// Declares a feature: its unique key, target, multiplicity, and the
/// projections it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    /// Unique string key, e.g. `"Spot gaussian-filtered intensity"`.
    pub key: String,
    /// Human-readable description.
    pub info: String,
    pub target: TargetType,
    pub multiplicity: Multiplicity,
    pub projection_specs: Vec<ProjectionSpec>,
}

/// Unique key of a projection inside a feature: the projection spec key
/// plus the channel indices it is instantiated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectionKey {
    pub key: String,
    pub channels: SmallVec<[u32; 2]>,
}

impl ProjectionKey {
    /// Key for a `Multiplicity::Single` projection.
    pub fn single(key: impl Into<String>) -> Self {
        Self { key: key.into(), channels: SmallVec::new() }
    }

    /// Key for a `Multiplicity::OnSources` projection on one channel.
    pub fn on_source(key: impl Into<String>, channel: u32) -> Self {
        Self { key: key.into(), channels: SmallVec::from_slice(&[channel]) }
    }

    /// Key for a `Multiplicity::OnSourcePairs` projection.
    pub fn on_source_pair(key: impl Into<String>, c1: u32, c2: u32) -> Self {
        Self { key: key.into(), channels: SmallVec::from_slice(&[c1, c2]) }
    }
}

impl std::fmt::Display for ProjectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)?;
        for c in &self.channels {
            write!(f, " ch{c}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A single named scalar view within a feature.
pub trait Projection: Send + Sync {
    fn key(&self) -> &ProjectionKey;
    fn units(&self) -> &str;
    fn value(&self, index: PoolIndex, generation: u32) -> Option<f64>;
    fn is_set(&self, index: PoolIndex, generation: u32) -> bool {
        self.value(index, generation).is_some()
    }
}

/// A computed feature: a spec plus the projections holding its values.
pub trait Feature: Send {
    fn spec(&self) -> &FeatureSpec;
    fn projection(&self, key: &ProjectionKey) -> Option<&dyn Projection>;
    fn projections(&self) -> Vec<&dyn Projection>;
    /// Drop any value stored for one object.
    fn invalidate(&mut self, index: PoolIndex, generation: u32);
    /// Drop every value before the owning pool recycles indices en masse.
    fn before_clear_pool(&mut self);
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

// ============================================================================
// ScalarFeature — the standard store-backed implementation
// ============================================================================

/// One projection backed by a [`DoublePropertyStore`].
#[derive(Debug, Clone)]
pub struct ScalarProjection {
    key: ProjectionKey,
    units: String,
    pub store: DoublePropertyStore,
}

impl ScalarProjection {
    pub fn new(key: ProjectionKey, units: impl Into<String>) -> Self {
        Self { key, units: units.into(), store: DoublePropertyStore::new() }
    }
}

impl Projection for ScalarProjection {
    fn key(&self) -> &ProjectionKey {
        &self.key
    }

    fn units(&self) -> &str {
        &self.units
    }

    fn value(&self, index: PoolIndex, generation: u32) -> Option<f64> {
        self.store.get(index, generation)
    }
}

/// The standard feature implementation: one scalar store per projection
/// per channel set, laid out per the spec's multiplicity.
#[derive(Debug, Clone)]
pub struct ScalarFeature {
    spec: FeatureSpec,
    n_channels: u32,
    projections: Vec<ScalarProjection>,
}

impl ScalarFeature {
    /// Allocate empty stores for every projection of the spec, one per
    /// channel set implied by the multiplicity.
    pub fn new(spec: FeatureSpec, n_channels: u32, space_unit: &str, time_unit: &str) -> Self {
        let mut projections = Vec::new();
        for pspec in &spec.projection_specs {
            for channels in spec.multiplicity.channel_sets(n_channels) {
                let key = ProjectionKey { key: pspec.key.clone(), channels };
                let units = pspec.dimension.units(space_unit, time_unit);
                projections.push(ScalarProjection::new(key, units));
            }
        }
        Self { spec, n_channels, projections }
    }

    /// Rebuild a feature with explicit per-projection-spec unit strings,
    /// as recovered from serialized data. `units` parallels
    /// `spec.projection_specs`.
    pub fn with_projection_units(spec: FeatureSpec, n_channels: u32, units: &[String]) -> Self {
        let mut projections = Vec::new();
        for (pspec, unit) in spec.projection_specs.iter().zip(units) {
            for channels in spec.multiplicity.channel_sets(n_channels) {
                let key = ProjectionKey { key: pspec.key.clone(), channels };
                projections.push(ScalarProjection::new(key, unit.clone()));
            }
        }
        Self { spec, n_channels, projections }
    }

    pub fn n_channels(&self) -> u32 {
        self.n_channels
    }

    pub fn projection_mut(&mut self, key: &ProjectionKey) -> Option<&mut ScalarProjection> {
        self.projections.iter_mut().find(|p| &p.key == key)
    }

    pub fn scalar_projections(&self) -> &[ScalarProjection] {
        &self.projections
    }

    pub fn scalar_projections_mut(&mut self) -> &mut [ScalarProjection] {
        &mut self.projections
    }
}

impl Feature for ScalarFeature {
    fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    fn projection(&self, key: &ProjectionKey) -> Option<&dyn Projection> {
        self.projections
            .iter()
            .find(|p| &p.key == key)
            .map(|p| p as &dyn Projection)
    }

    fn projections(&self) -> Vec<&dyn Projection> {
        self.projections.iter().map(|p| p as &dyn Projection).collect()
    }

    fn invalidate(&mut self, index: PoolIndex, generation: u32) {
        for p in &mut self.projections {
            p.store.remove(index, generation);
        }
    }

    fn before_clear_pool(&mut self) {
        for p in &mut self.projections {
            p.store.before_clear_pool();
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
