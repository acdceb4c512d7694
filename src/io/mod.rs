//! # Feature Serialization Protocol
//!
//! Persists a [`FeatureModel`] across save/load cycles while pool
//! identities are reassigned. Each feature with a registered serializer
//! is written to its own named stream through a
//! [`FeatureStreamFactory`]; pool indices are remapped to file-local
//! sequential ids so the stored format never depends on one session's
//! allocation history.
//!
//! Failure policy mirrors the rest of the engine: unknown feature kinds
//! and corrupt per-feature data are skipped with a diagnostic, I/O
//! failures are fatal to the whole save/load operation.

pub mod remap;
pub mod streams;
pub mod scalar;

pub use remap::{FileIdToObjectMap, ObjectToFileIdMap};
pub use scalar::ScalarFeatureSerializer;
pub use streams::{DirStreamFactory, FeatureStreamFactory, MemoryStreamFactory};

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::compute::builtins;
use crate::feature::{Feature, FeatureModel};
use crate::{Error, Result};

// ============================================================================
// FeatureSerializer
// ============================================================================

/// Reads and writes one feature kind's binary representation.
pub trait FeatureSerializer: Send + Sync {
    /// The feature key this serializer handles.
    fn key(&self) -> &str;

    fn serialize(
        &self,
        feature: &dyn Feature,
        remap: &ObjectToFileIdMap,
        out: &mut dyn std::io::Write,
    ) -> Result<()>;

    fn deserialize(
        &self,
        input: &mut dyn std::io::Read,
        remap: &FileIdToObjectMap,
    ) -> Result<Box<dyn Feature>>;
}

// ============================================================================
// SerializerRegistry
// ============================================================================

/// Explicit feature-key → serializer map, built at startup.
#[derive(Default)]
pub struct SerializerRegistry {
    by_key: HashMap<String, Box<dyn FeatureSerializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with serializers for the built-in
    /// computers' features.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for spec in [
            builtins::spot_intensity_spec(),
            builtins::link_displacement_spec(),
            builtins::link_velocity_spec(),
        ] {
            registry
                .register(Box::new(ScalarFeatureSerializer::new(spec)))
                .expect("builtin keys are unique");
        }
        registry
    }

    pub fn register(&mut self, serializer: Box<dyn FeatureSerializer>) -> Result<()> {
        let key = serializer.key().to_string();
        if self.by_key.contains_key(&key) {
            return Err(Error::ConfigError(format!(
                "Serializer already registered for feature '{key}'"
            )));
        }
        self.by_key.insert(key, serializer);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&dyn FeatureSerializer> {
        self.by_key.get(key).map(|s| s.as_ref())
    }
}

// ============================================================================
// Save
// ============================================================================

/// Outcome of a save: which feature keys were written, which were
/// skipped and why.
#[derive(Debug, Default)]
pub struct SaveReport {
    pub written: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

/// Write every feature in the model that has a registered serializer.
///
/// Unregistered feature kinds are skipped with a warning. I/O errors
/// abort the save and propagate; features already written before the
/// failure are intact on their own streams.
pub fn save_features(
    model: &FeatureModel,
    remap: &ObjectToFileIdMap,
    registry: &SerializerRegistry,
    factory: &mut dyn FeatureStreamFactory,
) -> Result<SaveReport> {
    let mut report = SaveReport::default();
    let mut keys: Vec<String> = model.keys().map(str::to_string).collect();
    keys.sort();

    for key in keys {
        let feature = model.get(&key).expect("key from model iteration");
        let Some(serializer) = registry.get(&key) else {
            warn!(feature = %key, "no serializer registered, skipping");
            report.skipped.push((key, "no serializer registered".into()));
            continue;
        };
        let mut stream = factory.create_output_stream(&key)?;
        serializer.serialize(feature, remap, stream.as_mut())?;
        debug!(feature = %key, "feature written");
        report.written.push(key);
    }
    Ok(report)
}

// ============================================================================
// Load
// ============================================================================

/// Outcome of a load: which feature keys were restored, which were
/// skipped and why.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

/// Restore every stored feature with a registered serializer into the
/// model, remapping file-local ids to live objects.
///
/// Unknown keys and corrupt per-feature data are skipped with a
/// diagnostic — one bad feature never blocks the rest. I/O errors are
/// fatal. Listener notification is paused for the duration of the bulk
/// load and delivered coalesced at the end.
pub fn load_features(
    factory: &dyn FeatureStreamFactory,
    remap: &FileIdToObjectMap,
    registry: &SerializerRegistry,
    model: &mut FeatureModel,
) -> Result<LoadReport> {
    model.pause_listeners();
    let result = load_features_inner(factory, remap, registry, model);
    model.resume_listeners();
    result
}

fn load_features_inner(
    factory: &dyn FeatureStreamFactory,
    remap: &FileIdToObjectMap,
    registry: &SerializerRegistry,
    model: &mut FeatureModel,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    let mut keys = factory.stored_keys();
    keys.sort();

    for key in keys {
        let Some(serializer) = registry.get(&key) else {
            warn!(feature = %key, "unknown feature key in container, skipping");
            report.skipped.push((key, "unknown feature key".into()));
            continue;
        };
        let mut stream = factory.open_input_stream(&key)?;
        match serializer.deserialize(stream.as_mut(), remap) {
            Ok(feature) => {
                model.declare(feature);
                report.loaded.push(key);
            }
            Err(e @ Error::SerializationError { .. }) => {
                warn!(feature = %key, error = %e, "corrupt feature data, skipping");
                report.skipped.push((key, e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{
        Dimension, FeatureSpec, Multiplicity, ProjectionKey, ProjectionSpec,
        ScalarFeature, TargetType,
    };
    use crate::graph::spot::unit_covariance;
    use crate::graph::ModelGraph;

    fn single_spec(key: &str) -> FeatureSpec {
        FeatureSpec {
            key: key.into(),
            info: String::new(),
            target: TargetType::Vertex,
            multiplicity: Multiplicity::Single,
            projection_specs: vec![ProjectionSpec::new("V", Dimension::None)],
        }
    }

    fn populated_model(graph: &ModelGraph, keys: &[&str]) -> FeatureModel {
        let mut model = FeatureModel::new();
        for key in keys {
            let mut f = ScalarFeature::new(single_spec(key), 1, "µm", "s");
            for (i, id) in graph.spot_ids().enumerate() {
                f.projection_mut(&ProjectionKey::single("V"))
                    .unwrap()
                    .store
                    .set(id.index, id.generation, i as f64 * 1.5);
            }
            model.declare(Box::new(f));
        }
        model
    }

    fn registry_for(keys: &[&str]) -> SerializerRegistry {
        let mut registry = SerializerRegistry::new();
        for key in keys {
            registry
                .register(Box::new(ScalarFeatureSerializer::new(single_spec(key))))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut graph = ModelGraph::new();
        graph.add_spot(0, [0.0; 3], unit_covariance(1.0));
        graph.add_spot(0, [1.0; 3], unit_covariance(1.0));
        let model = populated_model(&graph, &["A", "B"]);
        let registry = registry_for(&["A", "B"]);
        let mut factory = MemoryStreamFactory::new();

        let fwd = ObjectToFileIdMap::from_graph(&graph);
        let saved = save_features(&model, &fwd, &registry, &mut factory).unwrap();
        assert_eq!(saved.written, vec!["A", "B"]);

        let back = FileIdToObjectMap::from_graph(&graph);
        let mut restored = FeatureModel::new();
        let loaded = load_features(&factory, &back, &registry, &mut restored).unwrap();
        assert_eq!(loaded.loaded, vec!["A", "B"]);
        assert!(loaded.skipped.is_empty());

        for id in graph.spot_ids() {
            let orig = model.get("A").unwrap().projections()[0].value(id.index, id.generation);
            let back = restored.get("A").unwrap().projections()[0].value(id.index, id.generation);
            assert_eq!(orig, back);
        }
    }

    #[test]
    fn test_unregistered_feature_skipped_on_save() {
        let mut graph = ModelGraph::new();
        graph.add_spot(0, [0.0; 3], unit_covariance(1.0));
        let model = populated_model(&graph, &["A", "unregistered"]);
        let registry = registry_for(&["A"]);
        let mut factory = MemoryStreamFactory::new();

        let fwd = ObjectToFileIdMap::from_graph(&graph);
        let report = save_features(&model, &fwd, &registry, &mut factory).unwrap();
        assert_eq!(report.written, vec!["A"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "unregistered");
    }

    #[test]
    fn test_corrupt_feature_does_not_block_others() {
        let mut graph = ModelGraph::new();
        graph.add_spot(0, [0.0; 3], unit_covariance(1.0));
        let model = populated_model(&graph, &["A", "B"]);
        let registry = registry_for(&["A", "B"]);
        let mut factory = MemoryStreamFactory::new();

        let fwd = ObjectToFileIdMap::from_graph(&graph);
        save_features(&model, &fwd, &registry, &mut factory).unwrap();
        // Corrupt one blob wholesale.
        factory.insert_raw("A", vec![0xFF; 10]);

        let back = FileIdToObjectMap::from_graph(&graph);
        let mut restored = FeatureModel::new();
        let report = load_features(&factory, &back, &registry, &mut restored).unwrap();
        assert_eq!(report.loaded, vec!["B"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "A");
        assert!(restored.contains("B"));
        assert!(!restored.contains("A"));
    }

    #[test]
    fn test_unknown_key_in_container_skipped() {
        let graph = ModelGraph::new();
        let registry = registry_for(&["A"]);
        let factory = MemoryStreamFactory::new();
        factory.insert_raw("mystery", vec![1, 2, 3]);

        let back = FileIdToObjectMap::from_graph(&graph);
        let mut restored = FeatureModel::new();
        let report = load_features(&factory, &back, &registry, &mut restored).unwrap();
        assert!(report.loaded.is_empty());
        assert_eq!(report.skipped[0].0, "mystery");
    }

    #[test]
    fn test_load_pauses_listeners() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut graph = ModelGraph::new();
        graph.add_spot(0, [0.0; 3], unit_covariance(1.0));
        let model = populated_model(&graph, &["A"]);
        let registry = registry_for(&["A"]);
        let mut factory = MemoryStreamFactory::new();
        let fwd = ObjectToFileIdMap::from_graph(&graph);
        save_features(&model, &fwd, &registry, &mut factory).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut restored = FeatureModel::new();
        restored.add_listener(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        let back = FileIdToObjectMap::from_graph(&graph);
        load_features(&factory, &back, &registry, &mut restored).unwrap();
        // Delivered coalesced after the load, not during.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builtin_registry() {
        let registry = SerializerRegistry::with_builtins();
        assert!(registry.get(builtins::SPOT_INTENSITY_KEY).is_some());
        assert!(registry.get(builtins::LINK_DISPLACEMENT_KEY).is_some());
        assert!(registry.get(builtins::LINK_VELOCITY_KEY).is_some());
        assert!(registry.get("nope").is_none());
    }
}
