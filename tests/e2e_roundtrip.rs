//! End-to-end tests for feature persistence across sessions.
//!
//! Saves computed features through a stream factory, then reloads them
//! into a second session whose pools allocated different indices for the
//! same logical objects. Values must follow the objects, not the indices.

use proptest::prelude::*;

use trackfeat::compute::builtins::{
    self, LINK_DISPLACEMENT_KEY, LINK_VELOCITY_KEY, SPOT_INTENSITY_KEY,
};
use trackfeat::feature::ScalarFeature;
use trackfeat::graph::spot::unit_covariance;
use trackfeat::image::ConstantImage;
use trackfeat::io::{
    load_features, save_features, FileIdToObjectMap, MemoryStreamFactory, ObjectToFileIdMap,
    SerializerRegistry,
};
use trackfeat::{
    Dimension, FeatureModel, FeatureSpec, ModelGraph, Multiplicity, Orchestrator,
    ProjectionKey, ProjectionSpec, SpotId, TargetType, Settings,
};

// ============================================================================
// Helpers
// ============================================================================

/// Two spots linked across timepoints 0 -> 2, 3-4-5 triangle geometry.
fn seed_session(graph: &mut ModelGraph) -> (SpotId, SpotId) {
    let a = graph.add_spot(0, [10.0, 10.0, 4.0], unit_covariance(2.0));
    let b = graph.add_spot(2, [13.0, 14.0, 4.0], unit_covariance(2.0));
    graph.add_link(a, b).unwrap();
    (a, b)
}

fn compute_builtins(graph: &ModelGraph, image: &ConstantImage) -> FeatureModel {
    let mut orch = Orchestrator::new(Settings::default());
    builtins::register_all(&mut orch).unwrap();
    let mut features = FeatureModel::new();
    let report = orch.compute(graph, image, &mut features, None, false).unwrap();
    assert!(report.is_clean(), "skipped: {:?}", report.skipped);
    features
}

// ============================================================================
// 1. Full built-in feature set survives a renumbered reload
// ============================================================================

#[test]
fn test_builtin_features_roundtrip_across_sessions() {
    // Session one allocates extra slots before the real objects so that
    // its indices differ from a fresh session's.
    let mut session1 = ModelGraph::new();
    let scratch = session1.add_spot(9, [0.0; 3], unit_covariance(1.0));
    let (a1, b1) = seed_session(&mut session1);
    session1.remove_spot(scratch);

    let image = ConstantImage::new(42.0, [32, 32, 8], 3, 2);
    let features1 = compute_builtins(&session1, &image);

    let registry = SerializerRegistry::with_builtins();
    let mut factory = MemoryStreamFactory::new();
    let fwd = ObjectToFileIdMap::from_graph(&session1);
    let saved = save_features(&features1, &fwd, &registry, &mut factory).unwrap();
    assert_eq!(saved.written.len(), 3);
    assert!(saved.skipped.is_empty());

    // Session two rebuilds the same logical objects from scratch; its
    // pools hand out different indices and generations.
    let mut session2 = ModelGraph::new();
    let (a2, b2) = seed_session(&mut session2);
    assert_ne!((a1.index, b1.index), (a2.index, b2.index));

    let back = FileIdToObjectMap::from_graph(&session2);
    let mut features2 = FeatureModel::new();
    let loaded = load_features(&factory, &back, &registry, &mut features2).unwrap();
    assert_eq!(loaded.loaded.len(), 3);
    assert!(loaded.skipped.is_empty());

    // Per-object values transferred from session-one ids to session-two
    // ids: compare (a1, a2) and (b1, b2) pairwise.
    let mean_key = ProjectionKey::on_source("Mean", 1);
    let p1 = features1.get(SPOT_INTENSITY_KEY).unwrap();
    let p2 = features2.get(SPOT_INTENSITY_KEY).unwrap();
    for (old, new) in [(a1, a2), (b1, b2)] {
        assert_eq!(
            p1.projection(&mean_key).unwrap().value(old.index, old.generation),
            p2.projection(&mean_key).unwrap().value(new.index, new.generation),
        );
    }

    let l2 = session2.link_ids().next().unwrap();
    let disp = features2
        .get(LINK_DISPLACEMENT_KEY)
        .unwrap()
        .projection(&ProjectionKey::single("Displacement"))
        .unwrap()
        .value(l2.index, l2.generation)
        .unwrap();
    assert!((disp - 5.0).abs() < 1e-12);
    let vel = features2
        .get(LINK_VELOCITY_KEY)
        .unwrap()
        .projection(&ProjectionKey::single("Velocity"))
        .unwrap()
        .value(l2.index, l2.generation)
        .unwrap();
    assert!((vel - 2.5).abs() < 1e-12);
}

// ============================================================================
// 2. Units survive the roundtrip
// ============================================================================

#[test]
fn test_units_survive_roundtrip() {
    let mut session1 = ModelGraph::new();
    seed_session(&mut session1);
    let image = ConstantImage::new(1.0, [32, 32, 8], 3, 1);
    let features1 = compute_builtins(&session1, &image);

    let registry = SerializerRegistry::with_builtins();
    let mut factory = MemoryStreamFactory::new();
    save_features(
        &features1,
        &ObjectToFileIdMap::from_graph(&session1),
        &registry,
        &mut factory,
    )
    .unwrap();

    let mut features2 = FeatureModel::new();
    load_features(
        &factory,
        &FileIdToObjectMap::from_graph(&session1),
        &registry,
        &mut features2,
    )
    .unwrap();

    for key in [SPOT_INTENSITY_KEY, LINK_DISPLACEMENT_KEY, LINK_VELOCITY_KEY] {
        let before = features1.get(key).unwrap();
        let after = features2.get(key).unwrap();
        for p in before.projections() {
            let q = after.projection(p.key()).unwrap();
            assert_eq!(p.units(), q.units(), "{key} / {}", p.key());
        }
    }
}

// ============================================================================
// 3. A computer adopts a deserialized feature instead of reallocating
// ============================================================================

#[test]
fn test_reload_then_incremental_pass_keeps_values() {
    let mut graph = ModelGraph::new();
    let (a, _) = seed_session(&mut graph);
    let image = ConstantImage::new(42.0, [32, 32, 8], 3, 2);
    let features = compute_builtins(&graph, &image);

    let registry = SerializerRegistry::with_builtins();
    let mut factory = MemoryStreamFactory::new();
    save_features(&features, &ObjectToFileIdMap::from_graph(&graph), &registry, &mut factory)
        .unwrap();

    // Reload into a fresh model over the same graph, then run a
    // non-forced pass: stored values satisfy the computers, and nothing
    // gets lost.
    let mut reloaded = FeatureModel::new();
    load_features(&factory, &FileIdToObjectMap::from_graph(&graph), &registry, &mut reloaded)
        .unwrap();

    let mut orch = Orchestrator::new(Settings::default());
    builtins::register_all(&mut orch).unwrap();
    let report = orch.compute(&graph, &image, &mut reloaded, None, false).unwrap();
    assert!(report.is_clean());

    let mean = reloaded
        .get(SPOT_INTENSITY_KEY)
        .unwrap()
        .projection(&ProjectionKey::on_source("Mean", 0))
        .unwrap()
        .value(a.index, a.generation)
        .unwrap();
    assert!((mean - 42.0).abs() < 1e-9);
}

// ============================================================================
// 4. Property: arbitrary finite values roundtrip exactly
// ============================================================================

fn value_spec() -> FeatureSpec {
    FeatureSpec {
        key: "Roundtrip value".into(),
        info: String::new(),
        target: TargetType::Vertex,
        multiplicity: Multiplicity::Single,
        projection_specs: vec![ProjectionSpec::new("V", Dimension::None)],
    }
}

proptest! {
    #[test]
    fn prop_scalar_values_roundtrip(values in prop::collection::vec(-1e12f64..1e12, 1..32)) {
        let mut graph = ModelGraph::new();
        let ids: Vec<SpotId> = values
            .iter()
            .enumerate()
            .map(|(i, _)| graph.add_spot(i as u32, [0.0; 3], unit_covariance(1.0)))
            .collect();

        let mut feature = ScalarFeature::new(value_spec(), 1, "µm", "s");
        let key = ProjectionKey::single("V");
        for (id, v) in ids.iter().zip(&values) {
            feature.projection_mut(&key).unwrap().store.set(id.index, id.generation, *v);
        }
        let mut model = FeatureModel::new();
        model.declare(Box::new(feature));

        let mut registry = SerializerRegistry::new();
        registry
            .register(Box::new(trackfeat::io::ScalarFeatureSerializer::new(value_spec())))
            .unwrap();
        let mut factory = MemoryStreamFactory::new();
        save_features(&model, &ObjectToFileIdMap::from_graph(&graph), &registry, &mut factory)
            .unwrap();

        let mut restored = FeatureModel::new();
        load_features(
            &factory,
            &FileIdToObjectMap::from_graph(&graph),
            &registry,
            &mut restored,
        )
        .unwrap();

        let proj = restored.get("Roundtrip value").unwrap();
        let proj = proj.projection(&key).unwrap();
        for (id, v) in ids.iter().zip(&values) {
            prop_assert_eq!(proj.value(id.index, id.generation), Some(*v));
        }
    }
}
