//! Built-in feature computers.
//!
//! Three computers ship with the engine:
//!
//! | Computer | Target | Multiplicity | Depends on |
//! |----------|--------|--------------|------------|
//! | Spot gaussian-filtered intensity | spot | per channel | — |
//! | Link displacement | link | single | — |
//! | Link velocity | link | single | Link displacement |
//!
//! The intensity computer runs on the parallel engine and samples the
//! image with a separable Gaussian kernel around each spot; the link
//! computers are cheap geometry over the graph. All three recompute
//! incrementally from the update log when a basis exists.

use parking_lot::Mutex;
use tracing::debug;

use crate::feature::{
    Dimension, Feature, FeatureSpec, Multiplicity, Projection, ProjectionKey, ProjectionSpec,
    ScalarFeature, TargetType,
};
use crate::graph::{LinkId, SpotId};
use crate::image::Affine3;
use crate::update::ChangeSet;
use crate::{Error, Result};

use super::parallel::{axis_scales, for_each_parallel, AxisKernel, OnlineStats};
use super::{ComputerDescriptor, ComputerEnv, FeatureComputer, Orchestrator};

// ============================================================================
// Feature keys & specs
// ============================================================================

pub const SPOT_INTENSITY_KEY: &str = "Spot gaussian-filtered intensity";
pub const LINK_DISPLACEMENT_KEY: &str = "Link displacement";
pub const LINK_VELOCITY_KEY: &str = "Link velocity";

pub fn spot_intensity_spec() -> FeatureSpec {
    FeatureSpec {
        key: SPOT_INTENSITY_KEY.into(),
        info: "Gaussian-weighted mean and standard deviation of the image \
               intensity inside each spot's ellipsoid, per channel."
            .into(),
        target: TargetType::Vertex,
        multiplicity: Multiplicity::OnSources,
        projection_specs: vec![
            ProjectionSpec::new("Mean", Dimension::Intensity),
            ProjectionSpec::new("Std", Dimension::Intensity),
        ],
    }
}

pub fn link_displacement_spec() -> FeatureSpec {
    FeatureSpec {
        key: LINK_DISPLACEMENT_KEY.into(),
        info: "Euclidean distance between a link's source and target spots.".into(),
        target: TargetType::Edge,
        multiplicity: Multiplicity::Single,
        projection_specs: vec![ProjectionSpec::new("Displacement", Dimension::Length)],
    }
}

pub fn link_velocity_spec() -> FeatureSpec {
    FeatureSpec {
        key: LINK_VELOCITY_KEY.into(),
        info: "Link displacement divided by the timepoint difference.".into(),
        target: TargetType::Edge,
        multiplicity: Multiplicity::Single,
        projection_specs: vec![ProjectionSpec::new("Velocity", Dimension::Velocity)],
    }
}

/// Register the built-in computers with an orchestrator.
pub fn register_all(orchestrator: &mut Orchestrator) -> Result<()> {
    orchestrator.register(
        SpotGaussIntensityComputer::descriptor_template(),
        Box::new(|| Box::new(SpotGaussIntensityComputer::new())),
    )?;
    orchestrator.register(
        LinkDisplacementComputer::descriptor_template(),
        Box::new(|| Box::new(LinkDisplacementComputer::new())),
    )?;
    orchestrator.register(
        LinkVelocityComputer::descriptor_template(),
        Box::new(|| Box::new(LinkVelocityComputer::new())),
    )?;
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Adopt a recovered feature when it matches the expected channel count;
/// otherwise allocate a fresh one.
fn adopt_or_allocate(
    recovered: Option<Box<dyn Feature>>,
    spec: FeatureSpec,
    env: &ComputerEnv<'_>,
) -> ScalarFeature {
    let n_channels = env.image.num_channels();
    if let Some(feature) = recovered {
        if let Ok(scalar) = feature.into_any().downcast::<ScalarFeature>() {
            if scalar.n_channels() == n_channels && scalar.spec().key == spec.key {
                return *scalar;
            }
            debug!(feature = %spec.key, "recovered feature incompatible, reallocating");
        }
    }
    ScalarFeature::new(spec, n_channels, env.image.space_unit(), env.image.time_unit())
}

/// Incremental basis for a feature: `None` forces full recomputation.
fn incremental_basis(key: &str, env: &ComputerEnv<'_>) -> Option<ChangeSet> {
    if env.force {
        None
    } else {
        env.graph.update_log().read().changes_for(key)
    }
}

// ============================================================================
// SpotGaussIntensityComputer
// ============================================================================

/// Computes Gaussian-weighted intensity statistics inside each spot's
/// ellipsoid, one Mean/Std pair per image channel.
pub struct SpotGaussIntensityComputer {
    descriptor: ComputerDescriptor,
    output: Option<ScalarFeature>,
}

impl SpotGaussIntensityComputer {
    pub fn new() -> Self {
        Self {
            descriptor: Self::descriptor_template(),
            output: None,
        }
    }

    pub fn descriptor_template() -> ComputerDescriptor {
        ComputerDescriptor {
            id: "spot-gauss-intensity".into(),
            output: spot_intensity_spec(),
            dependencies: vec![],
            user_visible: true,
        }
    }
}

impl Default for SpotGaussIntensityComputer {
    fn default() -> Self {
        Self::new()
    }
}

/// One (timepoint, channel) work batch, prefiltered to the spots that
/// actually need recomputation.
struct IntensityBatch {
    timepoint: u32,
    channel: u32,
    mean_idx: usize,
    std_idx: usize,
    inverse: Affine3,
    scales: [f64; 3],
    spots: Vec<SpotId>,
}

impl FeatureComputer for SpotGaussIntensityComputer {
    fn descriptor(&self) -> &ComputerDescriptor {
        &self.descriptor
    }

    fn create_output(
        &mut self,
        recovered: Option<Box<dyn Feature>>,
        env: &ComputerEnv<'_>,
    ) -> Result<()> {
        if self.output.is_none() {
            self.output = Some(adopt_or_allocate(recovered, spot_intensity_spec(), env));
        }
        Ok(())
    }

    fn run(&mut self, env: &ComputerEnv<'_>) -> Result<()> {
        let feature = self.output.as_mut().ok_or_else(|| Error::ComputationError {
            computer: "spot-gauss-intensity".into(),
            message: "create_output was not called".into(),
        })?;

        let n_timepoints = env.image.num_timepoints();
        let n_channels = env.image.num_channels();
        let changes = incremental_basis(SPOT_INTENSITY_KEY, env);

        // Plan all (timepoint, channel) batches up front: resolves the
        // transforms (fallible) and prefilters candidates while we still
        // hold the feature unlocked.
        let mut batches: Vec<IntensityBatch> = Vec::new();
        for timepoint in 0..n_timepoints {
            let transform = env.image.source_transform(timepoint, 0);
            let inverse = transform.inverse()?;
            let scales = axis_scales(&transform);
            for channel in 0..n_channels {
                let mean_key = ProjectionKey::on_source("Mean", channel);
                let std_key = ProjectionKey::on_source("Std", channel);
                let (mean_idx, std_idx) = {
                    let projections = feature.scalar_projections();
                    let mean = projections.iter().position(|p| p.key() == &mean_key);
                    let std = projections.iter().position(|p| p.key() == &std_key);
                    match (mean, std) {
                        (Some(m), Some(s)) => (m, s),
                        _ => {
                            return Err(Error::ComputationError {
                                computer: "spot-gauss-intensity".into(),
                                message: format!("missing projection for channel {channel}"),
                            });
                        }
                    }
                };

                // A changed spot is always recomputed; an unset spot is
                // recomputed too, which degrades a never-populated (or
                // partially populated) channel to a full pass for the
                // spots it is missing.
                let mean_store = &feature.scalar_projections()[mean_idx].store;
                let spots: Vec<SpotId> = env
                    .graph
                    .spatial_index_at(timepoint)
                    .filter(|id| {
                        env.force
                            || changes.is_none()
                            || !mean_store.is_set(id.index, id.generation)
                            || changes.as_ref().is_some_and(|c| c.vertices.contains(&id.index))
                    })
                    .collect();

                if !spots.is_empty() {
                    batches.push(IntensityBatch {
                        timepoint,
                        channel,
                        mean_idx,
                        std_idx,
                        inverse,
                        scales,
                        spots,
                    });
                }
            }
        }

        let total: u64 = batches.iter().map(|b| b.spots.len() as u64).sum();
        let mut done_offset: u64 = 0;
        let n_threads = env.settings.effective_threads();
        let sigma_factor = env.settings.sigma_factor;
        let cutoff = env.settings.kernel_cutoff_sigmas;

        for batch in batches {
            // Timepoint/channel boundary: drain promptly once canceled,
            // leaving everything computed so far intact.
            if env.cancel.is_canceled() {
                break;
            }
            let n_spots = batch.spots.len() as u64;
            let out = Mutex::new(&mut *feature);

            for_each_parallel(
                batch.spots,
                n_threads,
                &env.cancel,
                env.progress,
                done_offset,
                total,
                || env.image.random_access(batch.timepoint, batch.channel, 0),
                |reader, id| {
                    let Some(spot) = env.graph.spot(id) else { return };

                    let sigma_phys = spot.min_variance().max(0.0).sqrt() / sigma_factor;
                    let center = batch.inverse.apply(spot.position);
                    let dims = reader.dims();

                    let mut stats = OnlineStats::new();
                    if sigma_phys > 0.0 {
                        let kernels: [AxisKernel; 3] = std::array::from_fn(|axis| {
                            let sigma_vox = if batch.scales[axis] > 0.0 {
                                sigma_phys / batch.scales[axis]
                            } else {
                                sigma_phys
                            };
                            AxisKernel::gaussian(center[axis], sigma_vox, cutoff, dims[axis])
                        });

                        if !kernels.iter().any(AxisKernel::is_empty) {
                            for (kz, wz) in kernels[2].weights.iter().enumerate() {
                                let z = kernels[2].start + kz as i64;
                                for (ky, wy) in kernels[1].weights.iter().enumerate() {
                                    let y = kernels[1].start + ky as i64;
                                    let wzy = wz * wy;
                                    for (kx, wx) in kernels[0].weights.iter().enumerate() {
                                        let x = kernels[0].start + kx as i64;
                                        stats.add(wzy * wx, reader.get(x, y, z));
                                    }
                                }
                            }
                        }
                    }

                    // One lock hold writes the whole per-object result,
                    // so a canceled run never leaves Mean without Std.
                    let mut guard = out.lock();
                    let projections = guard.scalar_projections_mut();
                    if stats.is_empty() {
                        // Nothing sampled: unset, not zero.
                        projections[batch.mean_idx].store.remove(id.index, id.generation);
                        projections[batch.std_idx].store.remove(id.index, id.generation);
                    } else {
                        projections[batch.mean_idx].store.set(id.index, id.generation, stats.mean());
                        projections[batch.std_idx].store.set(id.index, id.generation, stats.std());
                    }
                },
            );
            done_offset += n_spots;
        }

        Ok(())
    }

    fn take_output(&mut self) -> Option<Box<dyn Feature>> {
        self.output.take().map(|f| Box::new(f) as Box<dyn Feature>)
    }
}

// ============================================================================
// LinkDisplacementComputer
// ============================================================================

/// Euclidean distance between each link's endpoint spots.
pub struct LinkDisplacementComputer {
    descriptor: ComputerDescriptor,
    output: Option<ScalarFeature>,
}

impl LinkDisplacementComputer {
    pub fn new() -> Self {
        Self {
            descriptor: Self::descriptor_template(),
            output: None,
        }
    }

    pub fn descriptor_template() -> ComputerDescriptor {
        ComputerDescriptor {
            id: "link-displacement".into(),
            output: link_displacement_spec(),
            dependencies: vec![],
            user_visible: true,
        }
    }
}

impl Default for LinkDisplacementComputer {
    fn default() -> Self {
        Self::new()
    }
}

/// Links needing recomputation, given an optional incremental basis.
fn candidate_links(
    env: &ComputerEnv<'_>,
    changes: &Option<ChangeSet>,
    is_set: impl Fn(LinkId) -> bool,
) -> Vec<LinkId> {
    env.graph
        .link_ids()
        .filter(|id| match changes {
            None => true,
            Some(c) => c.edges.contains(&id.index) || !is_set(*id),
        })
        .collect()
}

impl FeatureComputer for LinkDisplacementComputer {
    fn descriptor(&self) -> &ComputerDescriptor {
        &self.descriptor
    }

    fn create_output(
        &mut self,
        recovered: Option<Box<dyn Feature>>,
        env: &ComputerEnv<'_>,
    ) -> Result<()> {
        if self.output.is_none() {
            self.output = Some(adopt_or_allocate(recovered, link_displacement_spec(), env));
        }
        Ok(())
    }

    fn run(&mut self, env: &ComputerEnv<'_>) -> Result<()> {
        let feature = self.output.as_mut().ok_or_else(|| Error::ComputationError {
            computer: "link-displacement".into(),
            message: "create_output was not called".into(),
        })?;
        let key = ProjectionKey::single("Displacement");
        let changes = incremental_basis(LINK_DISPLACEMENT_KEY, env);

        let candidates = {
            let proj = feature.projection(&key).expect("spec projection");
            candidate_links(env, &changes, |id| proj.is_set(id.index, id.generation))
        };

        let store = &mut feature
            .projection_mut(&key)
            .expect("spec projection")
            .store;
        let total = candidates.len() as u64;
        for (i, id) in candidates.into_iter().enumerate() {
            if env.cancel.is_canceled() {
                break;
            }
            let Some(link) = env.graph.link(id) else { continue };
            match (env.graph.spot(link.source), env.graph.spot(link.target)) {
                (Some(src), Some(tgt)) => {
                    let d: f64 = (0..3)
                        .map(|a| (tgt.position[a] - src.position[a]).powi(2))
                        .sum::<f64>()
                        .sqrt();
                    store.set(id.index, id.generation, d);
                }
                _ => store.remove(id.index, id.generation),
            }
            env.progress.progress(i as u64 + 1, total);
        }
        Ok(())
    }

    fn take_output(&mut self) -> Option<Box<dyn Feature>> {
        self.output.take().map(|f| Box::new(f) as Box<dyn Feature>)
    }
}

// ============================================================================
// LinkVelocityComputer
// ============================================================================

/// Displacement per unit time. Reads the displacement feature, so it
/// declares it as a dependency and the orchestrator schedules it after
/// [`LinkDisplacementComputer`].
pub struct LinkVelocityComputer {
    descriptor: ComputerDescriptor,
    output: Option<ScalarFeature>,
}

impl LinkVelocityComputer {
    pub fn new() -> Self {
        Self {
            descriptor: Self::descriptor_template(),
            output: None,
        }
    }

    pub fn descriptor_template() -> ComputerDescriptor {
        ComputerDescriptor {
            id: "link-velocity".into(),
            output: link_velocity_spec(),
            dependencies: vec![LINK_DISPLACEMENT_KEY.into()],
            user_visible: true,
        }
    }
}

impl Default for LinkVelocityComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureComputer for LinkVelocityComputer {
    fn descriptor(&self) -> &ComputerDescriptor {
        &self.descriptor
    }

    fn create_output(
        &mut self,
        recovered: Option<Box<dyn Feature>>,
        env: &ComputerEnv<'_>,
    ) -> Result<()> {
        if self.output.is_none() {
            self.output = Some(adopt_or_allocate(recovered, link_velocity_spec(), env));
        }
        Ok(())
    }

    fn run(&mut self, env: &ComputerEnv<'_>) -> Result<()> {
        let feature = self.output.as_mut().ok_or_else(|| Error::ComputationError {
            computer: "link-velocity".into(),
            message: "create_output was not called".into(),
        })?;
        let displacement = env
            .features
            .get(LINK_DISPLACEMENT_KEY)
            .ok_or_else(|| Error::UnknownFeature(LINK_DISPLACEMENT_KEY.into()))?;
        let disp_proj = displacement
            .projection(&ProjectionKey::single("Displacement"))
            .ok_or_else(|| Error::UnknownFeature("Displacement projection".into()))?;

        let key = ProjectionKey::single("Velocity");
        let changes = incremental_basis(LINK_VELOCITY_KEY, env);
        let candidates = {
            let proj = feature.projection(&key).expect("spec projection");
            candidate_links(env, &changes, |id| proj.is_set(id.index, id.generation))
        };

        let store = &mut feature
            .projection_mut(&key)
            .expect("spec projection")
            .store;
        for id in candidates {
            if env.cancel.is_canceled() {
                break;
            }
            let value = env.graph.link(id).and_then(|link| {
                let src = env.graph.spot(link.source)?;
                let tgt = env.graph.spot(link.target)?;
                let dt = tgt.timepoint as f64 - src.timepoint as f64;
                let d = disp_proj.value(id.index, id.generation)?;
                (dt > 0.0).then(|| d / dt)
            });
            match value {
                Some(v) => store.set(id.index, id.generation, v),
                None => store.remove(id.index, id.generation),
            }
        }
        Ok(())
    }

    fn take_output(&mut self) -> Option<Box<dyn Feature>> {
        self.output.take().map(|f| Box::new(f) as Box<dyn Feature>)
    }
}

// ============================================================================
// Tests
// ============================================================================
