//! # trackfeat — Feature Computation Engine for Tracked Objects
//!
//! Computes derived scalar attributes ("features") over a mutating graph of
//! tracked objects — spots in space-time and links connecting them across
//! time — and over the volumetric image data they were detected in.
//!
//! ## Design Principles
//!
//! 1. **Explicit registries**: computers and serializers are registered in
//!    plain maps at startup — no reflection, no plugin scanning
//! 2. **Stores own nothing but scalars**: property stores are sparse
//!    per-object `f64` storage with an explicit unset sentinel
//! 3. **Dependency-ordered scheduling**: the orchestrator topologically
//!    sorts computers by the features they read, rejecting cycles at
//!    registration time
//! 4. **Cooperative cancellation**: an atomic token polled at object and
//!    timepoint boundaries; partial results are kept, never rolled back
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trackfeat::{ModelGraph, FeatureModel, Orchestrator, Settings};
//! use trackfeat::compute::builtins;
//! use trackfeat::image::ConstantImage;
//!
//! # fn example() -> trackfeat::Result<()> {
//! let settings = Settings::default();
//! let mut graph = ModelGraph::from_settings(&settings);
//! let image = ConstantImage::new(100.0, [64, 64, 16], 5, 2);
//! let mut features = FeatureModel::new();
//!
//! let mut orchestrator = Orchestrator::new(settings);
//! builtins::register_all(&mut orchestrator)?;
//!
//! let report = orchestrator.compute(&graph, &image, &mut features, None, false)?;
//! for (id, why) in &report.skipped {
//!     eprintln!("skipped {id}: {why}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Incremental recomputation
//!
//! Graph mutations are recorded in a bounded [`update::UpdateLog`]. A
//! computer that supports incremental updates asks the log for the set of
//! objects touched since its feature was last computed and recomputes only
//! those; if the log has no basis for the feature (or was truncated), the
//! computer falls back to a full pass.

// ============================================================================
// Modules
// ============================================================================

pub mod graph;
pub mod store;
pub mod feature;
pub mod update;
pub mod compute;
pub mod image;
pub mod io;
pub mod config;

// ============================================================================
// Re-exports: Graph model
// ============================================================================

pub use graph::{ModelGraph, Spot, Link, SpotId, LinkId, PoolIndex};

// ============================================================================
// Re-exports: Features
// ============================================================================

pub use feature::{
    Feature, FeatureModel, FeatureSpec, Projection, ProjectionKey,
    ProjectionSpec, Multiplicity, TargetType, Dimension,
};

// ============================================================================
// Re-exports: Computation
// ============================================================================

pub use compute::{
    Orchestrator, FeatureComputer, ComputerDescriptor, ComputeReport,
    CancellationToken, ProgressSink,
};

// ============================================================================
// Re-exports: Configuration
// ============================================================================

pub use config::Settings;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown feature spec: {0}")]
    UnknownFeature(String),

    #[error("Dependency cycle among computers: {0}")]
    DependencyCycle(String),

    #[error("Computation error in {computer}: {message}")]
    ComputationError { computer: String, message: String },

    #[error("Serialization error for feature '{feature}': {message}")]
    SerializationError { feature: String, message: String },

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
