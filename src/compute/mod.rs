//! # Computation Layer
//!
//! The unit of computation is a [`FeatureComputer`]: it declares what it
//! needs (dependency features, image data, the update log), produces one
//! feature, and supports cooperative cancellation. The [`Orchestrator`]
//! resolves dependencies among registered computers and executes them in
//! topological order; the [`parallel`] engine fans per-object numeric work
//! out to a worker pool inside a single computer's `run()`.

pub mod orchestrator;
pub mod parallel;
pub mod builtins;

pub use orchestrator::{Orchestrator, ComputeReport};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Settings;
use crate::feature::{Feature, FeatureModel, FeatureSpec};
use crate::graph::ModelGraph;
use crate::image::ImageSource;
use crate::Result;

// ============================================================================
// Cancellation
// ============================================================================

/// Shared cooperative cancellation token.
///
/// Cancellation is advisory: workers poll at object and timepoint
/// boundaries and drain without scheduling new work. It never interrupts
/// an in-flight per-voxel loop, and computed results are kept.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation with a human-readable reason. The first
    /// reason wins; later calls only keep the flag set.
    pub fn cancel(&self, reason: &str) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
        self.inner.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Sink for `done/total` progress reports from a running computer.
pub trait ProgressSink: Sync {
    fn progress(&self, done: u64, total: u64);

    fn status(&self, _message: &str) {}
}

/// Discards all progress.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn progress(&self, _done: u64, _total: u64) {}
}

/// Logs progress at debug level. Useful for headless runs.
pub struct LoggingProgress;

impl ProgressSink for LoggingProgress {
    fn progress(&self, done: u64, total: u64) {
        if total > 0 {
            debug!(done, total, fraction = done as f64 / total as f64, "progress");
        }
    }

    fn status(&self, message: &str) {
        debug!("{message}");
    }
}

// ============================================================================
// Computer contract
// ============================================================================

/// Declares a computer: its id, the feature it produces, and the feature
/// keys it reads.
#[derive(Debug, Clone)]
pub struct ComputerDescriptor {
    /// Unique computer id.
    pub id: String,
    /// Spec of the feature this computer produces.
    pub output: FeatureSpec,
    /// Keys of features this computer reads. The orchestrator guarantees
    /// they are up to date before `run()` is invoked.
    pub dependencies: Vec<String>,
    /// Whether the computer is offered to users, or is an internal helper
    /// only ever pulled in as a dependency.
    pub user_visible: bool,
}

/// Everything the orchestrator injects into a computer for one pass.
pub struct ComputerEnv<'a> {
    pub graph: &'a ModelGraph,
    pub image: &'a dyn ImageSource,
    /// Dependency features, already computed this pass (or recovered
    /// from deserialization).
    pub features: &'a FeatureModel,
    pub cancel: CancellationToken,
    pub progress: &'a dyn ProgressSink,
    /// Recompute every object, ignoring the update log and prior values.
    pub force: bool,
    pub settings: &'a Settings,
}

/// The unit of computation. Two-phase protocol: `create_output` ensures
/// the output feature exists (idempotently, recovering a deserialized one
/// when offered), then `run` fills it in.
pub trait FeatureComputer: Send {
    fn descriptor(&self) -> &ComputerDescriptor;

    /// Ensure the output feature exists. `recovered` is a feature taken
    /// from the model under this computer's key — typically supplied by
    /// deserialization — to be adopted if compatible.
    fn create_output(&mut self, recovered: Option<Box<dyn Feature>>, env: &ComputerEnv<'_>) -> Result<()>;

    /// Perform the computation. Consults the update log to skip
    /// unchanged objects unless `env.force` is set. Returns `Ok` on
    /// cooperative cancellation; whatever was computed is kept.
    fn run(&mut self, env: &ComputerEnv<'_>) -> Result<()>;

    /// Hand the output feature to the orchestrator for registration.
    fn take_output(&mut self) -> Option<Box<dyn Feature>>;
}

/// Builds a fresh computer instance for one pass.
pub type ComputerFactory = Box<dyn Fn() -> Box<dyn FeatureComputer> + Send + Sync>;

// ============================================================================
// Tests
// ============================================================================
