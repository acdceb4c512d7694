//! Dependency-ordered computer execution.
//!
//! Computers register with a descriptor naming the feature they produce
//! and the feature keys they read. Registration rejects duplicate ids,
//! duplicate outputs, and dependency cycles; a compute pass topologically
//! sorts the selected computers and runs them one at a time, injecting
//! their inputs. A failing or unsatisfiable computer is skipped with a
//! named diagnostic — it never aborts the pass.

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::feature::FeatureModel;
use crate::graph::ModelGraph;
use crate::image::ImageSource;
use crate::{Error, Result};

use super::{
    CancellationToken, ComputerDescriptor, ComputerEnv, ComputerFactory, NoopProgress,
    ProgressSink,
};

// ============================================================================
// ComputeReport
// ============================================================================

/// Outcome of one computation pass.
#[derive(Debug, Default)]
pub struct ComputeReport {
    /// Computer ids that completed `run()`, in execution order.
    pub computed: Vec<String>,
    /// Computers skipped, with the diagnostic explaining why.
    pub skipped: Vec<(String, String)>,
    /// Set when the pass was canceled, with the reason.
    pub canceled: Option<String>,
}

impl ComputeReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.canceled.is_none()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct RegisteredComputer {
    descriptor: ComputerDescriptor,
    factory: ComputerFactory,
}

/// Registry and scheduler for feature computers.
pub struct Orchestrator {
    settings: Settings,
    computers: Vec<RegisteredComputer>,
    by_id: HashMap<String, usize>,
    /// feature key → index of the computer producing it
    by_output: HashMap<String, usize>,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            computers: Vec::new(),
            by_id: HashMap::new(),
            by_output: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a computer. Duplicate ids and outputs are configuration
    /// errors, as is any dependency cycle the new computer would close —
    /// cycles are rejected here, never discovered at run time.
    pub fn register(&mut self, descriptor: ComputerDescriptor, factory: ComputerFactory) -> Result<()> {
        if self.by_id.contains_key(&descriptor.id) {
            return Err(Error::ConfigError(format!(
                "Computer id already registered: {}",
                descriptor.id
            )));
        }
        if self.by_output.contains_key(&descriptor.output.key) {
            return Err(Error::ConfigError(format!(
                "Feature '{}' already has a producer",
                descriptor.output.key
            )));
        }

        let index = self.computers.len();
        self.by_id.insert(descriptor.id.clone(), index);
        self.by_output.insert(descriptor.output.key.clone(), index);
        self.computers.push(RegisteredComputer { descriptor, factory });

        if let Some(cycle) = self.find_cycle() {
            let rc = self.computers.pop().expect("just pushed");
            self.by_id.remove(&rc.descriptor.id);
            self.by_output.remove(&rc.descriptor.output.key);
            return Err(Error::DependencyCycle(cycle));
        }
        Ok(())
    }

    /// Producer index for each dependency that has one. Dependencies on
    /// features with no registered producer are resolved at run time
    /// against the feature model (e.g. deserialized features).
    fn producer_deps(&self, index: usize) -> Vec<usize> {
        self.computers[index]
            .descriptor
            .dependencies
            .iter()
            .filter_map(|key| self.by_output.get(key).copied())
            .collect()
    }

    /// DFS cycle check over the producer graph. Returns the cycle as a
    /// readable `a -> b -> a` path.
    fn find_cycle(&self) -> Option<String> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;
        let n = self.computers.len();
        let mut color = vec![WHITE; n];
        let mut stack: Vec<usize> = Vec::new();

        fn visit(
            o: &Orchestrator,
            v: usize,
            color: &mut [u8],
            stack: &mut Vec<usize>,
        ) -> Option<String> {
            color[v] = GRAY;
            stack.push(v);
            for dep in o.producer_deps(v) {
                match color[dep] {
                    WHITE => {
                        if let Some(c) = visit(o, dep, color, stack) {
                            return Some(c);
                        }
                    }
                    GRAY => {
                        let start = stack.iter().position(|&x| x == dep).unwrap_or(0);
                        let mut names: Vec<&str> = stack[start..]
                            .iter()
                            .map(|&i| o.computers[i].descriptor.id.as_str())
                            .collect();
                        names.push(o.computers[dep].descriptor.id.as_str());
                        return Some(names.join(" -> "));
                    }
                    _ => {}
                }
            }
            stack.pop();
            color[v] = BLACK;
            None
        }

        for v in 0..n {
            if color[v] == WHITE {
                if let Some(c) = visit(self, v, &mut color, &mut stack) {
                    return Some(c);
                }
            }
        }
        None
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ComputerDescriptor> {
        self.computers.iter().map(|rc| &rc.descriptor)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run a pass with a fresh cancellation token and no progress output.
    /// `selected` names computer ids to run (dependencies are pulled in
    /// automatically); `None` runs every registered computer.
    pub fn compute(
        &self,
        graph: &ModelGraph,
        image: &dyn ImageSource,
        features: &mut FeatureModel,
        selected: Option<&[&str]>,
        force: bool,
    ) -> Result<ComputeReport> {
        self.compute_with(
            graph,
            image,
            features,
            selected,
            force,
            CancellationToken::new(),
            &NoopProgress,
        )
    }

    /// Run a pass with an externally-held cancellation token and a
    /// progress sink.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_with(
        &self,
        graph: &ModelGraph,
        image: &dyn ImageSource,
        features: &mut FeatureModel,
        selected: Option<&[&str]>,
        force: bool,
        cancel: CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<ComputeReport> {
        let mut report = ComputeReport::default();

        let order = match self.execution_order(selected, &mut report) {
            Ok(order) => order,
            Err(e) => return Err(e),
        };
        debug!(?order, "execution order resolved");

        // Indices of computers that failed or were skipped; dependents of
        // these are skipped in turn.
        let mut unavailable: HashSet<usize> = HashSet::new();
        let mut computed_keys: Vec<String> = Vec::new();

        for index in order {
            let rc = &self.computers[index];
            let id = &rc.descriptor.id;

            if cancel.is_canceled() {
                break;
            }

            // All declared dependencies must be present in the model —
            // either computed this pass or recovered from deserialization.
            let mut skip_reason = None;
            for dep_key in &rc.descriptor.dependencies {
                if let Some(&producer) = self.by_output.get(dep_key) {
                    if unavailable.contains(&producer) {
                        skip_reason = Some(format!("dependency '{dep_key}' was not computed"));
                        break;
                    }
                }
                if !features.contains(dep_key) {
                    skip_reason = Some(format!("unknown dependency feature '{dep_key}'"));
                    break;
                }
            }
            if let Some(why) = skip_reason {
                warn!(computer = %id, %why, "skipping computer");
                unavailable.insert(index);
                report.skipped.push((id.clone(), why));
                continue;
            }

            let mut computer = (rc.factory)();
            let recovered = features.take(&rc.descriptor.output.key);
            let env = ComputerEnv {
                graph,
                image,
                features,
                cancel: cancel.clone(),
                progress,
                force,
                settings: &self.settings,
            };
            if let Err(e) = computer.create_output(recovered, &env) {
                warn!(computer = %id, error = %e, "create_output failed");
                unavailable.insert(index);
                report.skipped.push((id.clone(), format!("create_output failed: {e}")));
                continue;
            }

            progress.status(&format!("Computing {}", rc.descriptor.output.key));
            let run_result = computer.run(&env);

            // Partial results are registered even on failure or
            // cancellation; they are valid values, just incomplete.
            if let Some(output) = computer.take_output() {
                features.declare(output);
            }

            match run_result {
                Ok(()) => {
                    if cancel.is_canceled() {
                        break;
                    }
                    computed_keys.push(rc.descriptor.output.key.clone());
                    report.computed.push(id.clone());
                }
                Err(e) => {
                    warn!(computer = %id, error = %e, "run failed");
                    unavailable.insert(index);
                    report.skipped.push((id.clone(), format!("run failed: {e}")));
                }
            }
        }

        report.canceled = cancel.reason();

        // Update-log bookkeeping: a clean forced pass wipes the history;
        // anything else seals the window, stamping the features brought
        // up to date.
        {
            let mut log = graph.update_log().write();
            if force && report.is_clean() {
                log.clear();
            } else {
                log.commit(computed_keys);
            }
        }

        info!(
            computed = report.computed.len(),
            skipped = report.skipped.len(),
            canceled = report.canceled.is_some(),
            "computation pass finished"
        );
        Ok(report)
    }

    /// Expand the selection with transitive producer dependencies and
    /// topologically sort it (Kahn, registration order as tiebreak).
    fn execution_order(
        &self,
        selected: Option<&[&str]>,
        report: &mut ComputeReport,
    ) -> Result<Vec<usize>> {
        let mut wanted: HashSet<usize> = HashSet::new();
        let mut frontier: Vec<usize> = match selected {
            None => (0..self.computers.len()).collect(),
            Some(ids) => {
                let mut frontier = Vec::new();
                for id in ids {
                    match self.by_id.get(*id) {
                        Some(&i) => frontier.push(i),
                        None => {
                            warn!(computer = %id, "unknown computer id");
                            report.skipped.push((id.to_string(), "unknown computer id".into()));
                        }
                    }
                }
                frontier
            }
        };

        while let Some(i) = frontier.pop() {
            if wanted.insert(i) {
                frontier.extend(self.producer_deps(i));
            }
        }

        // Kahn's algorithm over the selected subgraph.
        let mut indegree: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &wanted {
            let deps: Vec<usize> = self
                .producer_deps(i)
                .into_iter()
                .filter(|d| wanted.contains(d))
                .collect();
            indegree.insert(i, deps.len());
            for d in deps {
                dependents.entry(d).or_default().push(i);
            }
        }

        let mut ready: Vec<usize> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&i, _)| i)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(wanted.len());
        while let Some(i) = ready.first().copied() {
            ready.remove(0);
            order.push(i);
            if let Some(deps) = dependents.get(&i) {
                for &d in deps {
                    let e = indegree.get_mut(&d).expect("dependent tracked");
                    *e -= 1;
                    if *e == 0 {
                        ready.push(d);
                        ready.sort_unstable();
                    }
                }
            }
        }

        // Cycles are rejected at registration, so the sort always drains.
        debug_assert_eq!(order.len(), wanted.len());
        Ok(order)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputerDescriptor, FeatureComputer};
    use crate::feature::{
        Dimension, Feature, FeatureSpec, Multiplicity, ProjectionSpec, ScalarFeature, TargetType,
    };
    use std::sync::{Arc, Mutex};

    fn spec(key: &str) -> FeatureSpec {
        FeatureSpec {
            key: key.into(),
            info: String::new(),
            target: TargetType::Vertex,
            multiplicity: Multiplicity::Single,
            projection_specs: vec![ProjectionSpec::new("V", Dimension::None)],
        }
    }

    /// Test computer that records its run order into a shared trace.
    struct TraceComputer {
        descriptor: ComputerDescriptor,
        trace: Arc<Mutex<Vec<String>>>,
        output: Option<Box<dyn Feature>>,
        fail: bool,
    }

    impl FeatureComputer for TraceComputer {
        fn descriptor(&self) -> &ComputerDescriptor {
            &self.descriptor
        }

        fn create_output(
            &mut self,
            recovered: Option<Box<dyn Feature>>,
            _env: &ComputerEnv<'_>,
        ) -> Result<()> {
            self.output = Some(recovered.unwrap_or_else(|| {
                Box::new(ScalarFeature::new(self.descriptor.output.clone(), 1, "µm", "s"))
            }));
            Ok(())
        }

        fn run(&mut self, _env: &ComputerEnv<'_>) -> Result<()> {
            if self.fail {
                return Err(Error::ComputationError {
                    computer: self.descriptor.id.clone(),
                    message: "boom".into(),
                });
            }
            self.trace.lock().unwrap().push(self.descriptor.id.clone());
            Ok(())
        }

        fn take_output(&mut self) -> Option<Box<dyn Feature>> {
            self.output.take()
        }
    }

    fn register_trace(
        orch: &mut Orchestrator,
        id: &str,
        deps: &[&str],
        trace: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Result<()> {
        let descriptor = ComputerDescriptor {
            id: id.into(),
            output: spec(&format!("F:{id}")),
            dependencies: deps.iter().map(|d| format!("F:{d}")).collect(),
            user_visible: true,
        };
        let trace = trace.clone();
        let d2 = descriptor.clone();
        orch.register(
            descriptor,
            Box::new(move || {
                Box::new(TraceComputer {
                    descriptor: d2.clone(),
                    trace: trace.clone(),
                    output: None,
                    fail,
                })
            }),
        )
    }

    fn run_all(orch: &Orchestrator) -> (ComputeReport, FeatureModel) {
        let graph = ModelGraph::new();
        let image = crate::image::ConstantImage::new(0.0, [1, 1, 1], 1, 1);
        let mut features = FeatureModel::new();
        let report = orch.compute(&graph, &image, &mut features, None, false).unwrap();
        (report, features)
    }

    #[test]
    fn test_reverse_registration_still_runs_deps_first() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Settings::default());
        // Dependent registered before its dependency.
        register_trace(&mut orch, "velocity", &["displacement"], &trace, false).unwrap();
        register_trace(&mut orch, "displacement", &[], &trace, false).unwrap();

        let (report, features) = run_all(&orch);
        assert_eq!(report.skipped, vec![]);
        assert_eq!(*trace.lock().unwrap(), vec!["displacement", "velocity"]);
        assert!(features.contains("F:velocity"));
    }

    #[test]
    fn test_cycle_rejected_at_registration() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Settings::default());
        register_trace(&mut orch, "a", &["b"], &trace, false).unwrap();
        let err = register_trace(&mut orch, "b", &["a"], &trace, false).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
        // The offending computer was rolled back; "a" still runs once its
        // dependency is registered cycle-free.
        register_trace(&mut orch, "b", &[], &trace, false).unwrap();
        let (report, _) = run_all(&orch);
        assert_eq!(report.computed.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Settings::default());
        register_trace(&mut orch, "a", &[], &trace, false).unwrap();
        let err = register_trace(&mut orch, "a", &[], &trace, false).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_unknown_dependency_skips_dependent_only() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Settings::default());
        register_trace(&mut orch, "a", &[], &trace, false).unwrap();
        register_trace(&mut orch, "needs-missing", &["missing"], &trace, false).unwrap();

        let (report, features) = run_all(&orch);
        assert_eq!(report.computed, vec!["a"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "needs-missing");
        assert!(features.contains("F:a"));
        assert!(!features.contains("F:needs-missing"));
    }

    #[test]
    fn test_failed_producer_skips_dependents() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Settings::default());
        register_trace(&mut orch, "bad", &[], &trace, true).unwrap();
        register_trace(&mut orch, "child", &["bad"], &trace, false).unwrap();
        register_trace(&mut orch, "ok", &[], &trace, false).unwrap();

        let (report, _) = run_all(&orch);
        assert_eq!(report.computed, vec!["ok"]);
        let skipped: Vec<&str> = report.skipped.iter().map(|(id, _)| id.as_str()).collect();
        assert!(skipped.contains(&"bad"));
        assert!(skipped.contains(&"child"));
    }

    #[test]
    fn test_selection_pulls_dependencies() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Settings::default());
        register_trace(&mut orch, "base", &[], &trace, false).unwrap();
        register_trace(&mut orch, "derived", &["base"], &trace, false).unwrap();
        register_trace(&mut orch, "unrelated", &[], &trace, false).unwrap();

        let graph = ModelGraph::new();
        let image = crate::image::ConstantImage::new(0.0, [1, 1, 1], 1, 1);
        let mut features = FeatureModel::new();
        let report = orch
            .compute(&graph, &image, &mut features, Some(&["derived"]), false)
            .unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["base", "derived"]);
        assert_eq!(report.computed.len(), 2);
        assert!(!features.contains("F:unrelated"));
    }

    #[test]
    fn test_precanceled_token_runs_nothing() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut orch = Orchestrator::new(Settings::default());
        register_trace(&mut orch, "a", &[], &trace, false).unwrap();

        let graph = ModelGraph::new();
        let image = crate::image::ConstantImage::new(0.0, [1, 1, 1], 1, 1);
        let mut features = FeatureModel::new();
        let cancel = CancellationToken::new();
        cancel.cancel("before start");
        let report = orch
            .compute_with(&graph, &image, &mut features, None, false, cancel, &NoopProgress)
            .unwrap();
        assert!(report.computed.is_empty());
        assert_eq!(report.canceled, Some("before start".into()));
    }
}
