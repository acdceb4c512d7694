//! # Update Log
//!
//! A bounded history of "objects touched since the last computation
//! pass", per target type. Graph mutations are recorded into the current
//! state; a computation pass seals it, stamping the feature keys it
//! brought up to date. A computer asks [`UpdateLog::changes_for`] for the
//! union of changes since its feature was last computed — `None` means
//! there is no incremental basis and a full recomputation is required.
//!
//! The log never grows unbounded: oldest states are evicted past the
//! configured capacity, silently degrading the affected features to full
//! recomputation. After a full forced pass the log is [`cleared`](UpdateLog::clear).

use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::graph::PoolIndex;

// ============================================================================
// ChangeSet
// ============================================================================

/// Union of objects touched since a feature was last computed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub vertices: HashSet<PoolIndex>,
    pub edges: HashSet<PoolIndex>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.edges.is_empty()
    }
}

// ============================================================================
// UpdateState
// ============================================================================

/// One snapshot in the log: the objects touched during one recording
/// window, and — once sealed — the feature keys the sealing pass
/// brought up to date.
#[derive(Debug, Clone, Default)]
struct UpdateState {
    vertices: HashSet<PoolIndex>,
    edges: HashSet<PoolIndex>,
    /// Empty while this state is still recording.
    computed: HashSet<String>,
}

// ============================================================================
// UpdateLog
// ============================================================================

/// Fixed-capacity deque of update states. Front is the current recording
/// state; deeper entries are sealed history.
#[derive(Debug)]
pub struct UpdateLog {
    states: VecDeque<UpdateState>,
    capacity: usize,
}

impl UpdateLog {
    pub const DEFAULT_CAPACITY: usize = 10;

    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "update log needs at least the recording state");
        let mut states = VecDeque::with_capacity(capacity);
        states.push_front(UpdateState::default());
        Self { states, capacity }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    pub fn record_vertex(&mut self, index: PoolIndex) {
        self.recording().vertices.insert(index);
    }

    pub fn record_edge(&mut self, index: PoolIndex) {
        self.recording().edges.insert(index);
    }

    fn recording(&mut self) -> &mut UpdateState {
        // Invariant: there is always exactly one recording state at the front.
        self.states.front_mut().expect("update log always has a recording state")
    }

    // ========================================================================
    // Consumption
    // ========================================================================

    /// Changes since `feature_key` was last computed, or `None` when the
    /// log holds no basis for it (never computed here, or the marker was
    /// evicted) — the caller must then recompute in full.
    pub fn changes_for(&self, feature_key: &str) -> Option<ChangeSet> {
        let mut changes = ChangeSet::default();
        for state in &self.states {
            if state.computed.contains(feature_key) {
                // This state was sealed by the pass that computed the
                // feature; its changes predate that computation.
                return Some(changes);
            }
            changes.vertices.extend(state.vertices.iter().copied());
            changes.edges.extend(state.edges.iter().copied());
        }
        None
    }

    /// Seal the current recording state, stamping the feature keys the
    /// finishing pass brought up to date, and open a fresh one. Evicts
    /// the oldest state past capacity.
    pub fn commit(&mut self, computed_keys: impl IntoIterator<Item = String>) {
        self.recording().computed = computed_keys.into_iter().collect();
        self.states.push_front(UpdateState::default());
        while self.states.len() > self.capacity {
            self.states.pop_back();
        }
    }

    /// Reset after a full recomputation: all history is discarded.
    pub fn clear(&mut self) {
        self.states.clear();
        self.states.push_front(UpdateState::default());
    }

    /// True when nothing has been recorded since the last commit/clear.
    pub fn is_quiet(&self) -> bool {
        self.states
            .front()
            .map(|s| s.vertices.is_empty() && s.edges.is_empty())
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        // The recording state alone counts as empty history.
        self.states.len() <= 1 && self.is_quiet()
    }
}

impl Default for UpdateLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

// ============================================================================
// Tests
// ============================================================================
