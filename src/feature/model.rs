//! The feature registry: key → feature, with listener notification.

use hashbrown::HashMap;
use tracing::debug;

use super::{Feature, TargetType};

/// Emitted to listeners when the registry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureModelEvent {
    Declared(String),
    Removed(String),
}

type Listener = Box<dyn Fn(&FeatureModelEvent) + Send + Sync>;

/// Registry mapping feature keys to computed features.
///
/// Listeners are notified on declare/remove. During bulk load the
/// notifications can be paused; events are coalesced and delivered when
/// the last pause scope ends. Pausing nests.
#[derive(Default)]
pub struct FeatureModel {
    features: HashMap<String, Box<dyn Feature>>,
    listeners: Vec<Listener>,
    pause_depth: usize,
    pending: Vec<FeatureModelEvent>,
}

impl FeatureModel {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register a feature under its spec key, replacing any previous one.
    pub fn declare(&mut self, feature: Box<dyn Feature>) {
        let key = feature.spec().key.clone();
        debug!(feature = %key, "declaring feature");
        self.features.insert(key.clone(), feature);
        self.emit(FeatureModelEvent::Declared(key));
    }

    pub fn get(&self, key: &str) -> Option<&dyn Feature> {
        self.features.get(key).map(|f| f.as_ref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.features.contains_key(key)
    }

    /// Remove and return a feature without firing a removal event. Used
    /// by computers recovering a deserialized output before a run.
    pub fn take(&mut self, key: &str) -> Option<Box<dyn Feature>> {
        self.features.remove(key)
    }

    pub fn undeclare(&mut self, key: &str) -> bool {
        if self.features.remove(key).is_some() {
            self.emit(FeatureModelEvent::Removed(key.to_string()));
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        let keys: Vec<String> = self.features.keys().cloned().collect();
        self.features.clear();
        for key in keys {
            self.emit(FeatureModelEvent::Removed(key));
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Invalidate every feature targeting the given pool before that pool
    /// recycles its indices en masse.
    pub fn before_clear_pool(&mut self, target: TargetType) {
        for feature in self.features.values_mut() {
            if feature.spec().target == target {
                feature.before_clear_pool();
            }
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn add_listener(&mut self, listener: impl Fn(&FeatureModelEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Suspend listener notification. Nests; events are queued and
    /// delivered when the matching [`resume_listeners`](Self::resume_listeners)
    /// brings the depth back to zero.
    pub fn pause_listeners(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume_listeners(&mut self) {
        debug_assert!(self.pause_depth > 0, "unbalanced resume_listeners");
        self.pause_depth = self.pause_depth.saturating_sub(1);
        if self.pause_depth == 0 {
            let pending = std::mem::take(&mut self.pending);
            for event in &pending {
                for listener in &self.listeners {
                    listener(event);
                }
            }
        }
    }

    fn emit(&mut self, event: FeatureModelEvent) {
        if self.pause_depth > 0 {
            self.pending.push(event);
        } else {
            for listener in &self.listeners {
                listener(&event);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
