//! # Tracked-Object Graph Model
//!
//! Spots (point detections in space-time) and links (directed time-edges
//! between spots) live in object pools with stable-but-recyclable integer
//! indices. A released slot is reused by later creations; ids are
//! generation-tagged so a stale id can never read a recycled slot's new
//! occupant.
//!
//! Design rule: NO feature types, NO image types here. This module is pure
//! graph data — the feature engine consumes it, it knows nothing about the
//! feature engine except the [`UpdateLog`] it feeds on every mutation.

pub mod pool;
pub mod spot;
pub mod link;

pub use pool::{Pool, PoolIndex};
pub use spot::Spot;
pub use link::Link;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::update::UpdateLog;
use crate::{Error, Result};

// ============================================================================
// Ids
// ============================================================================

/// Generation-tagged spot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpotId {
    pub index: PoolIndex,
    pub generation: u32,
}

impl std::fmt::Display for SpotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "spot#{}.{}", self.index, self.generation)
    }
}

/// Generation-tagged link identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId {
    pub index: PoolIndex,
    pub generation: u32,
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}.{}", self.index, self.generation)
    }
}

// ============================================================================
// ModelGraph
// ============================================================================

/// The tracked-object graph: a spot pool, a link pool, a per-timepoint
/// index, and the update log that records every mutation.
///
/// Topology editing here is deliberately minimal — just enough for the
/// feature engine and its tests to drive the graph. The engine only ever
/// *reads* the graph; mutation happens between computation passes.
pub struct ModelGraph {
    spots: Pool<Spot>,
    links: Pool<Link>,
    /// timepoint → spot ids present at that timepoint
    timepoint_index: HashMap<u32, Vec<SpotId>>,
    /// spot → incident link ids (both directions)
    adjacency: HashMap<SpotId, Vec<LinkId>>,
    update_log: RwLock<UpdateLog>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::with_log_capacity(UpdateLog::DEFAULT_CAPACITY)
    }

    /// Build a graph whose update log honors
    /// [`Settings::update_log_capacity`](crate::Settings).
    pub fn from_settings(settings: &crate::Settings) -> Self {
        Self::with_log_capacity(settings.update_log_capacity)
    }

    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            spots: Pool::new(),
            links: Pool::new(),
            timepoint_index: HashMap::new(),
            adjacency: HashMap::new(),
            update_log: RwLock::new(UpdateLog::new(capacity)),
        }
    }

    // ========================================================================
    // Spots
    // ========================================================================

    pub fn add_spot(&mut self, timepoint: u32, position: [f64; 3], covariance: [[f64; 3]; 3]) -> SpotId {
        let (index, generation) = self.spots.create(Spot { timepoint, position, covariance });
        let id = SpotId { index, generation };
        self.timepoint_index.entry(timepoint).or_default().push(id);
        self.adjacency.insert(id, Vec::new());
        self.update_log.write().record_vertex(id.index);
        id
    }

    pub fn spot(&self, id: SpotId) -> Option<&Spot> {
        self.spots.get(id.index, id.generation)
    }

    /// Move a spot to a new position, recording the change.
    pub fn move_spot(&mut self, id: SpotId, position: [f64; 3]) -> Result<()> {
        let spot = self.spots.get_mut(id.index, id.generation)
            .ok_or_else(|| Error::ConfigError(format!("No such spot: {id}")))?;
        spot.position = position;
        let mut log = self.update_log.write();
        log.record_vertex(id.index);
        // A spot move also changes every incident link's geometry.
        if let Some(incident) = self.adjacency.get(&id) {
            for lid in incident {
                log.record_edge(lid.index);
            }
        }
        Ok(())
    }

    pub fn set_covariance(&mut self, id: SpotId, covariance: [[f64; 3]; 3]) -> Result<()> {
        let spot = self.spots.get_mut(id.index, id.generation)
            .ok_or_else(|| Error::ConfigError(format!("No such spot: {id}")))?;
        spot.covariance = covariance;
        self.update_log.write().record_vertex(id.index);
        Ok(())
    }

    /// Remove a spot and all its incident links.
    pub fn remove_spot(&mut self, id: SpotId) -> bool {
        let Some(spot) = self.spots.get(id.index, id.generation) else { return false };
        let timepoint = spot.timepoint;

        let incident = self.adjacency.remove(&id).unwrap_or_default();
        for lid in incident {
            self.remove_link(lid);
        }

        if let Some(ids) = self.timepoint_index.get_mut(&timepoint) {
            ids.retain(|sid| *sid != id);
        }
        self.spots.release(id.index, id.generation).is_some()
    }

    // ========================================================================
    // Links
    // ========================================================================

    pub fn add_link(&mut self, source: SpotId, target: SpotId) -> Result<LinkId> {
        if self.spot(source).is_none() {
            return Err(Error::ConfigError(format!("Source spot not found: {source}")));
        }
        if self.spot(target).is_none() {
            return Err(Error::ConfigError(format!("Target spot not found: {target}")));
        }
        let (index, generation) = self.links.create(Link { source, target });
        let id = LinkId { index, generation };
        self.adjacency.entry(source).or_default().push(id);
        if source != target {
            self.adjacency.entry(target).or_default().push(id);
        }
        self.update_log.write().record_edge(id.index);
        Ok(id)
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.index, id.generation)
    }

    pub fn remove_link(&mut self, id: LinkId) -> bool {
        let Some(link) = self.links.get(id.index, id.generation).copied() else { return false };
        if let Some(ids) = self.adjacency.get_mut(&link.source) {
            ids.retain(|lid| *lid != id);
        }
        if let Some(ids) = self.adjacency.get_mut(&link.target) {
            ids.retain(|lid| *lid != id);
        }
        self.links.release(id.index, id.generation).is_some()
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Spots present at a given timepoint, in creation order.
    pub fn spatial_index_at(&self, timepoint: u32) -> impl Iterator<Item = SpotId> + '_ {
        self.timepoint_index
            .get(&timepoint)
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
    }

    pub fn spot_ids(&self) -> impl Iterator<Item = SpotId> + '_ {
        self.spots.iter_ids().map(|(index, generation)| SpotId { index, generation })
    }

    pub fn link_ids(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.links.iter_ids().map(|(index, generation)| LinkId { index, generation })
    }

    pub fn num_spots(&self) -> usize {
        self.spots.len()
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    /// Highest timepoint with at least one spot, if any.
    pub fn max_timepoint(&self) -> Option<u32> {
        self.timepoint_index
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(t, _)| *t)
            .max()
    }

    // ========================================================================
    // Update log
    // ========================================================================

    pub fn update_log(&self) -> &RwLock<UpdateLog> {
        &self.update_log
    }

    // ========================================================================
    // Bulk reset
    // ========================================================================

    /// Drop every spot and link and reset the update log.
    ///
    /// Callers holding feature stores must invalidate them first (see
    /// `PropertyStore::before_clear_pool`); indices recycle from zero
    /// after this.
    pub fn clear(&mut self) {
        self.spots.clear();
        self.links.clear();
        self.timepoint_index.clear();
        self.adjacency.clear();
        self.update_log.write().clear();
    }
}

impl Default for ModelGraph {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::spot::unit_covariance;

    fn simple_graph() -> (ModelGraph, SpotId, SpotId, LinkId) {
        let mut g = ModelGraph::new();
        let a = g.add_spot(0, [0.0, 0.0, 0.0], unit_covariance(4.0));
        let b = g.add_spot(1, [3.0, 4.0, 0.0], unit_covariance(4.0));
        let l = g.add_link(a, b).unwrap();
        (g, a, b, l)
    }

    #[test]
    fn test_add_and_get() {
        let (g, a, b, l) = simple_graph();
        assert_eq!(g.spot(a).unwrap().timepoint, 0);
        assert_eq!(g.spot(b).unwrap().position, [3.0, 4.0, 0.0]);
        assert_eq!(g.link(l).unwrap().source, a);
        assert_eq!(g.num_spots(), 2);
        assert_eq!(g.num_links(), 1);
    }

    #[test]
    fn test_link_requires_live_endpoints() {
        let (mut g, a, b, _) = simple_graph();
        g.remove_spot(b);
        assert!(g.add_link(a, b).is_err());
    }

    #[test]
    fn test_remove_spot_removes_incident_links() {
        let (mut g, a, _, l) = simple_graph();
        assert!(g.remove_spot(a));
        assert!(g.link(l).is_none());
        assert_eq!(g.num_links(), 0);
    }

    #[test]
    fn test_stale_id_after_recycle() {
        let (mut g, a, _, _) = simple_graph();
        g.remove_spot(a);
        // New spot reuses slot 0 but carries a new generation.
        let c = g.add_spot(2, [9.0, 9.0, 9.0], unit_covariance(1.0));
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
        assert!(g.spot(a).is_none());
        assert!(g.spot(c).is_some());
    }

    #[test]
    fn test_from_settings_bounds_update_log() {
        let settings = crate::Settings { update_log_capacity: 2, ..Default::default() };
        let mut g = ModelGraph::from_settings(&settings);
        for t in 0..6 {
            g.add_spot(t, [0.0, 0.0, 0.0], unit_covariance(1.0));
            g.update_log().write().commit(["x".to_string()]);
        }
        assert!(g.update_log().read().len() <= settings.update_log_capacity);
    }

    #[test]
    fn test_spatial_index() {
        let (g, a, b, _) = simple_graph();
        let at0: Vec<_> = g.spatial_index_at(0).collect();
        assert_eq!(at0, vec![a]);
        let at1: Vec<_> = g.spatial_index_at(1).collect();
        assert_eq!(at1, vec![b]);
        assert!(g.spatial_index_at(7).next().is_none());
    }

    #[test]
    fn test_move_spot_records_incident_edges() {
        let (mut g, a, _, l) = simple_graph();
        // Drain current changes first.
        g.update_log().write().commit(["x".to_string()]);
        g.move_spot(a, [1.0, 1.0, 1.0]).unwrap();
        let log = g.update_log().read();
        let changes = log.changes_for("x").unwrap();
        assert!(changes.vertices.contains(&a.index));
        assert!(changes.edges.contains(&l.index));
    }
}
