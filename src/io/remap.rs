//! Identity remapping between in-memory pool ids and file-local ids.
//!
//! Pool indices are a property of one session's allocation history;
//! serialized data must survive identity renumbering across sessions. On
//! save, live objects are numbered sequentially into file-local ids; on
//! load, the graph deserializer provides the inverse map from file-local
//! ids to the freshly allocated live objects.

use hashbrown::HashMap;

use crate::graph::{LinkId, ModelGraph, SpotId};

// ============================================================================
// ObjectToFileIdMap
// ============================================================================

/// Live object → sequential file-local id, per pool.
#[derive(Debug, Default)]
pub struct ObjectToFileIdMap {
    vertices: HashMap<SpotId, u32>,
    edges: HashMap<LinkId, u32>,
}

impl ObjectToFileIdMap {
    /// Number the graph's live objects in iteration order.
    pub fn from_graph(graph: &ModelGraph) -> Self {
        let mut map = Self::default();
        for (file_id, id) in graph.spot_ids().enumerate() {
            map.vertices.insert(id, file_id as u32);
        }
        for (file_id, id) in graph.link_ids().enumerate() {
            map.edges.insert(id, file_id as u32);
        }
        map
    }

    pub fn vertex_file_id(&self, id: SpotId) -> Option<u32> {
        self.vertices.get(&id).copied()
    }

    pub fn edge_file_id(&self, id: LinkId) -> Option<u32> {
        self.edges.get(&id).copied()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
}

// ============================================================================
// FileIdToObjectMap
// ============================================================================

/// File-local id → live object, per pool. Built by graph
/// deserialization; file ids are dense so a plain vector serves.
#[derive(Debug, Default)]
pub struct FileIdToObjectMap {
    vertices: Vec<SpotId>,
    edges: Vec<LinkId>,
}

impl FileIdToObjectMap {
    /// Inverse of [`ObjectToFileIdMap::from_graph`] over the same graph
    /// state.
    pub fn from_graph(graph: &ModelGraph) -> Self {
        Self {
            vertices: graph.spot_ids().collect(),
            edges: graph.link_ids().collect(),
        }
    }

    /// Build from explicit tables, file-id order.
    pub fn from_parts(vertices: Vec<SpotId>, edges: Vec<LinkId>) -> Self {
        Self { vertices, edges }
    }

    pub fn vertex(&self, file_id: u32) -> Option<SpotId> {
        self.vertices.get(file_id as usize).copied()
    }

    pub fn edge(&self, file_id: u32) -> Option<LinkId> {
        self.edges.get(file_id as usize).copied()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::spot::unit_covariance;

    #[test]
    fn test_roundtrip_same_graph() {
        let mut graph = ModelGraph::new();
        let a = graph.add_spot(0, [0.0; 3], unit_covariance(1.0));
        let b = graph.add_spot(1, [1.0; 3], unit_covariance(1.0));
        let l = graph.add_link(a, b).unwrap();

        let fwd = ObjectToFileIdMap::from_graph(&graph);
        let back = FileIdToObjectMap::from_graph(&graph);

        for id in [a, b] {
            let fid = fwd.vertex_file_id(id).unwrap();
            assert_eq!(back.vertex(fid), Some(id));
        }
        let fid = fwd.edge_file_id(l).unwrap();
        assert_eq!(back.edge(fid), Some(l));
    }

    #[test]
    fn test_dead_object_not_mapped() {
        let mut graph = ModelGraph::new();
        let a = graph.add_spot(0, [0.0; 3], unit_covariance(1.0));
        graph.remove_spot(a);
        let fwd = ObjectToFileIdMap::from_graph(&graph);
        assert_eq!(fwd.vertex_file_id(a), None);
        assert_eq!(fwd.num_vertices(), 0);
    }
}
