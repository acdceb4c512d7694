//! A link: a directed time-edge between two spots.

use serde::{Deserialize, Serialize};
use super::SpotId;

/// Directed edge from a spot at timepoint `t` to a spot at a later
/// timepoint, expressing identity across time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source: SpotId,
    pub target: SpotId,
}
