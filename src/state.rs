use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness state of a cluster node as seen from the local view.
///
/// Transitions follow the SWIM lifecycle: a node enters as `Alive`,
/// is demoted to `Suspect` when probing fails, and becomes `Dead`
/// when the suspicion timer expires without a refutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
}

impl NodeState {
    /// Check if the state still counts toward cluster membership.
    pub fn is_member(&self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Alive => write!(f, "alive"),
            NodeState::Suspect => write!(f, "suspect"),
            NodeState::Dead => write!(f, "dead"),
        }
    }
}
