use std::net::{IpAddr, SocketAddr};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::state::NodeState;

/// Largest node metadata blob a delegate may hand out.
pub const META_MAX_SIZE: usize = 512;

/// Identity and static attributes of a cluster member.
///
/// `name` is the node's unique identity within the cluster; everything
/// else may change over time, guarded by the incarnation number kept on
/// the tracked [`NodeEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique name within the cluster.
    pub name: String,

    /// IP address peers should reach this node at.
    pub addr: IpAddr,

    /// UDP/TCP port the node listens on.
    pub port: u16,

    /// Opaque delegate-provided metadata, at most [`META_MAX_SIZE`] bytes.
    pub meta: Vec<u8>,

    /// Protocol version tuple: [pmin, pmax, pcur, dmin, dmax, dcur].
    pub vsn: [u8; 6],
}

impl Node {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// A node as tracked in the local table: identity plus the mutable
/// liveness view (state, incarnation, time of last transition).
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: Node,
    pub state: NodeState,
    pub incarnation: u32,
    pub state_change: Instant,
}

impl NodeEntry {
    pub(crate) fn new(node: Node, state: NodeState, incarnation: u32) -> Self {
        Self {
            node,
            state,
            incarnation,
            state_change: Instant::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }

    pub fn is_suspect(&self) -> bool {
        self.state == NodeState::Suspect
    }

    pub fn is_dead(&self) -> bool {
        self.state == NodeState::Dead
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.node.socket_addr()
    }
}
