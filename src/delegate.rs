use async_trait::async_trait;

use crate::node::Node;

/// Hooks through which an application participates in the protocol.
///
/// All methods have no-op defaults, so implementors override only the
/// capabilities they use. Callbacks may be invoked concurrently from any
/// of the protocol tasks.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Metadata advertised for the local node, at most `limit` bytes.
    /// Returning more than `limit` bytes violates the contract and
    /// aborts the process.
    async fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// A user message arrived from a peer.
    async fn notify_msg(&self, _msg: Vec<u8>) {}

    /// User messages to piggyback on the next gossip datagram. Each
    /// message costs `overhead` bytes of framing; the total must stay
    /// within `limit`.
    async fn broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Locally-scoped state to ship during a push/pull exchange.
    async fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Counterpart of [`Delegate::local_state`]: the remote peer's user
    /// state, received during a push/pull exchange.
    async fn merge_remote_state(&self, _state: Vec<u8>, _join: bool) {}
}

/// Observer of membership changes.
#[async_trait]
pub trait EventDelegate: Send + Sync {
    /// A node joined, or a dead node came back.
    async fn notify_join(&self, _node: &Node) {}

    /// A live node's attributes (address, metadata) changed.
    async fn notify_update(&self, _node: &Node) {}

    /// A node left the cluster or was declared dead.
    async fn notify_leave(&self, _node: &Node) {}
}
