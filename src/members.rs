use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom as _;
use rand::thread_rng;
use tokio::time::Instant;

use crate::message::{Alive, Dead, PushNodeState, Suspect};
use crate::node::{Node, NodeEntry};
use crate::state::NodeState;

/// Outcome of applying an `alive` event to the table.
#[derive(Debug, PartialEq)]
pub(crate) enum AliveVerdict {
    /// Previously unknown node was inserted.
    Added,
    /// Existing node accepted the rumor; carries the prior state.
    Updated { old_state: NodeState },
    /// Stale or conflicting rumor, table unchanged.
    Ignored,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SuspectVerdict {
    Suspected,
    Ignored,
}

#[derive(Debug, PartialEq)]
pub(crate) enum DeadVerdict {
    Died { old_state: NodeState },
    Ignored,
}

struct TableInner {
    /// Probe order; always a permutation of `map`'s keys.
    order: Vec<String>,
    map: HashMap<String, NodeEntry>,
    probe_index: usize,
}

/// The authoritative local membership view.
///
/// A single reader-writer lock guards the sequence/map pair, so every
/// state-machine decision is atomic with respect to the node record it
/// concerns. Callers act on the returned verdict (broadcast, timers,
/// delegate callbacks) after the lock is released.
pub(crate) struct NodeTable {
    inner: RwLock<TableInner>,
}

impl NodeTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                order: Vec::new(),
                map: HashMap::new(),
                probe_index: 0,
            }),
        }
    }

    /// Apply an `alive` rumor. Conflict resolution:
    /// a fresh incarnation always wins; an equal incarnation wins only
    /// over a non-alive state; an address change needs a strictly
    /// greater incarnation.
    pub(crate) fn apply_alive(&self, a: &Alive) -> AliveVerdict {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.map.entry(a.node.clone()) {
            Entry::Vacant(slot) => {
                let node = Node {
                    name: a.node.clone(),
                    addr: a.addr,
                    port: a.port,
                    meta: a.meta.clone(),
                    vsn: a.vsn,
                };
                slot.insert(NodeEntry::new(node, NodeState::Alive, a.incarnation));
                inner.order.push(a.node.clone());
                AliveVerdict::Added
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let addr_changed =
                    entry.node.addr != a.addr || entry.node.port != a.port;
                if addr_changed && a.incarnation <= entry.incarnation {
                    return AliveVerdict::Ignored;
                }
                let accept = a.incarnation > entry.incarnation
                    || (a.incarnation == entry.incarnation
                        && entry.state != NodeState::Alive);
                if !accept {
                    return AliveVerdict::Ignored;
                }

                let old_state = entry.state;
                entry.node.addr = a.addr;
                entry.node.port = a.port;
                entry.node.meta = a.meta.clone();
                entry.node.vsn = a.vsn;
                entry.incarnation = a.incarnation;
                if entry.state != NodeState::Alive {
                    entry.state = NodeState::Alive;
                    entry.state_change = Instant::now();
                }
                AliveVerdict::Updated { old_state }
            }
        }
    }

    /// Apply a `suspect` rumor: demotes an alive node at an equal or
    /// greater incarnation. Cannot revive the dead or re-suspect.
    pub(crate) fn apply_suspect(&self, s: &Suspect) -> SuspectVerdict {
        let mut inner = self.inner.write();
        match inner.map.get_mut(&s.node) {
            Some(entry)
                if entry.state == NodeState::Alive && s.incarnation >= entry.incarnation =>
            {
                entry.state = NodeState::Suspect;
                entry.incarnation = s.incarnation;
                entry.state_change = Instant::now();
                SuspectVerdict::Suspected
            }
            _ => SuspectVerdict::Ignored,
        }
    }

    /// Apply a `dead` event. Dead is sticky: same-incarnation rumors
    /// cannot resurrect the node, only a fresher `alive` can.
    pub(crate) fn apply_dead(&self, d: &Dead) -> DeadVerdict {
        let mut inner = self.inner.write();
        match inner.map.get_mut(&d.node) {
            Some(entry)
                if entry.state != NodeState::Dead && d.incarnation >= entry.incarnation =>
            {
                let old_state = entry.state;
                entry.state = NodeState::Dead;
                entry.incarnation = d.incarnation;
                entry.state_change = Instant::now();
                DeadVerdict::Died { old_state }
            }
            _ => DeadVerdict::Ignored,
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<NodeEntry> {
        self.inner.read().map.get(name).cloned()
    }

    /// Snapshot of every tracked entry, dead included.
    pub(crate) fn entries(&self) -> Vec<NodeEntry> {
        self.inner.read().map.values().cloned().collect()
    }

    /// Non-dead members, as immutable copies.
    pub(crate) fn members(&self) -> Vec<Node> {
        self.inner
            .read()
            .map
            .values()
            .filter(|entry| entry.state.is_member())
            .map(|entry| entry.node.clone())
            .collect()
    }

    /// Count of non-dead members, without materializing the list.
    pub(crate) fn num_members(&self) -> usize {
        self.inner
            .read()
            .map
            .values()
            .filter(|entry| entry.state.is_member())
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    /// Next failure-detection target by round-robin, skipping the local
    /// node and the dead. On wrapping the sequence, dead nodes past
    /// `reap_after` are removed and the sequence is reshuffled.
    pub(crate) fn next_probe_target(
        &self,
        local_name: &str,
        reap_after: Duration,
    ) -> Option<NodeEntry> {
        let mut inner = self.inner.write();
        let mut checked = 0;
        loop {
            if checked >= inner.order.len() {
                return None;
            }
            if inner.probe_index >= inner.order.len() {
                Self::reap_and_shuffle(&mut inner, reap_after);
                inner.probe_index = 0;
                if inner.order.is_empty() {
                    return None;
                }
            }
            let name = inner.order[inner.probe_index].clone();
            inner.probe_index += 1;
            checked += 1;

            match inner.map.get(&name) {
                Some(entry) if entry.node.name != local_name && !entry.is_dead() => {
                    return Some(entry.clone());
                }
                _ => continue,
            }
        }
    }

    fn reap_and_shuffle(inner: &mut TableInner, reap_after: Duration) {
        let map = &mut inner.map;
        map.retain(|_, entry| {
            !(entry.is_dead() && entry.state_change.elapsed() > reap_after)
        });
        inner.order.retain(|name| map.contains_key(name));
        inner.order.shuffle(&mut thread_rng());
    }

    /// Up to `k` distinct random nodes satisfying `keep`.
    pub(crate) fn k_random<F>(&self, k: usize, keep: F) -> Vec<NodeEntry>
    where
        F: Fn(&NodeEntry) -> bool,
    {
        let inner = self.inner.read();
        let eligible: Vec<&NodeEntry> =
            inner.map.values().filter(|entry| keep(entry)).collect();
        eligible
            .choose_multiple(&mut thread_rng(), k)
            .map(|entry| (*entry).clone())
            .collect()
    }

    /// Full-state records for a push/pull exchange.
    pub(crate) fn push_pull_state(&self) -> Vec<PushNodeState> {
        self.inner
            .read()
            .map
            .values()
            .map(|entry| PushNodeState {
                name: entry.node.name.clone(),
                addr: entry.node.addr,
                port: entry.node.port,
                meta: entry.node.meta.clone(),
                incarnation: entry.incarnation,
                state: entry.state,
                vsn: entry.node.vsn,
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn sequence_matches_map(&self) -> bool {
        use std::collections::HashSet;
        let inner = self.inner.read();
        let order: HashSet<&String> = inner.order.iter().collect();
        let keys: HashSet<&String> = inner.map.keys().collect();
        inner.order.len() == inner.map.len() && order == keys
    }
}
