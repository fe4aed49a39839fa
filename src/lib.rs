//! SWIM-style cluster membership and failure detection.
//!
//! The crate is split along the protocol's natural seams:
//!
//! * `Peerlist`: the public handle and protocol engine. It owns the
//!   periodic loops (probe, gossip, push/pull), the inbound listeners,
//!   and the alive/suspect/dead state machine that reconciles rumors.
//!
//! * `NodeTable`: the authoritative local view of the cluster. All
//!   membership changes flow through its `apply_*` entry points, which
//!   decide each event atomically against the node's current record.
//!
//! * Transport: UDP datagrams carry probes and gossip, TCP streams carry
//!   the anti-entropy push/pull exchange and reliable user messages.
//!   Both sit behind the `NodeTransport` trait so tests can run the
//!   whole engine against an in-memory mock.
//!
//! Failure detection follows SWIM: each probe tick picks the next peer
//! round-robin and pings it over UDP. A missed ack fans out indirect
//! pings through random peers (plus a TCP fallback for asymmetric
//! partitions) before the target is suspected. Suspicion starts a timer
//! scaled by cluster size; the accused node refutes by gossiping a fresh
//! alive with a higher incarnation, otherwise the timer declares it
//! dead. Every state change is queued on a transmit-limited broadcast
//! queue and piggybacks on the gossip fan-out until it has been sent
//! `ceil(mult · log10(n + 1))` times.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use rand::{thread_rng, Rng as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::{self, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::MessageCodec;
use crate::config::MAX_UDP_PACKET_SIZE;
use crate::event_scheduler::{EventScheduler, EventState, EventType};
use crate::members::{AliveVerdict, DeadVerdict, NodeTable, SuspectVerdict};
use crate::message::{
    Ack, Alive, Dead, IndirectPing, Message, MessageKind, Nack, Ping, PushNodeState, Suspect,
    UserMsg,
};
mod broadcast_queue;
mod codec;
pub mod config;
mod delegate;
mod event_scheduler;
mod ip_addr;
mod members;
mod message;
#[cfg(test)]
mod mock_transport;
mod node;
mod state;
mod transport;

pub use broadcast_queue::{BroadcastQueue, DefaultBroadcastQueue};
pub use config::{PeerlistConfig, PeerlistConfigBuilder};
pub use delegate::{Delegate, EventDelegate};
pub use ip_addr::IpAddress;
pub use node::{Node, META_MAX_SIZE};
pub use state::NodeState;
pub use transport::{Datagram, DefaultTransport, NodeTransport};

/// Framing overhead per message inside a compound datagram.
const COMPOUND_MSG_OVERHEAD: usize = 2;

/// Upper bound on a single push/pull stream frame.
const MAX_STREAM_FRAME: usize = 8 * 1024 * 1024;

/// Handle to a running membership instance.
///
/// Cloning is cheap; all clones share the same node. Dropping the last
/// handle does not stop the instance, call [`Peerlist::shutdown`].
pub struct Peerlist {
    inner: Arc<InnerPeerlist>,
}

impl Clone for Peerlist {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct InnerPeerlist {
    /// Configuration, fixed for the lifetime of the instance.
    config: PeerlistConfig,

    /// Address advertised to peers; differs from the bind address when
    /// bound to the wildcard.
    advertise: SocketAddr,

    /// Authoritative local membership view.
    nodes: Arc<NodeTable>,

    /// Network surface for datagrams and streams.
    transport: Arc<dyn NodeTransport>,

    /// Wire codec carrying the configured envelopes.
    codec: MessageCodec,

    /// Pending gossip, retransmit-limited.
    broadcasts: Arc<dyn BroadcastQueue>,

    /// Ack handlers and suspicion timers keyed by deadline.
    scheduler: EventScheduler,

    /// Signals every background task to exit.
    shutdown_tx: broadcast::Sender<()>,

    /// Serializes leave/shutdown against each other.
    lifecycle: Mutex<()>,

    /// Per-probe sequence numbers.
    sequence_num: AtomicU32,

    /// Our own incarnation; bumped only by us, when refuting.
    incarnation: AtomicU32,

    leave: AtomicBool,
    shutdown: AtomicBool,

    /// Fired when our own leave broadcast has fully drained.
    leave_broadcast: Arc<Notify>,

    /// Nacks received from indirect probers; a coarse health signal.
    probe_nacks: AtomicU64,

    /// Inbound packets dropped because they failed to decode.
    malformed_packets: AtomicU64,
}

impl Peerlist {
    /// Create a membership instance: validate the configuration, bind
    /// the listeners, register the local node as alive, and start the
    /// protocol loops. The instance knows only itself until
    /// [`Peerlist::join`] is called.
    pub async fn create(config: PeerlistConfig) -> Result<Self> {
        config.validate()?;
        let transport = DefaultTransport::new(config.bind_addr, config.port).await?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Like [`Peerlist::create`], against a caller-provided transport.
    pub async fn with_transport(
        config: PeerlistConfig,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        let this = Self::assemble(config, transport).await?;
        this.launch_tasks();
        Ok(this)
    }

    /// Build the handle and register the local node, without starting
    /// any background task.
    async fn assemble(
        mut config: PeerlistConfig,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        config.validate()?;
        if config.enable_compression && config.protocol_version < 1 {
            warn!("compression is not supported below protocol version 1, disabling");
            config.enable_compression = false;
        }

        let local_addr = transport.local_addr()?;
        let advertise_ip = if config.bind_addr.is_unspecified() {
            ip_addr::find_private_ip()?
        } else {
            local_addr.ip()
        };
        let advertise = SocketAddr::new(advertise_ip, local_addr.port());
        if !ip_addr::is_private(&advertise_ip)
            && !advertise_ip.is_loopback()
            && config.secret_key.is_none()
        {
            warn!(addr = %advertise, "binding to a public address without encryption");
        }

        let codec = MessageCodec::new(config.secret_key, config.enable_compression)?;
        let nodes = Arc::new(NodeTable::new());
        let broadcasts: Arc<dyn BroadcastQueue> = {
            let nodes = Arc::clone(&nodes);
            Arc::new(DefaultBroadcastQueue::new(config.retransmit_mult, move || {
                nodes.len()
            }))
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let this = Self {
            inner: Arc::new(InnerPeerlist {
                config,
                advertise,
                nodes,
                transport,
                codec,
                broadcasts,
                scheduler: EventScheduler::new(),
                shutdown_tx,
                lifecycle: Mutex::new(()),
                sequence_num: AtomicU32::new(0),
                incarnation: AtomicU32::new(0),
                leave: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                leave_broadcast: Arc::new(Notify::new()),
                probe_nacks: AtomicU64::new(0),
                malformed_packets: AtomicU64::new(0),
            }),
        };

        this.set_alive().await?;
        info!(name = %this.inner.config.name, addr = %advertise, "peerlist node started");
        Ok(this)
    }

    fn launch_tasks(&self) {
        self.launch_datagram_listener();
        self.launch_stream_listener();
        self.launch_deadline_loop();
        self.launch_prober();
        self.launch_gossiper();
        self.launch_push_pull();
    }

    /// Name of the local node.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Address the local node advertises to the cluster.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.advertise
    }

    /// Protocol version currently in use.
    pub fn protocol_version(&self) -> u8 {
        self.inner.config.protocol_version
    }

    /// Snapshot of all known non-dead members, local node included.
    pub fn members(&self) -> Vec<Node> {
        self.inner.nodes.members()
    }

    /// Number of known non-dead members, without materializing a list.
    pub fn num_members(&self) -> usize {
        self.inner.nodes.num_members()
    }

    /// The local node's own record.
    pub fn local_node(&self) -> Result<Node> {
        self.inner
            .nodes
            .get(&self.inner.config.name)
            .map(|entry| entry.node)
            .ok_or_else(|| anyhow!("local node is not registered"))
    }

    /// Join a cluster by push/pull syncing with each seed. Returns how
    /// many seeds were reached; an error only if none were.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut successes = 0;
        let mut last_err = None;
        for seed in seeds {
            let addr = match self.resolve_addr(seed).await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(seed = %seed, "failed to resolve seed: {}", e);
                    last_err = Some(e);
                    continue;
                }
            };
            match self.push_pull_node(addr, true).await {
                Ok(()) => successes += 1,
                Err(e) => {
                    warn!(seed = %seed, "failed to join via seed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        if successes == 0 {
            if let Some(e) = last_err {
                return Err(e).context("unable to reach any seed node");
            }
            bail!("no seed nodes given");
        }
        Ok(successes)
    }

    /// Resolve `host[:port]`, appending the configured port when absent
    /// and falling back to DNS for names.
    async fn resolve_addr(&self, host: &str) -> Result<SocketAddr> {
        let mut attempt = host.to_string();
        for retried in [false, true] {
            if let Ok(addr) = attempt.parse::<SocketAddr>() {
                return Ok(addr);
            }
            if let Ok(mut addrs) = tokio::net::lookup_host(attempt.as_str()).await {
                if let Some(addr) = addrs.next() {
                    return Ok(addr);
                }
            }
            if retried {
                break;
            }
            attempt = format!("{}:{}", host, self.inner.config.port);
        }
        Err(anyhow!("unable to resolve address: {}", host))
    }

    /// Announce departure and block until the dead broadcast for the
    /// local node has drained (or `wait` elapses). The node keeps
    /// gossiping until [`Peerlist::shutdown`]; peers just see it dead.
    ///
    /// Safe to call repeatedly. Calling it after `shutdown` is a
    /// programming error and panics.
    pub async fn leave(&self, wait: Duration) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.shutdown.load(Ordering::SeqCst) {
            panic!("leave after shutdown");
        }
        if self.inner.leave.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(entry) = self.inner.nodes.get(&self.inner.config.name) else {
            warn!("leaving, but the local node is not in the table");
            return Ok(());
        };
        let d = Dead {
            incarnation: entry.incarnation,
            node: entry.node.name.clone(),
            from: self.inner.config.name.clone(),
        };
        self.dead_node(d).await?;

        let any_alive = self
            .inner
            .nodes
            .entries()
            .iter()
            .any(|e| e.state.is_member() && e.node.name != self.inner.config.name);
        if !any_alive {
            return Ok(());
        }

        let notified = self.inner.leave_broadcast.notified();
        if wait.is_zero() {
            notified.await;
            Ok(())
        } else {
            timeout(wait, notified)
                .await
                .map_err(|_| anyhow!("timeout waiting for leave broadcast"))
        }
    }

    /// Stop all background tasks and close the listeners. No dead
    /// broadcast is sent; peers detect the disappearance by probing.
    /// Safe to call repeatedly.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.shutdown_tx.send(());
        self.inner.transport.shutdown().await?;
        info!(name = %self.inner.config.name, "peerlist node shut down");
        Ok(())
    }

    /// Send an opaque user payload over UDP, best effort. Delivered to
    /// the remote delegate's `notify_msg`.
    pub async fn send_to(&self, target: SocketAddr, msg: &[u8]) -> Result<()> {
        let packet = self.inner.codec.encode(&Message::User(UserMsg {
            payload: msg.to_vec(),
        }))?;
        self.inner.transport.send_to(target, &packet).await
    }

    /// Send an opaque user payload over a reliable stream.
    pub async fn send_to_reliable(&self, target: SocketAddr, msg: &[u8]) -> Result<()> {
        let mut stream = self
            .inner
            .transport
            .dial_stream(target, self.inner.config.stream_timeout)
            .await?;
        let frame = self.inner.codec.encode(&Message::User(UserMsg {
            payload: msg.to_vec(),
        }))?;
        write_frame(&mut stream, &frame).await
    }

    // ---- counters ----------------------------------------------------

    fn next_seq_no(&self) -> u32 {
        self.inner.sequence_num.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_incarnation(&self) -> u32 {
        self.inner.incarnation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Jump the incarnation forward by `offset`, returning the new value.
    fn skip_incarnation(&self, offset: u32) -> u32 {
        self.inner.incarnation.fetch_add(offset, Ordering::SeqCst) + offset
    }

    // ---- local registration ------------------------------------------

    /// Register the local node as alive, as if the rumor had arrived
    /// from the network. Also used to re-assert liveness on refutation.
    async fn set_alive(&self) -> Result<()> {
        let meta = match &self.inner.config.delegate {
            Some(delegate) => delegate.node_meta(META_MAX_SIZE).await,
            None => Vec::new(),
        };
        if meta.len() > META_MAX_SIZE {
            // Delegate contract violation; continuing would poison the
            // cluster view.
            panic!("node meta data exceeds the {} byte limit", META_MAX_SIZE);
        }

        let a = Alive {
            incarnation: self.next_incarnation(),
            node: self.inner.config.name.clone(),
            addr: self.inner.advertise.ip(),
            port: self.inner.advertise.port(),
            meta,
            vsn: self.inner.config.vsn(),
        };
        self.alive_node(a, true).await
    }

    // ---- state machine -----------------------------------------------

    /// Apply an alive rumor. `bootstrap` marks the initial
    /// self-registration, which must not trigger refutation.
    async fn alive_node(&self, a: Alive, bootstrap: bool) -> Result<()> {
        if a.node == self.inner.config.name && !bootstrap {
            return self.handle_alive_about_self(a).await;
        }

        let verdict = self.inner.nodes.apply_alive(&a);
        match verdict {
            AliveVerdict::Added => {
                debug!(node = %a.node, incarnation = a.incarnation, "node joined");
                self.queue_message_broadcast(&Message::Alive(a.clone()), &a.node, None)?;
                self.notify_join(&a.node).await;
            }
            AliveVerdict::Updated { old_state } => {
                debug!(node = %a.node, incarnation = a.incarnation, "node alive again");
                self.inner.scheduler.cancel(&EventType::SuspicionTimeout {
                    node: a.node.clone(),
                });
                self.queue_message_broadcast(&Message::Alive(a.clone()), &a.node, None)?;
                if old_state == NodeState::Dead {
                    self.notify_join(&a.node).await;
                } else {
                    self.notify_update(&a.node).await;
                }
            }
            AliveVerdict::Ignored => {
                debug!(
                    node = %a.node,
                    incarnation = a.incarnation,
                    "stale alive rumor ignored"
                );
            }
        }
        Ok(())
    }

    /// An alive rumor about ourselves: ignore exact echoes of our own
    /// state, refute anything stale or conflicting.
    async fn handle_alive_about_self(&self, a: Alive) -> Result<()> {
        let Some(entry) = self.inner.nodes.get(&self.inner.config.name) else {
            return Ok(());
        };
        let matches_own = a.addr == entry.node.addr
            && a.port == entry.node.port
            && a.meta == entry.node.meta
            && a.vsn == entry.node.vsn;
        if a.incarnation <= entry.incarnation && matches_own {
            return Ok(());
        }
        warn!(
            incarnation = a.incarnation,
            "conflicting alive rumor about the local node, refuting"
        );
        self.refute(a.incarnation).await
    }

    async fn suspect_node(&self, s: Suspect) -> Result<()> {
        if s.node == self.inner.config.name {
            warn!(from = %s.from, "we are being suspected, refuting");
            return self.refute(s.incarnation).await;
        }

        match self.inner.nodes.apply_suspect(&s) {
            SuspectVerdict::Suspected => {
                info!(node = %s.node, from = %s.from, "node is now suspected");
                let deadline = Instant::now()
                    + self
                        .inner
                        .config
                        .suspicion_timeout(self.inner.nodes.len());
                // An already-armed timer keeps its earlier deadline.
                if let Err(e) = self.inner.scheduler.schedule(
                    EventType::SuspicionTimeout {
                        node: s.node.clone(),
                    },
                    deadline,
                ) {
                    debug!(node = %s.node, "suspicion timer already armed: {}", e);
                }
                self.queue_message_broadcast(&Message::Suspect(s.clone()), &s.node, None)?;
            }
            SuspectVerdict::Ignored => {
                debug!(node = %s.node, "suspect rumor ignored");
            }
        }
        Ok(())
    }

    async fn dead_node(&self, d: Dead) -> Result<()> {
        let about_self = d.node == self.inner.config.name;
        if about_self && !self.inner.leave.load(Ordering::SeqCst) {
            warn!(from = %d.from, "we are being declared dead, refuting");
            return self.refute(d.incarnation).await;
        }

        match self.inner.nodes.apply_dead(&d) {
            DeadVerdict::Died { old_state } => {
                info!(node = %d.node, was = %old_state, "node is dead");
                self.inner.scheduler.cancel(&EventType::SuspicionTimeout {
                    node: d.node.clone(),
                });
                // Our own departure rides this broadcast; leave() blocks
                // until the queue reports it fully drained.
                let notify = about_self.then(|| Arc::clone(&self.inner.leave_broadcast));
                self.queue_message_broadcast(&Message::Dead(d.clone()), &d.node, notify)?;
                self.notify_leave(&d.node).await;
            }
            DeadVerdict::Ignored => {
                debug!(node = %d.node, "dead rumor ignored");
            }
        }
        Ok(())
    }

    /// Re-assert our own liveness with an incarnation strictly above the
    /// rumor's, and gossip the fresh alive.
    async fn refute(&self, rumor_incarnation: u32) -> Result<()> {
        let mut incarnation = self.next_incarnation();
        if incarnation <= rumor_incarnation {
            let jump = {
                let mut rng = thread_rng();
                rumor_incarnation - incarnation + 1 + rng.gen_range(0..10)
            };
            incarnation = self.skip_incarnation(jump);
        }

        let Some(entry) = self.inner.nodes.get(&self.inner.config.name) else {
            bail!("cannot refute: local node is not registered");
        };
        let a = Alive {
            incarnation,
            node: entry.node.name.clone(),
            addr: entry.node.addr,
            port: entry.node.port,
            meta: entry.node.meta.clone(),
            vsn: entry.node.vsn,
        };
        info!(incarnation, "refuting rumor about the local node");
        self.inner.nodes.apply_alive(&a);
        self.queue_message_broadcast(&Message::Alive(a.clone()), &a.node, None)?;
        Ok(())
    }

    /// Encode and enqueue a membership broadcast, tagged by node name so
    /// a fresher rumor about the same node replaces it.
    fn queue_message_broadcast(
        &self,
        msg: &Message,
        node: &str,
        notify: Option<Arc<Notify>>,
    ) -> Result<()> {
        let encoded = MessageCodec::encode_plain(msg)?;
        self.inner
            .broadcasts
            .queue_broadcast(Some(node.to_string()), encoded.to_vec(), notify)
    }

    async fn notify_join(&self, name: &str) {
        if let Some(events) = &self.inner.config.events {
            if let Some(entry) = self.inner.nodes.get(name) {
                events.notify_join(&entry.node).await;
            }
        }
    }

    async fn notify_update(&self, name: &str) {
        if let Some(events) = &self.inner.config.events {
            if let Some(entry) = self.inner.nodes.get(name) {
                events.notify_update(&entry.node).await;
            }
        }
    }

    async fn notify_leave(&self, name: &str) {
        if let Some(events) = &self.inner.config.events {
            if let Some(entry) = self.inner.nodes.get(name) {
                events.notify_leave(&entry.node).await;
            }
        }
    }

    // ---- failure detector --------------------------------------------

    /// One probe tick: ping the next round-robin target and escalate
    /// through indirect probes before suspecting it.
    async fn probe(&self) -> Result<()> {
        let target = self.inner.nodes.next_probe_target(
            &self.inner.config.name,
            self.inner.config.gossip_to_the_dead_time,
        );
        let Some(target) = target else {
            debug!("no probeable node this tick");
            return Ok(());
        };
        self.probe_node(target).await
    }

    async fn probe_node(&self, target: crate::node::NodeEntry) -> Result<()> {
        let seq_no = self.next_seq_no();
        let start = Instant::now();
        let ack_deadline = start + self.inner.config.probe_timeout;
        let probe_deadline = start + self.inner.config.probe_interval;
        let target_addr = target.socket_addr();

        debug!(node = %target.node.name, seq_no, "probing");
        let ping = Message::Ping(Ping {
            seq_no,
            node: target.node.name.clone(),
        });
        let mut rx = self
            .inner
            .scheduler
            .schedule(EventType::Ack { seq_no }, ack_deadline)?;
        let packet = self.inner.codec.encode(&ping)?;
        self.inner.transport.send_to(target_addr, &packet).await?;

        let acked = tokio::select! {
            state = rx.recv() => matches!(state, Some(EventState::Intercepted)),
            _ = time::sleep_until(ack_deadline) => false,
        };
        if acked {
            debug!(node = %target.node.name, "ack received");
            return Ok(());
        }

        // Direct probe timed out. Fan out indirect probes and open a
        // stream fallback, then wait out the rest of the interval.
        warn!(node = %target.node.name, "no ack, trying indirect probes");
        self.inner.scheduler.cancel(&EventType::Ack { seq_no });
        let mut rx = self
            .inner
            .scheduler
            .schedule(EventType::Ack { seq_no }, probe_deadline)?;

        self.send_indirect_pings(seq_no, &target).await;
        self.spawn_stream_fallback(seq_no, &target, probe_deadline);

        let acked = tokio::select! {
            state = rx.recv() => matches!(state, Some(EventState::Intercepted)),
            _ = time::sleep_until(probe_deadline) => false,
        };
        if acked {
            debug!(node = %target.node.name, "indirect ack received");
            return Ok(());
        }
        self.inner.scheduler.cancel(&EventType::Ack { seq_no });

        let incarnation = self
            .inner
            .nodes
            .get(&target.node.name)
            .map(|entry| entry.incarnation)
            .unwrap_or(target.incarnation);
        self.suspect_node(Suspect {
            incarnation,
            node: target.node.name.clone(),
            from: self.inner.config.name.clone(),
        })
        .await
    }

    async fn send_indirect_pings(&self, seq_no: u32, target: &crate::node::NodeEntry) {
        let local_name = self.inner.config.name.clone();
        let target_name = target.node.name.clone();
        let peers = self.inner.nodes.k_random(
            self.inner.config.indirect_checks,
            |entry| {
                entry.is_alive()
                    && entry.node.name != local_name
                    && entry.node.name != target_name
            },
        );
        if peers.is_empty() {
            debug!("no peers available for indirect pings");
            return;
        }

        let indirect = Message::IndirectPing(IndirectPing {
            seq_no,
            target: target.socket_addr(),
            node: target.node.name.clone(),
        });
        for peer in &peers {
            let packet = match self.inner.codec.encode(&indirect) {
                Ok(packet) => packet,
                Err(e) => {
                    error!("failed to encode indirect ping: {}", e);
                    return;
                }
            };
            if let Err(e) = self.inner.transport.send_to(peer.socket_addr(), &packet).await {
                debug!(peer = %peer.node.name, "failed to send indirect ping: {}", e);
            }
        }
        debug!(
            count = peers.len(),
            target = %target.node.name,
            "indirect pings sent"
        );
    }

    /// Direct stream ping as a fallback for partitions that drop UDP
    /// but pass TCP. An ack resolves the pending probe event.
    fn spawn_stream_fallback(
        &self,
        seq_no: u32,
        target: &crate::node::NodeEntry,
        deadline: Instant,
    ) {
        let this = self.clone();
        let target_addr = target.socket_addr();
        let target_name = target.node.name.clone();
        tokio::spawn(async move {
            let budget = deadline.saturating_duration_since(Instant::now());
            if budget.is_zero() {
                return;
            }
            match timeout(budget, this.stream_ping(target_addr, seq_no, &target_name)).await {
                Ok(Ok(true)) => {
                    this.inner.scheduler.intercept(&EventType::Ack { seq_no });
                }
                Ok(Ok(false)) => debug!(node = %target_name, "stream ping got no ack"),
                Ok(Err(e)) => debug!(node = %target_name, "stream ping failed: {}", e),
                Err(_) => debug!(node = %target_name, "stream ping timed out"),
            }
        });
    }

    async fn stream_ping(&self, target: SocketAddr, seq_no: u32, node: &str) -> Result<bool> {
        let mut stream = self
            .inner
            .transport
            .dial_stream(target, self.inner.config.stream_timeout)
            .await?;
        let frame = self.inner.codec.encode(&Message::Ping(Ping {
            seq_no,
            node: node.to_string(),
        }))?;
        write_frame(&mut stream, &frame).await?;
        let reply = read_frame(&mut stream).await?;
        match self.inner.codec.decode(&reply)?.into_iter().next() {
            Some(Message::Ack(ack)) if ack.seq_no == seq_no => Ok(true),
            _ => Ok(false),
        }
    }

    // ---- gossip ------------------------------------------------------

    /// One gossip tick: pack pending broadcasts into a compound datagram
    /// per selected peer. Dead peers still within the grace window are
    /// included so they get a chance to refute.
    async fn gossip(&self) -> Result<()> {
        let local_name = self.inner.config.name.clone();
        let dead_window = self.inner.config.gossip_to_the_dead_time;
        let targets = self.inner.nodes.k_random(
            self.inner.config.gossip_nodes,
            |entry| {
                entry.node.name != local_name
                    && (!entry.is_dead() || entry.state_change.elapsed() <= dead_window)
            },
        );
        if targets.is_empty() {
            return Ok(());
        }

        let budget = MAX_UDP_PACKET_SIZE
            .saturating_sub(self.inner.codec.envelope_overhead() + COMPOUND_MSG_OVERHEAD);
        for target in &targets {
            let mut msgs = self
                .inner
                .broadcasts
                .get_broadcasts(COMPOUND_MSG_OVERHEAD, budget)?;
            self.append_delegate_broadcasts(&mut msgs, budget).await?;
            if msgs.is_empty() {
                continue;
            }
            let packet = self.inner.codec.encode_batch(&msgs)?;
            if let Err(e) = self.inner.transport.send_to(target.socket_addr(), &packet).await {
                warn!(peer = %target.node.name, "failed to gossip: {}", e);
            }
        }
        Ok(())
    }

    async fn append_delegate_broadcasts(
        &self,
        msgs: &mut Vec<Vec<u8>>,
        budget: usize,
    ) -> Result<()> {
        let Some(delegate) = &self.inner.config.delegate else {
            return Ok(());
        };
        let mut used: usize = msgs
            .iter()
            .map(|m| m.len() + COMPOUND_MSG_OVERHEAD)
            .sum();
        if used >= budget {
            return Ok(());
        }
        // User payloads are wrapped in a user message; account for the
        // tag and the bincode length prefix.
        let wrap_overhead = COMPOUND_MSG_OVERHEAD + 9;
        let payloads = delegate.broadcasts(wrap_overhead, budget - used).await;
        for payload in payloads {
            let encoded = MessageCodec::encode_plain(&Message::User(UserMsg { payload }))?;
            if used + encoded.len() + COMPOUND_MSG_OVERHEAD > budget {
                break;
            }
            used += encoded.len() + COMPOUND_MSG_OVERHEAD;
            msgs.push(encoded.to_vec());
        }
        Ok(())
    }

    // ---- anti-entropy ------------------------------------------------

    /// Full-state exchange with one peer over a stream: push our table
    /// and user state, pull theirs, and merge through the state machine.
    async fn push_pull_node(&self, target: SocketAddr, join: bool) -> Result<()> {
        let deadline = self.inner.config.stream_timeout;
        let (header, states, user_state) = timeout(deadline, async {
            let mut stream = self
                .inner
                .transport
                .dial_stream(target, deadline)
                .await?;
            let local_states = self.inner.nodes.push_pull_state();
            let local_user = match &self.inner.config.delegate {
                Some(delegate) => delegate.local_state(join).await,
                None => Vec::new(),
            };
            let out = self
                .inner
                .codec
                .encode_push_pull(join, &local_states, &local_user)?;
            write_frame(&mut stream, &out).await?;

            let reply = read_frame(&mut stream).await?;
            self.inner.codec.decode_push_pull(&reply)
        })
        .await
        .map_err(|_| anyhow!("push/pull with {} timed out", target))??;

        debug!(peer = %target, nodes = header.nodes, "push/pull merged");
        self.merge_remote_state(states, user_state, header.join).await
    }

    /// Feed received push/pull records through the state machine; the
    /// conflict-resolution rules make the merge converge monotonically.
    async fn merge_remote_state(
        &self,
        states: Vec<PushNodeState>,
        user_state: Vec<u8>,
        join: bool,
    ) -> Result<()> {
        for r in states {
            let a = Alive {
                incarnation: r.incarnation,
                node: r.name.clone(),
                addr: r.addr,
                port: r.port,
                meta: r.meta,
                vsn: r.vsn,
            };
            self.alive_node(a, false).await?;
            match r.state {
                NodeState::Alive => {}
                NodeState::Suspect => {
                    self.suspect_node(Suspect {
                        incarnation: r.incarnation,
                        node: r.name,
                        from: self.inner.config.name.clone(),
                    })
                    .await?;
                }
                NodeState::Dead => {
                    self.dead_node(Dead {
                        incarnation: r.incarnation,
                        node: r.name,
                        from: self.inner.config.name.clone(),
                    })
                    .await?;
                }
            }
        }
        if !user_state.is_empty() {
            if let Some(delegate) = &self.inner.config.delegate {
                delegate.merge_remote_state(user_state, join).await;
            }
        }
        Ok(())
    }

    // ---- inbound handlers --------------------------------------------

    async fn handle_datagram(&self, datagram: Datagram) -> Result<()> {
        let messages = match self.inner.codec.decode(&datagram.data) {
            Ok(messages) => messages,
            Err(e) => {
                self.inner.malformed_packets.fetch_add(1, Ordering::Relaxed);
                warn!(from = %datagram.remote_addr, "dropping malformed packet: {}", e);
                return Ok(());
            }
        };
        for msg in messages {
            self.handle_message(msg, datagram.remote_addr).await?;
        }
        Ok(())
    }

    async fn handle_message(&self, msg: Message, from: SocketAddr) -> Result<()> {
        match msg {
            Message::Ping(ping) => self.handle_ping(ping, from).await,
            Message::IndirectPing(indirect) => {
                // The relay probe waits on network deadlines; keep the
                // listener free.
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle_indirect_ping(indirect, from).await {
                        debug!("indirect ping relay failed: {}", e);
                    }
                });
                Ok(())
            }
            Message::Ack(ack) => {
                if !self
                    .inner
                    .scheduler
                    .intercept(&EventType::Ack { seq_no: ack.seq_no })
                {
                    debug!(seq_no = ack.seq_no, "late ack ignored");
                }
                Ok(())
            }
            Message::Nack(nack) => {
                self.inner.probe_nacks.fetch_add(1, Ordering::Relaxed);
                debug!(seq_no = nack.seq_no, "indirect prober reported nack");
                Ok(())
            }
            Message::Suspect(s) => self.suspect_node(s).await,
            Message::Alive(a) => self.alive_node(a, false).await,
            Message::Dead(d) => self.dead_node(d).await,
            Message::User(user) => {
                if let Some(delegate) = &self.inner.config.delegate {
                    delegate.notify_msg(user.payload).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_ping(&self, ping: Ping, from: SocketAddr) -> Result<()> {
        if ping.node != self.inner.config.name {
            warn!(intended = %ping.node, "dropping misdelivered ping");
            return Ok(());
        }
        let ack = Message::Ack(Ack {
            seq_no: ping.seq_no,
            payload: Vec::new(),
        });
        let packet = self.inner.codec.encode(&ack)?;
        self.inner.transport.send_to(from, &packet).await
    }

    /// Probe `indirect.target` on behalf of `from`, forwarding the ack
    /// (or a nack) with the requester's sequence number.
    async fn handle_indirect_ping(&self, indirect: IndirectPing, from: SocketAddr) -> Result<()> {
        let seq_no = self.next_seq_no();
        let deadline = Instant::now() + self.inner.config.probe_timeout;
        let mut rx = self
            .inner
            .scheduler
            .schedule(EventType::Ack { seq_no }, deadline)?;

        let ping = Message::Ping(Ping {
            seq_no,
            node: indirect.node.clone(),
        });
        let packet = self.inner.codec.encode(&ping)?;
        self.inner.transport.send_to(indirect.target, &packet).await?;

        let acked = tokio::select! {
            state = rx.recv() => matches!(state, Some(EventState::Intercepted)),
            _ = time::sleep_until(deadline) => false,
        };
        self.inner.scheduler.cancel(&EventType::Ack { seq_no });

        let reply = if acked {
            Message::Ack(Ack {
                seq_no: indirect.seq_no,
                payload: Vec::new(),
            })
        } else {
            Message::Nack(Nack {
                seq_no: indirect.seq_no,
            })
        };
        let packet = self.inner.codec.encode(&reply)?;
        self.inner.transport.send_to(from, &packet).await
    }

    /// Serve one inbound stream: a push/pull exchange, a fallback ping,
    /// or a reliable user message.
    async fn handle_stream(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let deadline = self.inner.config.stream_timeout;
        timeout(deadline, async {
            let frame = read_frame(&mut stream).await?;
            let plain = self.inner.codec.unwrap_envelopes(&frame)?;
            match plain.first().copied() {
                Some(tag) if tag == MessageKind::PushPull as u8 => {
                    let (header, states, user_state) =
                        MessageCodec::decode_push_pull_plain(&plain)?;
                    let local_states = self.inner.nodes.push_pull_state();
                    let local_user = match &self.inner.config.delegate {
                        Some(delegate) => delegate.local_state(header.join).await,
                        None => Vec::new(),
                    };
                    let reply =
                        self.inner
                            .codec
                            .encode_push_pull(false, &local_states, &local_user)?;
                    write_frame(&mut stream, &reply).await?;
                    self.merge_remote_state(states, user_state, header.join).await
                }
                Some(tag) if tag == MessageKind::Ping as u8 => {
                    match MessageCodec::decode_plain(&plain)? {
                        Message::Ping(ping) => {
                            let ack = self.inner.codec.encode(&Message::Ack(Ack {
                                seq_no: ping.seq_no,
                                payload: Vec::new(),
                            }))?;
                            write_frame(&mut stream, &ack).await
                        }
                        _ => unreachable!("tag checked above"),
                    }
                }
                Some(tag) if tag == MessageKind::User as u8 => {
                    match MessageCodec::decode_plain(&plain)? {
                        Message::User(user) => {
                            if let Some(delegate) = &self.inner.config.delegate {
                                delegate.notify_msg(user.payload).await;
                            }
                            Ok(())
                        }
                        _ => unreachable!("tag checked above"),
                    }
                }
                _ => bail!("unexpected stream frame from {}", remote),
            }
        })
        .await
        .map_err(|_| anyhow!("stream exchange with {} timed out", remote))?
    }

    // ---- background tasks --------------------------------------------

    fn launch_datagram_listener(&self) {
        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut datagram_rx = self.inner.transport.incoming();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = datagram_rx.recv() => match result {
                        Ok(datagram) => {
                            if let Err(e) = this.handle_datagram(datagram).await {
                                error!("error handling datagram: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "datagram listener lagging, packets dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("datagram listener stopped");
        });
    }

    fn launch_stream_listener(&self) {
        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = this.inner.transport.accept_stream() => match result {
                        Ok((stream, remote)) => {
                            let this = this.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_stream(stream, remote).await {
                                    debug!(from = %remote, "stream handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            if this.inner.shutdown.load(Ordering::SeqCst) {
                                break;
                            }
                            error!("failed to accept stream: {}", e);
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("stream listener stopped");
        });
    }

    /// Drives the deadline table: wakes for the earliest pending
    /// deadline, delivers expirations to waiters, and turns expired
    /// suspicion timers into dead events.
    fn launch_deadline_loop(&self) {
        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let next = this.inner.scheduler.next_deadline();
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = this.inner.scheduler.wait_for_change() => {}
                    _ = async {
                        match next {
                            Some(deadline) => time::sleep_until(deadline).await,
                            None => futures::future::pending().await,
                        }
                    } => {
                        for (event, sender) in this.inner.scheduler.pop_due(Instant::now()) {
                            let _ = sender.try_send(EventState::ReachedDeadline);
                            if let EventType::SuspicionTimeout { node } = event {
                                this.handle_suspicion_expired(&node).await;
                            }
                        }
                    }
                }
            }
            debug!("deadline loop stopped");
        });
    }

    /// Suspicion window elapsed without refutation: declare the node
    /// dead at the incarnation it was suspected at.
    async fn handle_suspicion_expired(&self, node: &str) {
        let Some(entry) = self.inner.nodes.get(node) else {
            return;
        };
        if !entry.is_suspect() {
            return;
        }
        let d = Dead {
            incarnation: entry.incarnation,
            node: node.to_string(),
            from: self.inner.config.name.clone(),
        };
        if let Err(e) = self.dead_node(d).await {
            warn!(node = %node, "failed to confirm dead: {}", e);
        }
    }

    fn launch_prober(&self) {
        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.config.probe_interval;
        tokio::spawn(async move {
            // Random startup jitter so a fleet restarted together does
            // not probe in lockstep.
            let jitter = { thread_rng().gen_range(Duration::ZERO..interval) };
            tokio::select! {
                _ = time::sleep(jitter) => {}
                _ = shutdown_rx.recv() => return,
            }
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.probe().await {
                            error!("probe error: {}", e);
                        } else {
                            debug!("membership: {:#?}", this.inner.nodes.entries());
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("prober stopped");
        });
    }

    fn launch_gossiper(&self) {
        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.config.gossip_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.gossip().await {
                            error!("gossip error: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("gossiper stopped");
        });
    }

    fn launch_push_pull(&self) {
        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.config.push_pull_interval;
        tokio::spawn(async move {
            let jitter = { thread_rng().gen_range(Duration::ZERO..interval) };
            tokio::select! {
                _ = time::sleep(jitter) => {}
                _ = shutdown_rx.recv() => return,
            }
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let local_name = this.inner.config.name.clone();
                        let peer = this
                            .inner
                            .nodes
                            .k_random(1, |entry| {
                                entry.is_alive() && entry.node.name != local_name
                            })
                            .into_iter()
                            .next();
                        if let Some(peer) = peer {
                            if let Err(e) = this.push_pull_node(peer.socket_addr(), false).await {
                                warn!(peer = %peer.node.name, "push/pull failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("push/pull loop stopped");
        });
    }
}

async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_STREAM_FRAME {
        bail!("stream frame of {} bytes exceeds the limit", len);
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::MockTransport;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(name: &str) -> PeerlistConfig {
        PeerlistConfigBuilder::new()
            .with_name(name)
            .with_port(0)
            .with_probe_interval(Duration::from_millis(300))
            .with_probe_timeout(Duration::from_millis(100))
            .with_gossip_interval(Duration::from_millis(30))
            .with_push_pull_interval(Duration::from_millis(200))
            .with_suspicion_mult(2)
            .build()
            .unwrap()
    }

    async fn create_test_peerlist(name: &str, port: u16) -> (Peerlist, Arc<MockTransport>) {
        let local_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port);
        let transport = Arc::new(MockTransport::new(local_addr));
        let peerlist = Peerlist::assemble(test_config(name), transport.clone())
            .await
            .unwrap();
        (peerlist, transport)
    }

    fn peer_alive(name: &str, port: u16, incarnation: u32) -> Alive {
        Alive {
            incarnation,
            node: name.to_string(),
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port,
            meta: vec![],
            vsn: [0, 2, 2, 0, 0, 0],
        }
    }

    fn decode_sent(
        peerlist: &Peerlist,
        sent: &[(SocketAddr, Vec<u8>)],
    ) -> Vec<Message> {
        sent.iter()
            .flat_map(|(_, data)| peerlist.inner.codec.decode(data).unwrap())
            .collect()
    }

    async fn wait_until<F>(what: &str, deadline: Duration, mut cond: F)
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while !cond() {
            if start.elapsed() > deadline {
                panic!("timed out waiting for {}", what);
            }
            time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_create_registers_self_alive() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        assert_eq!(peerlist.num_members(), 1);
        let local = peerlist.local_node().unwrap();
        assert_eq!(local.name, "local");
        let entry = peerlist.inner.nodes.get("local").unwrap();
        assert!(entry.is_alive());
        assert_eq!(entry.incarnation, 1);
    }

    #[tokio::test]
    async fn test_suspect_rumor_about_self_is_refuted() {
        let (peerlist, transport) = create_test_peerlist("local", 8000).await;
        peerlist
            .alive_node(peer_alive("peer1", 8001, 1), false)
            .await
            .unwrap();

        peerlist
            .suspect_node(Suspect {
                incarnation: 15,
                node: "local".to_string(),
                from: "peer1".to_string(),
            })
            .await
            .unwrap();

        // The local view never shows us as suspect.
        let entry = peerlist.inner.nodes.get("local").unwrap();
        assert!(entry.is_alive());
        assert!(entry.incarnation > 15);
        assert_eq!(peerlist.num_members(), 2);

        // The refutation goes out with the next gossip.
        peerlist.gossip().await.unwrap();
        let sent = transport.sent_datagrams();
        assert!(!sent.is_empty(), "refutation was not gossiped");
        let refutation = decode_sent(&peerlist, &sent)
            .into_iter()
            .find_map(|msg| match msg {
                Message::Alive(a) if a.node == "local" => Some(a),
                _ => None,
            })
            .expect("expected an alive broadcast for the local node");
        assert!(refutation.incarnation > 15);
    }

    #[tokio::test]
    async fn test_dead_rumor_about_self_is_refuted_unless_leaving() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist
            .dead_node(Dead {
                incarnation: 3,
                node: "local".to_string(),
                from: "peer1".to_string(),
            })
            .await
            .unwrap();
        let entry = peerlist.inner.nodes.get("local").unwrap();
        assert!(entry.is_alive());
        assert!(entry.incarnation > 3);
    }

    #[tokio::test]
    async fn test_stale_alive_leaves_state_and_queue_untouched() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist
            .alive_node(peer_alive("peer1", 8001, 5), false)
            .await
            .unwrap();
        let queued = peerlist.inner.broadcasts.len().unwrap();

        peerlist
            .alive_node(peer_alive("peer1", 8001, 3), false)
            .await
            .unwrap();

        let entry = peerlist.inner.nodes.get("peer1").unwrap();
        assert_eq!(entry.incarnation, 5);
        assert_eq!(peerlist.inner.broadcasts.len().unwrap(), queued);
    }

    #[tokio::test]
    async fn test_duplicate_alive_produces_single_broadcast() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist
            .alive_node(peer_alive("peer1", 8001, 2), false)
            .await
            .unwrap();
        peerlist
            .alive_node(peer_alive("peer1", 8001, 2), false)
            .await
            .unwrap();
        // Self-alive plus exactly one rumor about peer1.
        assert_eq!(peerlist.inner.broadcasts.len().unwrap(), 2);
        assert_eq!(peerlist.inner.nodes.get("peer1").unwrap().incarnation, 2);
    }

    #[tokio::test]
    async fn test_inbound_ping_is_acked() {
        let (peerlist, transport) = create_test_peerlist("local", 8000).await;
        let from: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let ping = peerlist
            .inner
            .codec
            .encode(&Message::Ping(Ping {
                seq_no: 42,
                node: "local".to_string(),
            }))
            .unwrap();

        peerlist
            .handle_datagram(Datagram {
                remote_addr: from,
                data: ping.to_vec(),
            })
            .await
            .unwrap();

        let sent = transport.sent_datagrams();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, from);
        match peerlist.inner.codec.decode(&sent[0].1).unwrap().as_slice() {
            [Message::Ack(ack)] => assert_eq!(ack.seq_no, 42),
            other => panic!("expected an ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_misdelivered_ping_dropped() {
        let (peerlist, transport) = create_test_peerlist("local", 8000).await;
        let from: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let ping = peerlist
            .inner
            .codec
            .encode(&Message::Ping(Ping {
                seq_no: 1,
                node: "someone-else".to_string(),
            }))
            .unwrap();
        peerlist
            .handle_datagram(Datagram {
                remote_addr: from,
                data: ping.to_vec(),
            })
            .await
            .unwrap();
        assert!(transport.sent_datagrams().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_packet_counted_and_dropped() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist
            .handle_datagram(Datagram {
                remote_addr: "127.0.0.1:8001".parse().unwrap(),
                data: vec![0xFF, 0x01, 0x02],
            })
            .await
            .unwrap();
        assert_eq!(peerlist.inner.malformed_packets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_injected_datagram_reaches_listener() {
        let (peerlist, transport) = create_test_peerlist("local", 8000).await;
        peerlist.launch_datagram_listener();

        let from: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let ping = peerlist
            .inner
            .codec
            .encode(&Message::Ping(Ping {
                seq_no: 9,
                node: "local".to_string(),
            }))
            .unwrap();
        transport.inject(from, ping.to_vec());

        wait_until("the listener to ack the ping", Duration::from_secs(2), || {
            decode_sent(&peerlist, &transport.sent_datagrams())
                .iter()
                .any(|msg| matches!(msg, Message::Ack(a) if a.seq_no == 9))
        })
        .await;
    }

    #[tokio::test]
    async fn test_gossip_tries_every_target() {
        use std::sync::atomic::AtomicUsize;

        // Hands out nothing on the first call, a payload afterwards, so
        // the first gossip target legitimately has nothing to send.
        struct SlowStart {
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl Delegate for SlowStart {
            async fn broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Vec::new()
                } else {
                    vec![b"late".to_vec()]
                }
            }
        }

        let delegate = Arc::new(SlowStart {
            calls: AtomicUsize::new(0),
        });
        let config = PeerlistConfigBuilder::new()
            .with_name("local")
            .with_port(0)
            .with_probe_interval(Duration::from_millis(300))
            .with_probe_timeout(Duration::from_millis(100))
            .with_gossip_nodes(2)
            .with_delegate(delegate)
            .build()
            .unwrap();
        let local_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8000);
        let transport = Arc::new(MockTransport::new(local_addr));
        let peerlist = Peerlist::assemble(config, transport.clone()).await.unwrap();
        peerlist
            .alive_node(peer_alive("peer1", 8001, 1), false)
            .await
            .unwrap();
        peerlist
            .alive_node(peer_alive("peer2", 8002, 1), false)
            .await
            .unwrap();

        // Drain the membership broadcasts so only the delegate feeds
        // this gossip tick.
        while !peerlist.inner.broadcasts.is_empty().unwrap() {
            peerlist.inner.broadcasts.get_broadcasts(0, 1400).unwrap();
        }
        transport.clear_sent();

        // The first target comes up empty; the second must still be
        // attempted and get the delegate payload.
        peerlist.gossip().await.unwrap();

        let sent = transport.sent_datagrams();
        assert_eq!(sent.len(), 1, "second gossip target was skipped");
        match decode_sent(&peerlist, &sent).as_slice() {
            [Message::User(user)] => assert_eq!(user.payload, b"late".to_vec()),
            other => panic!("expected a user broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_timeout_suspects_target() {
        let (peerlist, transport) = create_test_peerlist("local", 8000).await;
        peerlist
            .alive_node(peer_alive("peer1", 8001, 1), false)
            .await
            .unwrap();

        // No ack will ever arrive over the mock transport.
        peerlist.probe().await.unwrap();

        let entry = peerlist.inner.nodes.get("peer1").unwrap();
        assert!(entry.is_suspect());
        let suspect_sent = decode_sent(&peerlist, &transport.sent_datagrams())
            .iter()
            .any(|msg| matches!(msg, Message::Ping(p) if p.node == "peer1"));
        assert!(suspect_sent, "expected a direct ping to the target");
    }

    #[tokio::test]
    async fn test_probe_ack_keeps_target_alive() {
        let (peerlist, transport) = create_test_peerlist("local", 8000).await;
        peerlist
            .alive_node(peer_alive("peer1", 8001, 1), false)
            .await
            .unwrap();

        // Answer the ping as soon as it shows up.
        let responder = {
            let peerlist = peerlist.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                loop {
                    let pings: Vec<u32> = decode_sent(&peerlist, &transport.sent_datagrams())
                        .into_iter()
                        .filter_map(|msg| match msg {
                            Message::Ping(p) => Some(p.seq_no),
                            _ => None,
                        })
                        .collect();
                    if let Some(seq_no) = pings.first().copied() {
                        peerlist.inner.scheduler.intercept(&EventType::Ack { seq_no });
                        break;
                    }
                    time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        peerlist.probe().await.unwrap();
        responder.await.unwrap();
        assert!(peerlist.inner.nodes.get("peer1").unwrap().is_alive());
    }

    #[tokio::test]
    async fn test_indirect_ping_relay_forwards_ack() {
        let (peerlist, transport) = create_test_peerlist("relay", 8000).await;
        let requester: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let target: SocketAddr = "127.0.0.1:8002".parse().unwrap();

        let relay = {
            let peerlist = peerlist.clone();
            tokio::spawn(async move {
                peerlist
                    .handle_indirect_ping(
                        IndirectPing {
                            seq_no: 77,
                            target,
                            node: "target".to_string(),
                        },
                        requester,
                    )
                    .await
                    .unwrap();
            })
        };

        // Wait for the relay's own ping, then answer it.
        let mut relay_seq = None;
        for _ in 0..100 {
            let pings: Vec<(SocketAddr, u32)> =
                decode_sent(&peerlist, &transport.sent_datagrams())
                    .into_iter()
                    .zip(transport.sent_datagrams())
                    .filter_map(|(msg, (addr, _))| match msg {
                        Message::Ping(p) => Some((addr, p.seq_no)),
                        _ => None,
                    })
                    .collect();
            if let Some((addr, seq_no)) = pings.first().copied() {
                assert_eq!(addr, target);
                relay_seq = Some(seq_no);
                break;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        let relay_seq = relay_seq.expect("relay never pinged the target");
        peerlist
            .inner
            .scheduler
            .intercept(&EventType::Ack { seq_no: relay_seq });
        relay.await.unwrap();

        // The requester gets an ack carrying its original sequence number.
        let forwarded = decode_sent(&peerlist, &transport.sent_datagrams())
            .into_iter()
            .any(|msg| matches!(msg, Message::Ack(a) if a.seq_no == 77));
        assert!(forwarded, "ack was not forwarded to the requester");
    }

    #[tokio::test]
    async fn test_indirect_ping_relay_nacks_on_timeout() {
        let (peerlist, transport) = create_test_peerlist("relay", 8000).await;
        let requester: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        peerlist
            .handle_indirect_ping(
                IndirectPing {
                    seq_no: 88,
                    target: "127.0.0.1:8002".parse().unwrap(),
                    node: "target".to_string(),
                },
                requester,
            )
            .await
            .unwrap();

        let nacked = decode_sent(&peerlist, &transport.sent_datagrams())
            .into_iter()
            .any(|msg| matches!(msg, Message::Nack(n) if n.seq_no == 88));
        assert!(nacked, "expected a nack to the requester");
    }

    #[tokio::test]
    async fn test_suspicion_timeout_declares_dead() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist.launch_deadline_loop();
        peerlist
            .alive_node(peer_alive("peer1", 8001, 4), false)
            .await
            .unwrap();
        peerlist
            .suspect_node(Suspect {
                incarnation: 4,
                node: "peer1".to_string(),
                from: "local".to_string(),
            })
            .await
            .unwrap();

        // suspicion_mult=2, probe_interval=100ms, two nodes: 200ms window.
        wait_until("suspect to be declared dead", Duration::from_secs(3), || {
            peerlist
                .inner
                .nodes
                .get("peer1")
                .map(|entry| entry.is_dead())
                .unwrap_or(false)
        })
        .await;
        // Death kept the suspicion incarnation.
        assert_eq!(peerlist.inner.nodes.get("peer1").unwrap().incarnation, 4);
    }

    #[tokio::test]
    async fn test_refutation_cancels_suspicion_timer() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist.launch_deadline_loop();
        peerlist
            .alive_node(peer_alive("peer1", 8001, 4), false)
            .await
            .unwrap();
        peerlist
            .suspect_node(Suspect {
                incarnation: 4,
                node: "peer1".to_string(),
                from: "local".to_string(),
            })
            .await
            .unwrap();

        // The refutation lands before the timer expires.
        peerlist
            .alive_node(peer_alive("peer1", 8001, 5), false)
            .await
            .unwrap();

        // Sleep past the 600ms suspicion window; the cancelled timer
        // must not fire.
        time::sleep(Duration::from_millis(800)).await;
        assert!(peerlist.inner.nodes.get("peer1").unwrap().is_alive());
    }

    #[tokio::test]
    async fn test_leave_drains_dead_broadcast() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist
            .alive_node(peer_alive("peer1", 8001, 1), false)
            .await
            .unwrap();

        // Drive the gossip loop by hand until the leave broadcast drains.
        let gossiper = {
            let peerlist = peerlist.clone();
            tokio::spawn(async move {
                loop {
                    peerlist.gossip().await.unwrap();
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        peerlist.leave(Duration::from_secs(5)).await.unwrap();
        gossiper.abort();

        let entry = peerlist.inner.nodes.get("local").unwrap();
        assert!(entry.is_dead());
        assert_eq!(peerlist.num_members(), 1);

        // Leave is idempotent.
        peerlist.leave(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_returns_immediately_when_alone() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist.leave(Duration::from_secs(5)).await.unwrap();
        assert_eq!(peerlist.num_members(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "leave after shutdown")]
    async fn test_leave_after_shutdown_panics() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist.shutdown().await.unwrap();
        let _ = peerlist.leave(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        peerlist.shutdown().await.unwrap();
        peerlist.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_remote_state_applies_records() {
        let (peerlist, _) = create_test_peerlist("local", 8000).await;
        let records = vec![
            PushNodeState {
                name: "alive-node".into(),
                addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                port: 9001,
                meta: vec![],
                incarnation: 1,
                state: NodeState::Alive,
                vsn: [0, 2, 2, 0, 0, 0],
            },
            PushNodeState {
                name: "suspect-node".into(),
                addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                port: 9002,
                meta: vec![],
                incarnation: 2,
                state: NodeState::Suspect,
                vsn: [0, 2, 2, 0, 0, 0],
            },
            PushNodeState {
                name: "dead-node".into(),
                addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                port: 9003,
                meta: vec![],
                incarnation: 3,
                state: NodeState::Dead,
                vsn: [0, 2, 2, 0, 0, 0],
            },
        ];
        peerlist
            .merge_remote_state(records, Vec::new(), true)
            .await
            .unwrap();

        assert!(peerlist.inner.nodes.get("alive-node").unwrap().is_alive());
        assert!(peerlist.inner.nodes.get("suspect-node").unwrap().is_suspect());
        assert!(peerlist.inner.nodes.get("dead-node").unwrap().is_dead());
        // Dead node excluded from membership, per the external contract.
        assert_eq!(peerlist.num_members(), 3);
    }

    // ---- loopback integration scenarios ------------------------------

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    }

    fn cluster_config(name: &str) -> PeerlistConfig {
        PeerlistConfigBuilder::new()
            .with_name(name)
            .with_bind_addr("127.0.0.1")
            .with_port(0)
            .with_probe_interval(Duration::from_millis(100))
            .with_probe_timeout(Duration::from_millis(50))
            .with_gossip_interval(Duration::from_millis(30))
            .with_push_pull_interval(Duration::from_millis(150))
            .with_suspicion_mult(2)
            .with_gossip_to_the_dead_time(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_three_node_cluster_converges() {
        init_tracing();
        let a = Peerlist::create(cluster_config("node-a")).await.unwrap();
        let b = Peerlist::create(cluster_config("node-b")).await.unwrap();
        let c = Peerlist::create(cluster_config("node-c")).await.unwrap();

        let seed = vec![a.local_addr().to_string()];
        assert_eq!(b.join(&seed).await.unwrap(), 1);
        assert_eq!(c.join(&seed).await.unwrap(), 1);

        wait_until("all three views to converge", Duration::from_secs(10), || {
            a.num_members() == 3 && b.num_members() == 3 && c.num_members() == 3
        })
        .await;

        for handle in [&a, &b, &c] {
            let mut names: Vec<String> = handle
                .members()
                .into_iter()
                .map(|node| node.name)
                .collect();
            names.sort();
            assert_eq!(names, vec!["node-a", "node-b", "node-c"]);
        }

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        c.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_node_is_detected() {
        init_tracing();
        let a = Peerlist::create(cluster_config("node-a")).await.unwrap();
        let b = Peerlist::create(cluster_config("node-b")).await.unwrap();
        let c = Peerlist::create(cluster_config("node-c")).await.unwrap();

        let seed = vec![a.local_addr().to_string()];
        b.join(&seed).await.unwrap();
        c.join(&seed).await.unwrap();
        wait_until("cluster to form", Duration::from_secs(10), || {
            a.num_members() == 3 && b.num_members() == 3 && c.num_members() == 3
        })
        .await;

        // Kill B without a leave: probing has to notice.
        b.shutdown().await.unwrap();
        wait_until("failure detection", Duration::from_secs(15), || {
            a.num_members() == 2 && c.num_members() == 2
        })
        .await;

        a.shutdown().await.unwrap();
        c.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_is_observed_as_dead() {
        init_tracing();
        let a = Peerlist::create(cluster_config("node-a")).await.unwrap();
        let b = Peerlist::create(cluster_config("node-b")).await.unwrap();

        b.join(&vec![a.local_addr().to_string()]).await.unwrap();
        wait_until("two-node cluster", Duration::from_secs(10), || {
            a.num_members() == 2 && b.num_members() == 2
        })
        .await;

        a.leave(Duration::from_secs(2)).await.unwrap();
        wait_until("b to observe the departure", Duration::from_secs(10), || {
            b.num_members() == 1
        })
        .await;
        let entry = b.inner.nodes.get("node-a").unwrap();
        assert!(entry.is_dead());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_with_unreachable_seed_errors() {
        let a = Peerlist::create(cluster_config("node-a")).await.unwrap();
        let result = a.join(&["127.0.0.1:1".to_string()]).await;
        assert!(result.is_err());
        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_messages_reach_delegate() {
        use parking_lot::Mutex as PlMutex;

        struct Recorder {
            messages: PlMutex<Vec<Vec<u8>>>,
        }

        #[async_trait::async_trait]
        impl Delegate for Recorder {
            async fn notify_msg(&self, msg: Vec<u8>) {
                self.messages.lock().push(msg);
            }
        }

        let recorder = Arc::new(Recorder {
            messages: PlMutex::new(Vec::new()),
        });
        let config = PeerlistConfigBuilder::new()
            .with_name("node-b")
            .with_bind_addr("127.0.0.1")
            .with_port(0)
            .with_probe_interval(Duration::from_millis(100))
            .with_probe_timeout(Duration::from_millis(30))
            .with_delegate(recorder.clone())
            .build()
            .unwrap();

        let a = Peerlist::create(cluster_config("node-a")).await.unwrap();
        let b = Peerlist::create(config).await.unwrap();

        a.send_to(b.local_addr(), b"over udp").await.unwrap();
        a.send_to_reliable(b.local_addr(), b"over tcp").await.unwrap();

        wait_until("both user messages", Duration::from_secs(5), || {
            recorder.messages.lock().len() == 2
        })
        .await;
        let received = recorder.messages.lock().clone();
        assert!(received.contains(&b"over udp".to_vec()));
        assert!(received.contains(&b"over tcp".to_vec()));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
