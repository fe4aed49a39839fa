use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use gethostname::gethostname;

use crate::delegate::{Delegate, EventDelegate};
use crate::ip_addr::IpAddress;

/// Lowest protocol version this implementation understands.
pub const PROTOCOL_VERSION_MIN: u8 = 0;
/// Highest protocol version this implementation understands.
pub const PROTOCOL_VERSION_MAX: u8 = 2;

/// Symmetric keys are AES-128: exactly this many bytes.
pub const SECRET_KEY_LEN: usize = 16;

pub(crate) const DEFAULT_PORT: u16 = 7946;
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 1400;
pub(crate) const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1_000;

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_PUSH_PULL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_GOSSIP_TO_THE_DEAD_TIME: Duration = Duration::from_secs(30);
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INDIRECT_CHECKS: usize = 3;
const DEFAULT_RETRANSMIT_MULT: u32 = 4;
const DEFAULT_SUSPICION_MULT: u32 = 5;
const DEFAULT_GOSSIP_NODES: usize = 3;

/// Tuning knobs and integration points for a [`crate::Peerlist`]
/// instance. Build one through [`PeerlistConfigBuilder`].
pub struct PeerlistConfig {
    /// Unique node name within the cluster; defaults to the hostname.
    pub(crate) name: String,

    /// Address to bind both listeners to. Binding `0.0.0.0` advertises
    /// the first private interface address instead.
    pub(crate) bind_addr: IpAddr,

    /// Port for both the UDP and TCP listeners. Zero picks an ephemeral
    /// port.
    pub(crate) port: u16,

    /// Protocol version to speak, within
    /// [`PROTOCOL_VERSION_MIN`]..=[`PROTOCOL_VERSION_MAX`].
    pub(crate) protocol_version: u8,

    /// Optional 16-byte key; when set, all traffic is AES-128-GCM
    /// sealed. Requires protocol version 1 or newer.
    pub(crate) secret_key: Option<[u8; SECRET_KEY_LEN]>,

    /// Interval between failure-detector ticks.
    pub(crate) probe_interval: Duration,

    /// How long a direct probe waits for its ack; a small fraction of
    /// `probe_interval`.
    pub(crate) probe_timeout: Duration,

    /// Fan-out of indirect probes after a direct-probe timeout.
    pub(crate) indirect_checks: usize,

    /// Multiplier in the retransmit limit
    /// `ceil(retransmit_mult · log10(n + 1))`.
    pub(crate) retransmit_mult: u32,

    /// Multiplier in the suspicion timeout
    /// `suspicion_mult · ceil(log10(max(n,1) + 1)) · probe_interval`.
    pub(crate) suspicion_mult: u32,

    /// Interval between anti-entropy full-state exchanges.
    pub(crate) push_pull_interval: Duration,

    /// Interval between gossip fan-outs.
    pub(crate) gossip_interval: Duration,

    /// Peers contacted per gossip tick.
    pub(crate) gossip_nodes: usize,

    /// How long dead nodes keep receiving gossip (and stay in the
    /// table) before being reaped.
    pub(crate) gossip_to_the_dead_time: Duration,

    /// Per-stream deadline for push/pull exchanges and dials.
    pub(crate) stream_timeout: Duration,

    /// Compress gossip payloads with DEFLATE. Requires protocol ≥ 1;
    /// silently disabled (with a warning) otherwise.
    pub(crate) enable_compression: bool,

    pub(crate) delegate: Option<Arc<dyn Delegate>>,
    pub(crate) events: Option<Arc<dyn EventDelegate>>,

    /// Delegate protocol tuple advertised in the node's version vector.
    pub(crate) delegate_protocol_min: u8,
    pub(crate) delegate_protocol_max: u8,
    pub(crate) delegate_protocol_version: u8,
}

impl PeerlistConfig {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Version vector carried in alive messages:
    /// [pmin, pmax, pcur, dmin, dmax, dcur].
    pub(crate) fn vsn(&self) -> [u8; 6] {
        [
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_MAX,
            self.protocol_version,
            self.delegate_protocol_min,
            self.delegate_protocol_max,
            self.delegate_protocol_version,
        ]
    }

    /// Suspicion window before an unrefuted suspect is declared dead.
    /// Grows logarithmically with cluster size to keep the false
    /// positive rate flat.
    pub(crate) fn suspicion_timeout(&self, cluster_size: usize) -> Duration {
        let n = cluster_size.max(1);
        let log_factor = ((n + 1) as f64).log10().ceil().max(1.0);
        self.probe_interval * self.suspicion_mult * log_factor as u32
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("node name is not set");
        }
        if self.protocol_version > PROTOCOL_VERSION_MAX {
            bail!(
                "protocol version {} out of range [{}, {}]",
                self.protocol_version,
                PROTOCOL_VERSION_MIN,
                PROTOCOL_VERSION_MAX
            );
        }
        if self.secret_key.is_some() && self.protocol_version < 1 {
            bail!("encryption requires protocol version 1 or newer");
        }
        if self.probe_interval.is_zero() {
            bail!("probe interval is not set");
        }
        if self.probe_timeout.is_zero() || self.probe_timeout >= self.probe_interval {
            bail!("probe timeout must be non-zero and below the probe interval");
        }
        if self.gossip_interval.is_zero() {
            bail!("gossip interval is not set");
        }
        if self.push_pull_interval.is_zero() {
            bail!("push/pull interval is not set");
        }
        if self.gossip_to_the_dead_time.is_zero() {
            bail!("gossip-to-the-dead window must be greater than zero");
        }
        if self.gossip_nodes == 0 {
            bail!("gossip fan-out must be greater than zero");
        }
        Ok(())
    }
}

pub struct PeerlistConfigBuilder {
    config: PeerlistConfig,
    invalid_key_len: Option<usize>,
}

impl Default for PeerlistConfigBuilder {
    fn default() -> Self {
        Self {
            invalid_key_len: None,
            config: PeerlistConfig {
                name: String::new(),
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: DEFAULT_PORT,
                protocol_version: PROTOCOL_VERSION_MAX,
                secret_key: None,
                probe_interval: DEFAULT_PROBE_INTERVAL,
                probe_timeout: DEFAULT_PROBE_TIMEOUT,
                indirect_checks: DEFAULT_INDIRECT_CHECKS,
                retransmit_mult: DEFAULT_RETRANSMIT_MULT,
                suspicion_mult: DEFAULT_SUSPICION_MULT,
                push_pull_interval: DEFAULT_PUSH_PULL_INTERVAL,
                gossip_interval: DEFAULT_GOSSIP_INTERVAL,
                gossip_nodes: DEFAULT_GOSSIP_NODES,
                gossip_to_the_dead_time: DEFAULT_GOSSIP_TO_THE_DEAD_TIME,
                stream_timeout: DEFAULT_STREAM_TIMEOUT,
                enable_compression: false,
                delegate: None,
                events: None,
                delegate_protocol_min: 0,
                delegate_protocol_max: 0,
                delegate_protocol_version: 0,
            },
        }
    }
}

impl PeerlistConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<IpAddress>) -> Self {
        self.config.bind_addr = addr.into().0;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Enable encryption with a 16-byte shared key. Key length is
    /// enforced at build time.
    pub fn with_secret_key(mut self, key: &[u8]) -> Self {
        match <[u8; SECRET_KEY_LEN]>::try_from(key) {
            Ok(bytes) => self.config.secret_key = Some(bytes),
            Err(_) => self.invalid_key_len = Some(key.len()),
        }
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn with_indirect_checks(mut self, checks: usize) -> Self {
        self.config.indirect_checks = checks;
        self
    }

    pub fn with_retransmit_mult(mut self, mult: u32) -> Self {
        self.config.retransmit_mult = mult;
        self
    }

    pub fn with_suspicion_mult(mut self, mult: u32) -> Self {
        self.config.suspicion_mult = mult;
        self
    }

    pub fn with_push_pull_interval(mut self, interval: Duration) -> Self {
        self.config.push_pull_interval = interval;
        self
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.config.gossip_interval = interval;
        self
    }

    pub fn with_gossip_nodes(mut self, nodes: usize) -> Self {
        self.config.gossip_nodes = nodes;
        self
    }

    pub fn with_gossip_to_the_dead_time(mut self, window: Duration) -> Self {
        self.config.gossip_to_the_dead_time = window;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_timeout = timeout;
        self
    }

    pub fn with_compression(mut self, enable: bool) -> Self {
        self.config.enable_compression = enable;
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.config.delegate = Some(delegate);
        self
    }

    pub fn with_event_delegate(mut self, events: Arc<dyn EventDelegate>) -> Self {
        self.config.events = Some(events);
        self
    }

    pub fn with_delegate_protocol(mut self, min: u8, max: u8, version: u8) -> Self {
        self.config.delegate_protocol_min = min;
        self.config.delegate_protocol_max = max;
        self.config.delegate_protocol_version = version;
        self
    }

    pub fn build(mut self) -> Result<PeerlistConfig> {
        if let Some(len) = self.invalid_key_len {
            bail!(
                "secret key must be exactly {} bytes, got {}",
                SECRET_KEY_LEN,
                len
            );
        }
        if self.config.name.is_empty() {
            self.config.name = gethostname().to_string_lossy().into_owned();
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
