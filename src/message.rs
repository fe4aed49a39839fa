// SWIM wire messages. Every UDP datagram and TCP frame starts with a
// one-byte kind tag; payload bodies are bincode.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::state::NodeState;

/// One-byte tag identifying the payload that follows it on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageKind {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Nack = 3,
    Suspect = 4,
    Alive = 5,
    Dead = 6,
    User = 7,
    Compound = 8,
    Compress = 9,
    Encrypt = 10,
    PushPull = 11,
}

impl MessageKind {
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Ping),
            1 => Ok(MessageKind::IndirectPing),
            2 => Ok(MessageKind::Ack),
            3 => Ok(MessageKind::Nack),
            4 => Ok(MessageKind::Suspect),
            5 => Ok(MessageKind::Alive),
            6 => Ok(MessageKind::Dead),
            7 => Ok(MessageKind::User),
            8 => Ok(MessageKind::Compound),
            9 => Ok(MessageKind::Compress),
            10 => Ok(MessageKind::Encrypt),
            11 => Ok(MessageKind::PushPull),
            _ => Err(anyhow!("unknown message kind: {}", value)),
        }
    }
}

/// Direct probe. The target echoes `seq_no` back in an [`Ack`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Ping {
    pub seq_no: u32,
    /// Name of the node being probed, so a misdelivered ping is dropped.
    pub node: String,
}

/// Ask a peer to probe `target` on our behalf and forward the ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndirectPing {
    pub seq_no: u32,
    pub target: SocketAddr,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Ack {
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

/// Negative ack from an indirect prober that could not reach the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Nack {
    pub seq_no: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Suspect {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

/// Rumor that `node` is alive at `incarnation`. Also doubles as the join
/// announcement and the refutation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub vsn: [u8; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Dead {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

/// Opaque user payload, handed to the delegate on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct UserMsg {
    pub payload: Vec<u8>,
}

/// Header of a push/pull state exchange over the stream transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PushPullHeader {
    pub nodes: u32,
    pub user_state_len: u32,
    pub join: bool,
}

/// One node record in a push/pull exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PushNodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: u32,
    pub state: NodeState,
    pub vsn: [u8; 6],
}

/// A decoded datagram-level message. Compound, compressed and encrypted
/// envelopes are unwrapped by the codec before this enum is produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    Ping(Ping),
    IndirectPing(IndirectPing),
    Ack(Ack),
    Nack(Nack),
    Suspect(Suspect),
    Alive(Alive),
    Dead(Dead),
    User(UserMsg),
}

impl Message {
    pub(crate) fn kind(&self) -> MessageKind {
        match self {
            Message::Ping(_) => MessageKind::Ping,
            Message::IndirectPing(_) => MessageKind::IndirectPing,
            Message::Ack(_) => MessageKind::Ack,
            Message::Nack(_) => MessageKind::Nack,
            Message::Suspect(_) => MessageKind::Suspect,
            Message::Alive(_) => MessageKind::Alive,
            Message::Dead(_) => MessageKind::Dead,
            Message::User(_) => MessageKind::User,
        }
    }
}
