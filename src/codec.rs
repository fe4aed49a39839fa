//! Wire codec: one-byte kind tags, bincode payload bodies, compound
//! batching, and the optional DEFLATE / AES-128-GCM envelopes.
//!
//! Envelope order on the wire is `Encrypt(Compress(message))`; the
//! decoder peels envelopes until it reaches a plain tagged message or a
//! compound batch.
use std::io::{Read as _, Write as _};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use ring::rand::{SecureRandom as _, SystemRandom};
use tokio_util::bytes::{Buf as _, BufMut as _, BytesMut};

use crate::message::{
    Ack, Alive, Dead, IndirectPing, Message, MessageKind, Nack, Ping, PushNodeState,
    PushPullHeader, Suspect, UserMsg,
};

/// DEFLATE is the only compression algorithm currently spoken.
const COMPRESSION_DEFLATE: u8 = 0;

/// Encrypt envelope: kind byte + nonce + AEAD tag.
const ENCRYPT_OVERHEAD: usize = 1 + NONCE_LEN + 16;

pub(crate) struct MessageCodec {
    key: Option<Arc<LessSafeKey>>,
    compress: bool,
    rng: SystemRandom,
}

impl MessageCodec {
    pub(crate) fn new(secret_key: Option<[u8; 16]>, compress: bool) -> Result<Self> {
        let key = match secret_key {
            Some(bytes) => {
                let unbound = UnboundKey::new(&AES_128_GCM, &bytes)
                    .map_err(|_| anyhow!("failed to initialize AES-128-GCM key"))?;
                Some(Arc::new(LessSafeKey::new(unbound)))
            }
            None => None,
        };
        Ok(Self {
            key,
            compress,
            rng: SystemRandom::new(),
        })
    }

    /// Bytes of packet budget consumed by the envelopes, independent of
    /// the message itself. Used when packing gossip into a datagram.
    pub(crate) fn envelope_overhead(&self) -> usize {
        let mut overhead = 0;
        if self.key.is_some() {
            overhead += ENCRYPT_OVERHEAD;
        }
        if self.compress {
            // Kind + algorithm byte; DEFLATE never expands past input + 5
            // bytes per 16 KiB block, one block at datagram sizes.
            overhead += 2 + 5;
        }
        overhead
    }

    /// Encode a message without envelopes: kind tag + bincode body.
    pub(crate) fn encode_plain(msg: &Message) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.put_u8(msg.kind() as u8);
        let body = match msg {
            Message::Ping(p) => bincode::serialize(p)?,
            Message::IndirectPing(p) => bincode::serialize(p)?,
            Message::Ack(p) => bincode::serialize(p)?,
            Message::Nack(p) => bincode::serialize(p)?,
            Message::Suspect(p) => bincode::serialize(p)?,
            Message::Alive(p) => bincode::serialize(p)?,
            Message::Dead(p) => bincode::serialize(p)?,
            Message::User(p) => bincode::serialize(p)?,
        };
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Encode a single message with the configured envelopes applied.
    pub(crate) fn encode(&self, msg: &Message) -> Result<BytesMut> {
        self.wrap(Self::encode_plain(msg)?)
    }

    /// Batch pre-encoded plain messages into one compound datagram and
    /// apply the envelopes. A single message skips the compound framing.
    pub(crate) fn encode_batch(&self, parts: &[Vec<u8>]) -> Result<BytesMut> {
        match parts {
            [] => bail!("cannot encode an empty batch"),
            [single] => self.wrap(BytesMut::from(&single[..])),
            many => {
                if many.len() > u8::MAX as usize {
                    bail!("compound message limited to {} parts", u8::MAX);
                }
                let mut buf = BytesMut::new();
                buf.put_u8(MessageKind::Compound as u8);
                buf.put_u8(many.len() as u8);
                for part in many {
                    buf.put_u16(part.len() as u16);
                }
                for part in many {
                    buf.extend_from_slice(part);
                }
                self.wrap(buf)
            }
        }
    }

    /// Decode an inbound packet into the messages it carries, peeling
    /// envelopes and flattening compound batches.
    pub(crate) fn decode(&self, data: &[u8]) -> Result<Vec<Message>> {
        let plain = self.unwrap_envelopes(data)?;
        let mut src = BytesMut::from(&plain[..]);
        if src.is_empty() {
            bail!("empty packet");
        }
        if src[0] == MessageKind::Compound as u8 {
            src.advance(1);
            return self.decode_compound(&mut src);
        }
        Ok(vec![Self::decode_plain(&src)?])
    }

    fn decode_compound(&self, src: &mut BytesMut) -> Result<Vec<Message>> {
        if src.remaining() < 1 {
            bail!("truncated compound header");
        }
        let count = src.get_u8() as usize;
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            if src.remaining() < 2 {
                bail!("truncated compound length table");
            }
            lengths.push(src.get_u16() as usize);
        }
        let mut messages = Vec::with_capacity(count);
        for len in lengths {
            if src.remaining() < len {
                bail!("truncated compound part");
            }
            let part = src.split_to(len);
            messages.push(Self::decode_plain(&part)?);
        }
        Ok(messages)
    }

    pub(crate) fn decode_plain(data: &[u8]) -> Result<Message> {
        if data.is_empty() {
            bail!("empty message");
        }
        let kind = MessageKind::from_u8(data[0])?;
        let body = &data[1..];
        let msg = match kind {
            MessageKind::Ping => Message::Ping(bincode::deserialize::<Ping>(body)?),
            MessageKind::IndirectPing => {
                Message::IndirectPing(bincode::deserialize::<IndirectPing>(body)?)
            }
            MessageKind::Ack => Message::Ack(bincode::deserialize::<Ack>(body)?),
            MessageKind::Nack => Message::Nack(bincode::deserialize::<Nack>(body)?),
            MessageKind::Suspect => Message::Suspect(bincode::deserialize::<Suspect>(body)?),
            MessageKind::Alive => Message::Alive(bincode::deserialize::<Alive>(body)?),
            MessageKind::Dead => Message::Dead(bincode::deserialize::<Dead>(body)?),
            MessageKind::User => Message::User(bincode::deserialize::<UserMsg>(body)?),
            other => bail!("unexpected message kind inside packet: {:?}", other),
        };
        Ok(msg)
    }

    fn wrap(&self, plain: BytesMut) -> Result<BytesMut> {
        let mut data = plain;
        if self.compress {
            data = Self::compress_payload(&data)?;
        }
        if self.key.is_some() {
            data = self.seal(&data)?;
        }
        Ok(data)
    }

    pub(crate) fn unwrap_envelopes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut current = data.to_vec();
        // A key requires every inbound packet to arrive sealed.
        if self.key.is_some() && current.first() != Some(&(MessageKind::Encrypt as u8)) {
            bail!("plaintext packet rejected: encryption is required");
        }
        loop {
            match current.first() {
                Some(&tag) if tag == MessageKind::Encrypt as u8 => {
                    current = self.open(&current[1..])?;
                }
                Some(&tag) if tag == MessageKind::Compress as u8 => {
                    current = Self::decompress_payload(&current[1..])?;
                }
                Some(_) => return Ok(current),
                None => bail!("empty packet"),
            }
        }
    }

    fn compress_payload(data: &[u8]) -> Result<BytesMut> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        let mut buf = BytesMut::with_capacity(compressed.len() + 2);
        buf.put_u8(MessageKind::Compress as u8);
        buf.put_u8(COMPRESSION_DEFLATE);
        buf.extend_from_slice(&compressed);
        Ok(buf)
    }

    fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            bail!("truncated compress envelope");
        }
        if data[0] != COMPRESSION_DEFLATE {
            bail!("unknown compression algorithm: {}", data[0]);
        }
        let mut decoder = DeflateDecoder::new(&data[1..]);
        let mut plain = Vec::new();
        decoder
            .read_to_end(&mut plain)
            .context("failed to decompress payload")?;
        Ok(plain)
    }

    fn seal(&self, data: &[u8]) -> Result<BytesMut> {
        let key = self.key.as_ref().expect("seal called without a key");
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("failed to generate nonce"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = data.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("failed to encrypt payload"))?;

        let mut buf = BytesMut::with_capacity(1 + NONCE_LEN + in_out.len());
        buf.put_u8(MessageKind::Encrypt as u8);
        buf.extend_from_slice(&nonce_bytes);
        buf.extend_from_slice(&in_out);
        Ok(buf)
    }

    fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| anyhow!("received encrypted packet without a configured key"))?;
        if data.len() < NONCE_LEN {
            bail!("truncated encrypt envelope");
        }
        let nonce_bytes: [u8; NONCE_LEN] = data[..NONCE_LEN].try_into()?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = data[NONCE_LEN..].to_vec();
        let plain = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("failed to decrypt payload"))?;
        Ok(plain.to_vec())
    }

    /// Encode a push/pull exchange: header, node records, user state.
    pub(crate) fn encode_push_pull(
        &self,
        join: bool,
        states: &[PushNodeState],
        user_state: &[u8],
    ) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageKind::PushPull as u8);
        let header = PushPullHeader {
            nodes: states.len() as u32,
            user_state_len: user_state.len() as u32,
            join,
        };
        buf.extend_from_slice(&bincode::serialize(&header)?);
        for state in states {
            let body = bincode::serialize(state)?;
            buf.put_u32(body.len() as u32);
            buf.extend_from_slice(&body);
        }
        buf.extend_from_slice(user_state);
        self.wrap(buf)
    }

    /// Decode the counterpart of [`encode_push_pull`].
    pub(crate) fn decode_push_pull(
        &self,
        data: &[u8],
    ) -> Result<(PushPullHeader, Vec<PushNodeState>, Vec<u8>)> {
        let plain = self.unwrap_envelopes(data)?;
        Self::decode_push_pull_plain(&plain)
    }

    /// Like [`decode_push_pull`], for data with envelopes already peeled.
    pub(crate) fn decode_push_pull_plain(
        plain: &[u8],
    ) -> Result<(PushPullHeader, Vec<PushNodeState>, Vec<u8>)> {
        let mut src = BytesMut::from(plain);
        if src.is_empty() || src.get_u8() != MessageKind::PushPull as u8 {
            bail!("expected push/pull frame");
        }
        let header_len = bincode::serialized_size(&PushPullHeader {
            nodes: 0,
            user_state_len: 0,
            join: false,
        })? as usize;
        if src.remaining() < header_len {
            bail!("truncated push/pull header");
        }
        let header: PushPullHeader = bincode::deserialize(&src.split_to(header_len))?;

        let mut states = Vec::with_capacity(header.nodes as usize);
        for _ in 0..header.nodes {
            if src.remaining() < 4 {
                bail!("truncated push/pull record length");
            }
            let len = src.get_u32() as usize;
            if src.remaining() < len {
                bail!("truncated push/pull record");
            }
            states.push(bincode::deserialize(&src.split_to(len))?);
        }

        if src.remaining() < header.user_state_len as usize {
            bail!("truncated push/pull user state");
        }
        let user_state = src.split_to(header.user_state_len as usize).to_vec();
        Ok((header, states, user_state))
    }
}
