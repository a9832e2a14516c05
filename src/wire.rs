// src/wire.rs

//! The cluster-bus wire codec: a fixed header followed by a type-discriminated
//! payload. Endianness and layout are part of the wire-compatibility
//! contract, so this module never delegates to a generic serialization crate
//! for the header — only the embedded gossip-node snapshot (`ClusterNode`)
//! uses `bincode` for convenience, matching how the host store encodes its
//! own piggybacked node info.

use crate::errors::ClusterError;
use crate::node::{NodeAddr, NodeFlags};
use crate::slots::NUM_SLOTS;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use tokio_util::codec::{Decoder, Encoder};

/// 4-byte magic identifying a cluster-bus frame.
pub const SIGNATURE: &[u8; 4] = b"RCmb";
/// The only protocol version this codec understands.
pub const PROTOCOL_VERSION: u8 = 1;
/// Node identifiers are fixed-length 40-character hex strings.
pub const NODE_ID_LEN: usize = 40;
/// Bytes needed to represent a `NUM_SLOTS`-bit ownership bitmap.
pub const SLOT_BYTES: usize = NUM_SLOTS / 8;
/// Minimum bytes needed before the header's length prefix can be read.
const MIN_PREFIX_LEN: usize = 9; // signature(4) + version(1) + total_len(4)
/// Hard ceiling on a single frame, guarding against a corrupt/hostile
/// length field forcing an unbounded allocation.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The type-discriminant for a cluster-bus frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    Meet,
    Fail,
    Publish,
    AuthRequest,
    AuthAck,
    MfStart,
    Update,
    Module,
}

impl MessageType {
    fn to_u8(self) -> u8 {
        match self {
            MessageType::Ping => 0,
            MessageType::Pong => 1,
            MessageType::Meet => 2,
            MessageType::Fail => 3,
            MessageType::Publish => 4,
            MessageType::AuthRequest => 5,
            MessageType::AuthAck => 6,
            MessageType::MfStart => 7,
            MessageType::Update => 8,
            MessageType::Module => 9,
        }
    }

    fn from_u8(tag: u8) -> Result<Self, ClusterError> {
        Ok(match tag {
            0 => MessageType::Ping,
            1 => MessageType::Pong,
            2 => MessageType::Meet,
            3 => MessageType::Fail,
            4 => MessageType::Publish,
            5 => MessageType::AuthRequest,
            6 => MessageType::AuthAck,
            7 => MessageType::MfStart,
            8 => MessageType::Update,
            9 => MessageType::Module,
            other => return Err(ClusterError::Protocol(format!("unknown message type {other}"))),
        })
    }
}

bitflags::bitflags! {
    /// The 3-byte per-message flag field carried in every header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u32 {
        /// Set on a master's PING while it is paused for a manual failover.
        const PAUSED   = 1 << 0;
        /// Set on an AUTH_REQUEST to force a vote despite the master still
        /// being reachable (manual failover's FORCEACK).
        const FORCEACK = 1 << 1;
        /// Set on a client-originated redirection retry (ASKING).
        const ASKING   = 1 << 2;
    }
}

/// A digest entry piggybacked on PING/PONG/MEET for peer discovery and
/// failure-suspicion propagation.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipDigest {
    pub id: String,
    pub last_ping_sent_secs: u32,
    pub last_pong_received_secs: u32,
    pub addr: NodeAddr,
    pub flags: NodeFlags,
}

/// The type-discriminated payload union.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Gossip(Vec<GossipDigest>),
    Fail { node_id: String },
    Publish { channel: Bytes, message: Bytes },
    AuthOnly,
    Update { node_id: String, config_epoch: u64, slots: BTreeSet<u16> },
    Module { module_tag: u64, data: Bytes },
}

/// A fully decoded cluster-bus frame: the sender's full header snapshot plus
/// the type-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterFrame {
    pub msg_type: MessageType,
    pub sender_id: String,
    pub sender_current_epoch: u64,
    pub sender_config_epoch: u64,
    pub sender_repl_offset: u64,
    pub sender_slots: BTreeSet<u16>,
    pub sender_master_id: Option<String>,
    pub sender_addr: NodeAddr,
    pub sender_flags: NodeFlags,
    /// `true` if the sender currently considers the cluster state to be OK.
    pub sender_cluster_ok: bool,
    pub frame_flags: FrameFlags,
    pub payload: FramePayload,
}

fn put_node_id(dst: &mut BytesMut, id: &str) {
    let mut buf = [0u8; NODE_ID_LEN];
    let bytes = id.as_bytes();
    let n = bytes.len().min(NODE_ID_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    dst.put_slice(&buf);
}

fn get_node_id(src: &mut impl Buf) -> Result<String, ClusterError> {
    if src.remaining() < NODE_ID_LEN {
        return Err(ClusterError::Protocol("truncated node id".into()));
    }
    let mut buf = vec![0u8; NODE_ID_LEN];
    src.copy_to_slice(&mut buf);
    // Trim trailing NULs used to pad identifiers shorter than NODE_ID_LEN
    // (only the all-zero "null" pattern uses this in practice).
    while buf.last() == Some(&0) {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| ClusterError::Protocol("non-utf8 node id".into()))
}

fn put_addr(dst: &mut BytesMut, addr: &NodeAddr) {
    let ip_bytes = addr.ip.as_bytes();
    dst.put_u8(ip_bytes.len() as u8);
    dst.put_slice(ip_bytes);
    dst.put_u16(addr.client_port);
    dst.put_u16(addr.bus_port);
    dst.put_u16(addr.plaintext_port.unwrap_or(0));
}

fn get_addr(src: &mut impl Buf) -> Result<NodeAddr, ClusterError> {
    if src.remaining() < 1 {
        return Err(ClusterError::Protocol("truncated address".into()));
    }
    let ip_len = src.get_u8() as usize;
    if src.remaining() < ip_len + 6 {
        return Err(ClusterError::Protocol("truncated address".into()));
    }
    let mut ip_buf = vec![0u8; ip_len];
    src.copy_to_slice(&mut ip_buf);
    let ip = String::from_utf8(ip_buf).map_err(|_| ClusterError::Protocol("non-utf8 ip".into()))?;
    let client_port = src.get_u16();
    let bus_port = src.get_u16();
    let plaintext_port = match src.get_u16() {
        0 => None,
        p => Some(p),
    };
    Ok(NodeAddr { ip, client_port, bus_port, plaintext_port })
}

fn bitmap_from_slots(slots: &BTreeSet<u16>) -> [u8; SLOT_BYTES] {
    let mut bitmap = [0u8; SLOT_BYTES];
    for &slot in slots {
        bitmap[slot as usize / 8] |= 1 << (slot % 8);
    }
    bitmap
}

fn slots_from_bitmap(bitmap: &[u8]) -> BTreeSet<u16> {
    let mut slots = BTreeSet::new();
    for (byte_idx, byte) in bitmap.iter().enumerate() {
        for bit in 0..8u16 {
            if byte & (1 << bit) != 0 {
                slots.insert((byte_idx as u16) * 8 + bit);
            }
        }
    }
    slots
}

/// `tokio_util::codec` implementation driving the link manager's non-blocking
/// read/write loop.
#[derive(Debug, Default)]
pub struct ClusterBusCodec;

impl Encoder<ClusterFrame> for ClusterBusCodec {
    type Error = ClusterError;

    fn encode(&mut self, frame: ClusterFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        body.put_u8(frame.msg_type.to_u8());
        put_node_id(&mut body, &frame.sender_id);
        body.put_u64(frame.sender_current_epoch);
        body.put_u64(frame.sender_config_epoch);
        body.put_u64(frame.sender_repl_offset);
        body.put_slice(&bitmap_from_slots(&frame.sender_slots));
        match &frame.sender_master_id {
            Some(id) => put_node_id(&mut body, id),
            None => body.put_slice(&[0u8; NODE_ID_LEN]),
        }
        put_addr(&mut body, &frame.sender_addr);
        body.put_u16(frame.sender_flags.bits());
        body.put_u8(if frame.sender_cluster_ok { 0 } else { 1 });
        let flag_bits = frame.frame_flags.bits().to_be_bytes();
        body.put_slice(&flag_bits[1..4]); // 3-byte flag field

        match &frame.payload {
            FramePayload::Gossip(digests) => {
                body.put_u16(digests.len() as u16);
                for d in digests {
                    put_node_id(&mut body, &d.id);
                    body.put_u32(d.last_ping_sent_secs);
                    body.put_u32(d.last_pong_received_secs);
                    put_addr(&mut body, &d.addr);
                    body.put_u16(d.flags.bits());
                }
            }
            FramePayload::Fail { node_id } => put_node_id(&mut body, node_id),
            FramePayload::Publish { channel, message } => {
                body.put_u32(channel.len() as u32);
                body.put_u32(message.len() as u32);
                body.put_slice(channel);
                body.put_slice(message);
            }
            FramePayload::AuthOnly => {}
            FramePayload::Update { node_id, config_epoch, slots } => {
                put_node_id(&mut body, node_id);
                body.put_u64(*config_epoch);
                body.put_slice(&bitmap_from_slots(slots));
            }
            FramePayload::Module { module_tag, data } => {
                body.put_u64(*module_tag);
                body.put_u32(data.len() as u32);
                body.put_slice(data);
            }
        }

        let total_len = (MIN_PREFIX_LEN + body.len()) as u32;
        if total_len as usize > MAX_FRAME_LEN {
            return Err(ClusterError::Protocol("frame too large to encode".into()));
        }
        dst.put_slice(SIGNATURE);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u32(total_len);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for ClusterBusCodec {
    type Item = ClusterFrame;
    type Error = ClusterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MIN_PREFIX_LEN {
            return Ok(None);
        }
        if &src[0..4] != SIGNATURE {
            return Err(ClusterError::Protocol("bad signature".into()));
        }
        let version = src[4];
        if version != PROTOCOL_VERSION {
            return Err(ClusterError::Protocol(format!(
                "unsupported protocol version {version}"
            )));
        }
        let total_len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if total_len < MIN_PREFIX_LEN || total_len > MAX_FRAME_LEN {
            return Err(ClusterError::Protocol(format!(
                "declared length {total_len} out of bounds"
            )));
        }
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(total_len);
        frame_bytes.advance(MIN_PREFIX_LEN);
        let mut body = frame_bytes;

        if body.remaining() < 1 + NODE_ID_LEN + 8 + 8 + 8 + SLOT_BYTES + NODE_ID_LEN {
            return Err(ClusterError::Protocol("truncated header".into()));
        }
        let msg_type = MessageType::from_u8(body.get_u8())?;
        let sender_id = get_node_id(&mut body)?;
        let sender_current_epoch = body.get_u64();
        let sender_config_epoch = body.get_u64();
        let sender_repl_offset = body.get_u64();
        let mut bitmap = [0u8; SLOT_BYTES];
        body.copy_to_slice(&mut bitmap);
        let sender_slots = slots_from_bitmap(&bitmap);
        let raw_master_id = get_node_id(&mut body)?;
        let sender_master_id = if raw_master_id.is_empty() { None } else { Some(raw_master_id) };
        let sender_addr = get_addr(&mut body)?;
        if body.remaining() < 2 + 1 + 3 {
            return Err(ClusterError::Protocol("truncated header tail".into()));
        }
        let sender_flags = NodeFlags::from_bits_truncate(body.get_u16());
        let sender_cluster_ok = body.get_u8() == 0;
        let mut flag_bytes = [0u8; 4];
        body.copy_to_slice(&mut flag_bytes[1..4]);
        let frame_flags = FrameFlags::from_bits_truncate(u32::from_be_bytes(flag_bytes));

        let payload = decode_payload(msg_type, &mut body)?;

        Ok(Some(ClusterFrame {
            msg_type,
            sender_id,
            sender_current_epoch,
            sender_config_epoch,
            sender_repl_offset,
            sender_slots,
            sender_master_id,
            sender_addr,
            sender_flags,
            sender_cluster_ok,
            frame_flags,
            payload,
        }))
    }
}

fn decode_payload(msg_type: MessageType, body: &mut BytesMut) -> Result<FramePayload, ClusterError> {
    match msg_type {
        MessageType::Ping | MessageType::Pong | MessageType::Meet => {
            if body.remaining() < 2 {
                return Err(ClusterError::Protocol("truncated gossip count".into()));
            }
            let count = body.get_u16();
            let mut digests = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let id = get_node_id(body)?;
                if body.remaining() < 8 {
                    return Err(ClusterError::Protocol("truncated digest".into()));
                }
                let last_ping_sent_secs = body.get_u32();
                let last_pong_received_secs = body.get_u32();
                let addr = get_addr(body)?;
                if body.remaining() < 2 {
                    return Err(ClusterError::Protocol("truncated digest flags".into()));
                }
                let flags = NodeFlags::from_bits_truncate(body.get_u16());
                digests.push(GossipDigest { id, last_ping_sent_secs, last_pong_received_secs, addr, flags });
            }
            Ok(FramePayload::Gossip(digests))
        }
        MessageType::Fail => Ok(FramePayload::Fail { node_id: get_node_id(body)? }),
        MessageType::Publish => {
            if body.remaining() < 8 {
                return Err(ClusterError::Protocol("truncated publish lengths".into()));
            }
            let chan_len = body.get_u32() as usize;
            let msg_len = body.get_u32() as usize;
            if body.remaining() < chan_len + msg_len {
                return Err(ClusterError::Protocol("truncated publish body".into()));
            }
            let channel = body.copy_to_bytes(chan_len);
            let message = body.copy_to_bytes(msg_len);
            Ok(FramePayload::Publish { channel, message })
        }
        MessageType::AuthRequest | MessageType::AuthAck | MessageType::MfStart => Ok(FramePayload::AuthOnly),
        MessageType::Update => {
            let node_id = get_node_id(body)?;
            if body.remaining() < 8 + SLOT_BYTES {
                return Err(ClusterError::Protocol("truncated update payload".into()));
            }
            let config_epoch = body.get_u64();
            let mut bitmap = [0u8; SLOT_BYTES];
            body.copy_to_slice(&mut bitmap);
            Ok(FramePayload::Update { node_id, config_epoch, slots: slots_from_bitmap(&bitmap) })
        }
        MessageType::Module => {
            if body.remaining() < 12 {
                return Err(ClusterError::Protocol("truncated module header".into()));
            }
            let module_tag = body.get_u64();
            let len = body.get_u32() as usize;
            if body.remaining() < len {
                return Err(ClusterError::Protocol("truncated module body".into()));
            }
            Ok(FramePayload::Module { module_tag, data: body.copy_to_bytes(len) })
        }
    }
}
