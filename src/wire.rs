// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire packet types.
//!
//! Structs here model the *parsed* packet, not its byte encoding — framing
//! and encode/decode belong to the (out-of-scope) egress/ingress plumbing.
//! Field names and semantics follow `original_source/homa_incoming.c`'s
//! `data_header`/`grant_header`/etc. structs.

use crate::peer::PeerId;

/// Maximum number of additional acks carried in one ACK or NEED_ACK
/// response (`NUM_PEER_UNACKED_IDS` in the original).
pub const MAX_ACKS_PER_PACKET: usize = 8;

/// Common header present on every Homa packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub sport: u16,
    pub dport: u16,
    /// RPC id as sent on the wire; low bit flips on receipt to map
    /// between the sender's and receiver's view of client/server.
    pub sender_id: u64,
}

/// One `{client_id, client_port, server_port}` acknowledgment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEntry {
    pub client_id: u64,
    pub client_port: u16,
    pub server_port: u16,
}

/// Segment payload carried by a DATA packet: byte range plus an
/// optionally-embedded ack (`client_id == 0` means "no ack embedded").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub segment_length: u32,
    pub ack: AckEntry,
}

/// DATA packet: carries message metadata plus one segment of payload.
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub common: CommonHeader,
    pub message_length: u32,
    pub incoming: u32,
    pub cutoff_version: u16,
    pub retransmit: bool,
    pub seg: Segment,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantPacket {
    pub common: CommonHeader,
    pub offset: u32,
    pub priority: u8,
    pub resend_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPacket {
    pub common: CommonHeader,
    pub offset: u32,
    pub length: u32,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownPacket {
    pub common: CommonHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyPacket {
    pub common: CommonHeader,
}

#[derive(Debug, Clone)]
pub struct CutoffsPacket {
    pub common: CommonHeader,
    pub unsched_cutoffs: [u32; super::peer::HOMA_MAX_PRIORITIES],
    pub cutoff_version: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedAckPacket {
    pub common: CommonHeader,
}

#[derive(Debug, Clone)]
pub struct AckPacket {
    pub common: CommonHeader,
    pub acks: Vec<AckEntry>,
}

/// Debug-only packet that triggers a timetrace freeze on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezePacket {
    pub common: CommonHeader,
}

/// A parsed incoming packet, tagged by type.
#[derive(Debug, Clone)]
pub enum Packet {
    Data(DataPacket),
    Grant(GrantPacket),
    Resend(ResendPacket),
    Unknown(UnknownPacket),
    Busy(BusyPacket),
    Cutoffs(CutoffsPacket),
    NeedAck(NeedAckPacket),
    Ack(AckPacket),
    Freeze(FreezePacket),
}

impl Packet {
    pub fn common(&self) -> &CommonHeader {
        match self {
            Packet::Data(p) => &p.common,
            Packet::Grant(p) => &p.common,
            Packet::Resend(p) => &p.common,
            Packet::Unknown(p) => &p.common,
            Packet::Busy(p) => &p.common,
            Packet::Cutoffs(p) => &p.common,
            Packet::NeedAck(p) => &p.common,
            Packet::Ack(p) => &p.common,
            Packet::Freeze(p) => &p.common,
        }
    }

    /// Local RPC id for this packet: the sender's id with its low bit
    /// flipped, so client and server halves of an RPC address the same
    /// logical id from each side's own point of view.
    pub fn local_id(&self) -> u64 {
        self.common().sender_id ^ 1
    }
}

/// A control packet ready to be handed to the (out-of-scope) egress path,
/// addressed either at a resolved RPC or directly at a peer.
#[derive(Debug, Clone)]
pub enum ControlPacket {
    Grant(GrantPacket),
    Resend(ResendPacket),
    Unknown(UnknownPacket),
    Busy(BusyPacket),
    Cutoffs(CutoffsPacket),
    Ack(AckPacket),
    Freeze(FreezePacket),
}

/// Identity of the peer a control packet not tied to an RPC should be
/// addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub peer: PeerId,
    pub sport: u16,
    pub dport: u16,
}
