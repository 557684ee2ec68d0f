// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RPC state: the unit of work reassembled and scheduled by this crate
//! ("RPC" / "IncomingMessage").

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::gap::GapList;
use crate::peer::Peer;

/// Sentinel for "length not yet known" (the original's `length = -1`).
pub const LENGTH_UNKNOWN: i64 = -1;

/// An RPC id's low bit distinguishes client- from server-originated.
pub fn is_client_id(id: u64) -> bool {
    id & 1 == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// RPC lifecycle state ("Lifecycle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    Outgoing,
    Incoming,
    Ready,
    Dead,
}

/// Atomic rendezvous bits set on an RPC:
/// not lifecycle, just flags coordinating concurrent arrival, handoff,
/// copy-out, and the reaper.
mod flag_bits {
    pub const PKTS_READY: u8 = 1 << 0;
    pub const HANDING_OFF: u8 = 1 << 1;
    pub const COPYING_TO_USER: u8 = 1 << 2;
}

/// A single received packet buffer, still owned until copied out or
/// freed on discard.
#[derive(Debug, Clone)]
pub struct PacketBuf {
    pub offset: u32,
    pub data: Vec<u8>,
}

impl PacketBuf {
    pub fn end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }
}

/// Per-RPC incoming-message reassembly state.
pub struct IncomingMessage {
    /// Total message length in bytes; [`LENGTH_UNKNOWN`] until the first
    /// DATA packet arrives.
    pub length: i64,
    /// Packets received so far, in arrival order (not offset order).
    pub packets: Vec<PacketBuf>,
    /// Trailing boundary of the highest-offset packet received so far.
    pub recv_end: u32,
    pub gaps: GapList,
    pub bytes_remaining: u32,
    pub granted: u32,
    pub priority: u8,
    pub scheduled: bool,
    pub resend_all: bool,
    /// Arrival timestamp (clock cycles) used as the FIFO tie-break.
    pub birth: u64,
    pub num_bpages: u32,
}

impl IncomingMessage {
    pub fn uninitialized() -> Self {
        Self {
            length: LENGTH_UNKNOWN,
            packets: Vec::new(),
            recv_end: 0,
            gaps: GapList::new(),
            bytes_remaining: 0,
            granted: 0,
            priority: 0,
            scheduled: false,
            resend_all: false,
            birth: 0,
            num_bpages: 0,
        }
    }

    /// Initialize from a DATA header's `message_length`/`incoming` fields
    /// (DATA handler) once the message length first
    /// becomes known.
    pub fn init(&mut self, message_length: u32, unsched_incoming: u32, unsched_bytes: u32, birth: u64) {
        self.length = message_length as i64;
        self.bytes_remaining = message_length;
        self.granted = unsched_incoming.min(message_length);
        self.scheduled = message_length > unsched_bytes;
        self.birth = birth;
    }

    pub fn is_complete(&self) -> bool {
        self.length >= 0 && self.recv_end == self.length as u32 && self.gaps.is_empty()
    }
}

/// Per-RPC outgoing-message state. Only the fields the receive-side
/// handlers (GRANT, UNKNOWN) read or update are modeled; transmission
/// itself is the out-of-scope egress collaborator.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub length: u32,
    /// Highest offset the peer has authorized us to transmit.
    pub granted: u32,
    /// Highest offset we have actually transmitted so far.
    pub next_xmit_offset: u32,
    pub priority: u8,
}

/// The unit of work: one RPC, in either client or server role.
pub struct Rpc {
    pub id: u64,
    pub role: Role,
    pub peer: Arc<Peer>,
    pub sport: u16,
    pub dport: u16,

    state: Mutex<RpcState>,
    pub msgin: Mutex<IncomingMessage>,
    pub msgout: Mutex<OutgoingMessage>,

    flags: AtomicU8,
    /// Borrow count preventing the reaper from freeing this RPC while a
    /// grant computed under the global lock is still being transmitted
    /// ("two-phase grant").
    pub grants_in_progress: AtomicU32,
    /// O(1) "am I in the grantable list" check so `RemoveGrantable` can
    /// skip the global lock on the common case.
    pub in_grantable_list: AtomicBool,
    /// O(1) "am I already on a socket's ready queue" check so a second
    /// `Handoff` call for the same RPC doesn't double-enqueue it.
    pub in_ready_queue: AtomicBool,
    /// Consecutive timer ticks without any packet activity; cleared by
    /// the dispatcher on DATA/GRANT/BUSY and by RESEND handling.
    pub silent_ticks: AtomicU32,

    error: Mutex<Option<Error>>,
    pub sequence: AtomicU64,

    /// Interest holding a targeted wait on this RPC
    /// (`RegisterInterest(..., id != 0)`), if any.
    pub targeted_interest: Mutex<Option<Arc<crate::wait::Interest>>>,
}

impl Rpc {
    pub fn new(id: u64, role: Role, peer: Arc<Peer>, sport: u16, dport: u16, initial_state: RpcState) -> Self {
        Self {
            id,
            role,
            peer,
            sport,
            dport,
            state: Mutex::new(initial_state),
            msgin: Mutex::new(IncomingMessage::uninitialized()),
            msgout: Mutex::new(OutgoingMessage::default()),
            flags: AtomicU8::new(0),
            grants_in_progress: AtomicU32::new(0),
            in_grantable_list: AtomicBool::new(false),
            in_ready_queue: AtomicBool::new(false),
            silent_ticks: AtomicU32::new(0),
            error: Mutex::new(None),
            sequence: AtomicU64::new(0),
            targeted_interest: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RpcState {
        *self.state.lock()
    }

    pub fn set_state(&self, new: RpcState) {
        *self.state.lock() = new;
    }

    /// Transition `Outgoing -> Incoming` if that's the current state;
    /// no-op (returns false) otherwise, matching the DATA handler's
    /// "if client RPC in OUTGOING state, transition" guard.
    pub fn transition_to_incoming_if_outgoing(&self) -> bool {
        let mut guard = self.state.lock();
        if *guard == RpcState::Outgoing {
            *guard = RpcState::Incoming;
            true
        } else {
            false
        }
    }

    pub fn error(&self) -> Option<Error> {
        self.error.lock().clone()
    }

    pub fn set_error(&self, err: Error) {
        *self.error.lock() = Some(err);
    }

    pub fn clear_silent_ticks(&self) {
        self.silent_ticks.store(0, Ordering::Relaxed);
    }

    pub fn is_pkts_ready(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flag_bits::PKTS_READY != 0
    }

    /// Atomically sets `PKTS_READY` if unset; returns true if this call
    /// was the one that set it (the DATA handler only calls `Handoff`
    /// the first time this flips).
    pub fn set_pkts_ready_if_clear(&self) -> bool {
        self.flags.fetch_or(flag_bits::PKTS_READY, Ordering::AcqRel) & flag_bits::PKTS_READY == 0
    }

    pub fn clear_pkts_ready(&self) {
        self.flags.fetch_and(!flag_bits::PKTS_READY, Ordering::AcqRel);
    }

    pub fn is_handing_off(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flag_bits::HANDING_OFF != 0
    }

    pub fn set_handing_off(&self) -> bool {
        self.flags.fetch_or(flag_bits::HANDING_OFF, Ordering::AcqRel) & flag_bits::HANDING_OFF == 0
    }

    pub fn clear_handing_off(&self) {
        self.flags.fetch_and(!flag_bits::HANDING_OFF, Ordering::AcqRel);
    }

    pub fn is_copying_to_user(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flag_bits::COPYING_TO_USER != 0
    }

    pub fn set_copying_to_user(&self) {
        self.flags.fetch_or(flag_bits::COPYING_TO_USER, Ordering::AcqRel);
    }

    pub fn clear_copying_to_user(&self) {
        self.flags.fetch_and(!flag_bits::COPYING_TO_USER, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;

    fn test_rpc(state: RpcState) -> Rpc {
        Rpc::new(2, Role::Client, Arc::new(Peer::new(PeerId(1))), 100, 200, state)
    }

    #[test]
    fn client_id_parity() {
        assert!(is_client_id(2));
        assert!(!is_client_id(3));
    }

    #[test]
    fn outgoing_to_incoming_transitions_once() {
        let rpc = test_rpc(RpcState::Outgoing);
        assert!(rpc.transition_to_incoming_if_outgoing());
        assert_eq!(rpc.state(), RpcState::Incoming);
        assert!(!rpc.transition_to_incoming_if_outgoing());
    }

    #[test]
    fn pkts_ready_set_once_semantics() {
        let rpc = test_rpc(RpcState::Incoming);
        assert!(rpc.set_pkts_ready_if_clear());
        assert!(rpc.is_pkts_ready());
        assert!(!rpc.set_pkts_ready_if_clear());
        rpc.clear_pkts_ready();
        assert!(!rpc.is_pkts_ready());
        assert!(rpc.set_pkts_ready_if_clear());
    }

    #[test]
    fn msgin_init_marks_scheduled_past_unsched_bytes() {
        let rpc = test_rpc(RpcState::Incoming);
        let mut msgin = rpc.msgin.lock();
        msgin.init(20000, 10000, 10000, 42);
        assert!(msgin.scheduled);
        assert_eq!(msgin.granted, 10000);
        assert_eq!(msgin.bytes_remaining, 20000);
    }
}
