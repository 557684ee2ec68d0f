// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Peer table entries ("Peer").
//!
//! Peer *table* plumbing itself (address resolution, lifetime) is out of
//! scope; this module only models what a receive-side
//! peer record carries.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::wire::AckEntry;

/// Number of scheduled + unscheduled priority levels Homa supports.
pub const HOMA_MAX_PRIORITIES: usize = 8;

/// Opaque identity for a remote endpoint address. Real address resolution
/// (IPv6 address, routing) is collaborator plumbing out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

/// Per-peer receive-side state.
pub struct Peer {
    id: PeerId,
    /// Per-priority unscheduled-bytes cutoffs, index 0 always `u32::MAX`
    /// (reserved for the highest, "always unscheduled" priority).
    unsched_cutoffs: Mutex<[u32; HOMA_MAX_PRIORITIES]>,
    /// Epoch counter for the cutoffs above; compared against the sender's
    /// `cutoff_version` to decide whether fresh CUTOFFS must be sent.
    cutoff_version: AtomicU32,
    /// Jiffy (coarse tick) of the last CUTOFFS transmission to this peer,
    /// so at most one CUTOFFS is sent per jiffy (DATA).
    last_cutoffs_jiffy: AtomicU32,
    /// Consecutive RESEND requests sent to this peer without a reply;
    /// cleared whenever any packet arrives from the peer.
    outstanding_resends: AtomicU32,
    /// RPC ids this peer is owed an ACK for, pending a NEED_ACK/ACK
    /// round trip.
    unacked: Mutex<Vec<u64>>,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        let mut cutoffs = [0u32; HOMA_MAX_PRIORITIES];
        cutoffs[0] = u32::MAX;
        Self {
            id,
            unsched_cutoffs: Mutex::new(cutoffs),
            cutoff_version: AtomicU32::new(0),
            last_cutoffs_jiffy: AtomicU32::new(u32::MAX),
            outstanding_resends: AtomicU32::new(0),
            unacked: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn cutoff_version(&self) -> u32 {
        self.cutoff_version.load(Ordering::Acquire)
    }

    pub fn unsched_cutoffs(&self) -> [u32; HOMA_MAX_PRIORITIES] {
        *self.unsched_cutoffs.lock()
    }

    /// Pick the priority for a `length`-byte unscheduled send to this
    /// peer: the highest priority level whose cutoff still covers it
    /// (`HomaUnschedPriority`). Slot 0's cutoff is always `u32::MAX`, so
    /// the search always terminates.
    pub fn unsched_priority(&self, length: u32) -> u8 {
        let cutoffs = self.unsched_cutoffs.lock();
        for i in (0..HOMA_MAX_PRIORITIES).rev() {
            if cutoffs[i] >= length {
                return i as u8;
            }
        }
        0
    }

    /// Apply a CUTOFFS packet's contents (CUTOFFS).
    pub fn apply_cutoffs(&self, cutoffs: [u32; HOMA_MAX_PRIORITIES], version: u16) {
        let mut guard = self.unsched_cutoffs.lock();
        *guard = cutoffs;
        guard[0] = u32::MAX;
        self.cutoff_version.store(version as u32, Ordering::Release);
    }

    pub fn clear_outstanding_resends(&self) {
        self.outstanding_resends.store(0, Ordering::Relaxed);
    }

    pub fn note_resend_sent(&self) -> u32 {
        self.outstanding_resends.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns true and updates the stored jiffy if this is the first
    /// CUTOFFS-worthy packet seen for `jiffy` (prevents flooding a peer
    /// with CUTOFFS under a burst of stale-version packets).
    pub fn note_cutoffs_jiffy(&self, jiffy: u32) -> bool {
        let prev = self.last_cutoffs_jiffy.swap(jiffy, Ordering::AcqRel);
        prev != jiffy
    }

    pub fn add_unacked(&self, id: u64) {
        self.unacked.lock().push(id);
    }

    /// Pop up to `max` pending acked ids for this peer (NEED_ACK:
    /// "up to N additionally-completed ids").
    pub fn take_acks(&self, max: usize) -> Vec<u64> {
        let mut guard = self.unacked.lock();
        let take = max.min(guard.len());
        guard.drain(..take).collect()
    }

    /// Record an ack entry carried in another packet's header, as
    /// `homa_rpc_acked` does for embedded and explicit acks.
    pub fn record_ack(&self, _entry: &AckEntry) {
        // The peer-table/RPC-lookup-by-ack plumbing is out of scope here;
        // callers resolve the named RPC via `RpcTable` and free it
        // directly. This hook exists so `Peer` has a stable place to
        // extend bookkeeping (e.g. replay protection) without touching
        // the dispatcher.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoffs_roundtrip_and_version() {
        let peer = Peer::new(PeerId(1));
        assert_eq!(peer.cutoff_version(), 0);
        let mut cutoffs = [100u32; HOMA_MAX_PRIORITIES];
        cutoffs[0] = 0; // caller-supplied garbage for slot 0
        peer.apply_cutoffs(cutoffs, 7);
        assert_eq!(peer.cutoff_version(), 7);
        assert_eq!(peer.unsched_cutoffs()[0], u32::MAX);
        assert_eq!(peer.unsched_cutoffs()[1], 100);
    }

    #[test]
    fn cutoffs_jiffy_gates_single_send_per_tick() {
        let peer = Peer::new(PeerId(1));
        assert!(peer.note_cutoffs_jiffy(5));
        assert!(!peer.note_cutoffs_jiffy(5));
        assert!(peer.note_cutoffs_jiffy(6));
    }

    #[test]
    fn unsched_priority_picks_highest_covering_level() {
        let peer = Peer::new(PeerId(1));
        let mut cutoffs = [0u32; HOMA_MAX_PRIORITIES];
        cutoffs[0] = u32::MAX;
        cutoffs[7] = 100;
        cutoffs[6] = 500;
        cutoffs[5] = 2000;
        peer.apply_cutoffs(cutoffs, 1);

        assert_eq!(peer.unsched_priority(50), 7);
        assert_eq!(peer.unsched_priority(300), 6);
        assert_eq!(peer.unsched_priority(1000), 5);
        assert_eq!(peer.unsched_priority(1_000_000), 0);
    }

    #[test]
    fn take_acks_drains_up_to_max() {
        let peer = Peer::new(PeerId(1));
        for id in 0..5u64 {
            peer.add_unacked(id);
        }
        let first = peer.take_acks(3);
        assert_eq!(first, vec![0, 1, 2]);
        let rest = peer.take_acks(10);
        assert_eq!(rest, vec![3, 4]);
    }
}
