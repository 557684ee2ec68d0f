// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Collaborator interfaces consumed by the receive-side core, plus
//! in-memory test doubles for them.
//!
//! Everything in this module is boundary plumbing the core depends on but
//! does not implement: packet egress, the buffer pool, and the RPC/peer
//! tables. Production callers supply their own implementations; the test
//! doubles here exist so the rest of the crate is exercisable without a
//! real network stack, following the same dashmap-backed in-memory style
//! `hdds`'s own test helpers use for its discovery/reliability layers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::peer::{Peer, PeerId};
use crate::rpc::{Role, Rpc, RpcState};
use crate::wire::{ControlPacket, DataPacket, PeerAddr};

/// Packet egress: transmission of control and data
/// packets is entirely out of scope; this trait is the seam.
pub trait PacketSink: Send + Sync {
    fn transmit_control(&self, packet: ControlPacket, rpc_id: u64);
    fn transmit_control_to_peer(&self, packet: ControlPacket, addr: PeerAddr);
    fn transmit_data(&self, rpc_id: u64, force: bool);
    fn retransmit_data(&self, rpc_id: u64, start: u32, end: u32, priority: u8);
}

/// User-facing buffer pool: `allocate` reserves
/// `num_bpages` for a newly-sized message; `copy_in` stages received
/// bytes into user memory (standing in for the original's
/// `pool.get_buffer(rpc, offset) -> (ptr, bytes_available)` plus the
/// actual `memcpy`, collapsed into one safe call since this crate does
/// not own raw user-page mappings).
pub trait BufferPool: Send + Sync {
    fn allocate(&self, rpc_id: u64, message_length: u32) -> Result<u32>;
    fn copy_in(&self, rpc_id: u64, offset: u32, data: &[u8]) -> Result<usize>;
    fn release(&self, rpc_id: u64);
}

/// RPC allocation/lookup table.
pub trait RpcTable: Send + Sync {
    fn find_client(&self, id: u64) -> Option<Arc<Rpc>>;
    fn find_server(&self, peer: PeerId, sport: u16, id: u64) -> Option<Arc<Rpc>>;
    /// Create (or, on a racing duplicate, look up) the server RPC for an
    /// incoming DATA packet, initializing `msgin` eagerly from
    /// `data_pkt` so the caller never sees an RPC with an
    /// uninitialized incoming message.
    #[allow(clippy::too_many_arguments)]
    fn new_server(
        &self,
        peer: Arc<Peer>,
        sport: u16,
        dport: u16,
        id: u64,
        data_pkt: &DataPacket,
        unsched_bytes: u32,
        now: u64,
    ) -> Result<(Arc<Rpc>, bool)>;
    fn remove(&self, id: u64);
    /// Number of `Dead` RPCs still occupying a table slot, awaiting
    /// [`RpcTable::reap`] (`hsk->dead_skbs` in the original).
    fn dead_count(&self) -> u32;
    /// Drop up to `limit` `Dead` entries from the table. Returns how many
    /// were actually reaped (`homa_rpc_reap`).
    fn reap(&self, limit: u32) -> u32;
}

/// Peer table: `find` never fails in this model —
/// peer records are created lazily, matching
/// `homa_peer_find`'s allocate-on-miss behavior.
pub trait PeerTable: Send + Sync {
    fn find(&self, addr: u64) -> Arc<Peer>;
}

/// In-memory [`PacketSink`] that records transmissions for assertions
/// instead of sending anything.
#[derive(Default)]
pub struct TestPacketSink {
    pub controls: Mutex<Vec<(u64, ControlPacket)>>,
    pub controls_to_peer: Mutex<Vec<(PeerAddr, ControlPacket)>>,
    pub data_sends: Mutex<Vec<(u64, bool)>>,
    pub retransmits: Mutex<Vec<(u64, u32, u32, u8)>>,
}

impl TestPacketSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketSink for TestPacketSink {
    fn transmit_control(&self, packet: ControlPacket, rpc_id: u64) {
        self.controls.lock().push((rpc_id, packet));
    }

    fn transmit_control_to_peer(&self, packet: ControlPacket, addr: PeerAddr) {
        self.controls_to_peer.lock().push((addr, packet));
    }

    fn transmit_data(&self, rpc_id: u64, force: bool) {
        self.data_sends.lock().push((rpc_id, force));
    }

    fn retransmit_data(&self, rpc_id: u64, start: u32, end: u32, priority: u8) {
        self.retransmits.lock().push((rpc_id, start, end, priority));
    }
}

/// In-memory [`BufferPool`]: allocates unlimited pages unless
/// `fail_allocate`/`exhausted` is set, and simply buffers bytes.
pub struct TestBufferPool {
    bpages_per_message: u32,
    exhausted: std::sync::atomic::AtomicBool,
    received: DashMap<u64, Vec<(u32, Vec<u8>)>>,
}

impl TestBufferPool {
    pub fn new(bpages_per_message: u32) -> Self {
        Self {
            bpages_per_message,
            exhausted: std::sync::atomic::AtomicBool::new(false),
            received: DashMap::new(),
        }
    }

    /// Simulate the pool running out of pages for subsequent allocations.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Relaxed);
    }

    pub fn received_bytes(&self, rpc_id: u64) -> usize {
        self.received
            .get(&rpc_id)
            .map(|v| v.iter().map(|(_, d)| d.len()).sum())
            .unwrap_or(0)
    }
}

impl BufferPool for TestBufferPool {
    fn allocate(&self, rpc_id: u64, _message_length: u32) -> Result<u32> {
        if self.exhausted.load(Ordering::Relaxed) {
            return Ok(0);
        }
        self.received.entry(rpc_id).or_default();
        Ok(self.bpages_per_message)
    }

    fn copy_in(&self, rpc_id: u64, offset: u32, data: &[u8]) -> Result<usize> {
        self.received
            .entry(rpc_id)
            .or_default()
            .push((offset, data.to_vec()));
        Ok(data.len())
    }

    fn release(&self, rpc_id: u64) {
        self.received.remove(&rpc_id);
    }
}

/// In-memory [`RpcTable`] keyed by RPC id, for single-test-process use.
pub struct TestRpcTable {
    rpcs: DashMap<u64, Arc<Rpc>>,
    next_server_seq: AtomicU64,
}

impl TestRpcTable {
    pub fn new() -> Self {
        Self {
            rpcs: DashMap::new(),
            next_server_seq: AtomicU64::new(1),
        }
    }

    pub fn insert_client(&self, rpc: Arc<Rpc>) {
        self.rpcs.insert(rpc.id, rpc);
    }

    pub fn get(&self, id: u64) -> Option<Arc<Rpc>> {
        self.rpcs.get(&id).map(|r| r.clone())
    }
}

impl Default for TestRpcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcTable for TestRpcTable {
    fn find_client(&self, id: u64) -> Option<Arc<Rpc>> {
        self.rpcs.get(&id).map(|r| r.clone())
    }

    fn find_server(&self, _peer: PeerId, _sport: u16, id: u64) -> Option<Arc<Rpc>> {
        self.rpcs.get(&id).map(|r| r.clone())
    }

    fn new_server(
        &self,
        peer: Arc<Peer>,
        sport: u16,
        dport: u16,
        id: u64,
        data_pkt: &DataPacket,
        unsched_bytes: u32,
        now: u64,
    ) -> Result<(Arc<Rpc>, bool)> {
        if let Some(existing) = self.rpcs.get(&id) {
            return Ok((existing.clone(), false));
        }
        let _seq = self.next_server_seq.fetch_add(1, Ordering::Relaxed);
        let rpc = Rpc::new(id, Role::Server, peer, sport, dport, RpcState::Incoming);
        rpc.msgin.lock().init(data_pkt.message_length, data_pkt.incoming, unsched_bytes, now);
        let rpc = Arc::new(rpc);
        self.rpcs.insert(id, rpc.clone());
        Ok((rpc, true))
    }

    fn remove(&self, id: u64) {
        self.rpcs.remove(&id);
    }

    fn dead_count(&self) -> u32 {
        self.rpcs.iter().filter(|e| e.value().state() == RpcState::Dead).count() as u32
    }

    fn reap(&self, limit: u32) -> u32 {
        let dead: Vec<u64> = self
            .rpcs
            .iter()
            .filter(|e| e.value().state() == RpcState::Dead)
            .map(|e| *e.key())
            .take(limit as usize)
            .collect();
        let reaped = dead.len() as u32;
        for id in dead {
            self.rpcs.remove(&id);
        }
        reaped
    }
}

/// In-memory [`PeerTable`]: allocates a fresh [`Peer`] per distinct
/// address on first lookup, then returns the same instance thereafter.
pub struct TestPeerTable {
    peers: DashMap<u64, Arc<Peer>>,
}

impl TestPeerTable {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }
}

impl Default for TestPeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable for TestPeerTable {
    fn find(&self, addr: u64) -> Arc<Peer> {
        self.peers
            .entry(addr)
            .or_insert_with(|| Arc::new(Peer::new(PeerId(addr))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_table_new_server_is_idempotent() {
        let table = TestRpcTable::new();
        let peer = Arc::new(Peer::new(PeerId(1)));
        let data_pkt = DataPacket {
            common: crate::wire::CommonHeader { sport: 80, dport: 81, sender_id: 5 },
            message_length: 2000,
            incoming: 1000,
            cutoff_version: 0,
            retransmit: false,
            seg: crate::wire::Segment {
                offset: 0,
                segment_length: 1000,
                ack: crate::wire::AckEntry { client_id: 0, client_port: 0, server_port: 0 },
            },
            payload: vec![],
        };
        let (rpc1, created1) = table.new_server(peer.clone(), 80, 81, 5, &data_pkt, 10_000, 0).unwrap();
        assert!(created1);
        assert_eq!(rpc1.msgin.lock().length, 2000);
        let (rpc2, created2) = table.new_server(peer, 80, 81, 5, &data_pkt, 10_000, 0).unwrap();
        assert!(!created2);
        assert_eq!(rpc1.id, rpc2.id);
    }

    #[test]
    fn test_buffer_pool_tracks_received_bytes() {
        let pool = TestBufferPool::new(4);
        assert_eq!(pool.allocate(1, 2000).unwrap(), 4);
        pool.copy_in(1, 0, &[0u8; 100]).unwrap();
        pool.copy_in(1, 100, &[0u8; 50]).unwrap();
        assert_eq!(pool.received_bytes(1), 150);
    }

    #[test]
    fn test_buffer_pool_exhaustion_returns_zero_pages() {
        let pool = TestBufferPool::new(4);
        pool.set_exhausted(true);
        assert_eq!(pool.allocate(1, 2000).unwrap(), 0);
    }
}
