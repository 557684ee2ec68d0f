// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Receiver-driven grant engine.
//!
//! Keeps a global SRPT-ordered `grantable` list and paces every
//! scheduled RPC's `granted` watermark so that `total_incoming` stays
//! near, but never over, `max_incoming`. Grants are computed under
//! `grantable_lock` and handed back to the caller for transmission
//! outside the lock (`grants_in_progress` on each RPC defers the reaper
//! until the caller finishes transmitting).

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{TunedConfig, MAX_GRANTS};
use crate::rpc::Rpc;
use crate::wire::GrantPacket;

/// A grant computed under the global lock, ready to transmit once the
/// lock is released.
pub struct PendingGrant {
    pub rpc: Arc<Rpc>,
    pub packet: GrantPacket,
}

/// Snapshot used to sort/compare grantable RPCs without re-locking on
/// every comparison.
#[derive(Clone, Copy)]
struct Key {
    bytes_remaining: u32,
    birth: u64,
}

fn key_of(rpc: &Rpc) -> Key {
    let msgin = rpc.msgin.lock();
    Key {
        bytes_remaining: msgin.bytes_remaining,
        birth: msgin.birth,
    }
}

/// SRPT order: smallest `bytes_remaining` first, oldest `birth` breaks
/// ties ("Global grant state").
fn srpt_order(a: Key, b: Key) -> CmpOrdering {
    a.bytes_remaining
        .cmp(&b.bytes_remaining)
        .then(a.birth.cmp(&b.birth))
}

/// Global grantable-list state, one per transport instance.
pub struct GrantEngine {
    grantable: Mutex<Vec<Arc<Rpc>>>,
    /// Sum over grantable RPCs of `granted - bytes_received`.
    total_incoming: AtomicU64,
    max_grantable_rpcs: AtomicU32,
    grantable_rpcs_integral: AtomicU64,
    /// Token bucket gating how often `SendGrants` tries a FIFO grant
    /// instead of pure SRPT ("FIFO anti-starvation").
    grant_nonfifo_left: AtomicI64,
}

impl Default for GrantEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GrantEngine {
    pub fn new() -> Self {
        Self {
            grantable: Mutex::new(Vec::new()),
            total_incoming: AtomicU64::new(0),
            max_grantable_rpcs: AtomicU32::new(0),
            grantable_rpcs_integral: AtomicU64::new(0),
            grant_nonfifo_left: AtomicI64::new(0),
        }
    }

    pub fn total_incoming(&self) -> u64 {
        self.total_incoming.load(Ordering::Acquire)
    }

    /// Account a net change in outstanding granted-but-unreceived bytes;
    /// called by the dispatcher with the `*delta` it accumulated.
    pub fn adjust_total_incoming(&self, delta: i64) {
        if delta >= 0 {
            self.total_incoming.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.total_incoming.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }

    pub fn num_grantable(&self) -> usize {
        self.grantable.lock().len()
    }

    /// Re-evaluate whether `rpc` belongs in the grantable list, and if
    /// so, at what position (`CheckGrantable`).
    pub fn check_grantable(&self, rpc: &Arc<Rpc>) {
        {
            let msgin = rpc.msgin.lock();
            if msgin.granted >= msgin.length.max(0) as u32 {
                return;
            }
        }
        let key = key_of(rpc);
        let mut list = self.grantable.lock();

        // Recheck now that we hold the lock: state may have changed
        // between the unlocked peek above and here.
        {
            let msgin = rpc.msgin.lock();
            if msgin.granted >= msgin.length.max(0) as u32 {
                return;
            }
        }

        if let Some(pos) = list.iter().position(|r| Arc::ptr_eq(r, rpc)) {
            // Already present: bubble toward the head while the
            // preceding entry has a strictly worse (or tied-but-younger)
            // key.
            let mut i = pos;
            while i > 0 && srpt_order(key_of(&list[i - 1]), key) == CmpOrdering::Greater {
                list.swap(i - 1, i);
                i -= 1;
            }
            return;
        }

        let insert_at = list
            .iter()
            .position(|r| srpt_order(key, key_of(r)) == CmpOrdering::Less)
            .unwrap_or(list.len());
        list.insert(insert_at, rpc.clone());
        rpc.in_grantable_list.store(true, Ordering::Release);

        let len = list.len() as u32;
        if len > self.max_grantable_rpcs.load(Ordering::Relaxed) {
            self.max_grantable_rpcs.store(len, Ordering::Relaxed);
        }
        self.grantable_rpcs_integral.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Unlink `rpc` from the grantable list if it's there, given the
    /// lock already held. Returns whether it was actually unlinked.
    fn remove_grantable_locked(&self, list: &mut Vec<Arc<Rpc>>, rpc: &Arc<Rpc>) -> bool {
        if let Some(pos) = list.iter().position(|r| Arc::ptr_eq(r, rpc)) {
            list.remove(pos);
            rpc.in_grantable_list.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Fast-path removal: skip the global lock entirely when the RPC is
    /// not currently linked (`RemoveGrantable`). Freeing a slot may open
    /// headroom for the rest of the grantable list, so a successful
    /// removal triggers an immediate `SendGrants` round.
    pub fn remove_grantable(&self, rpc: &Arc<Rpc>, cfg: &TunedConfig) {
        if !rpc.in_grantable_list.load(Ordering::Acquire) {
            return;
        }
        let removed = {
            let mut list = self.grantable.lock();
            self.remove_grantable_locked(&mut list, rpc)
        };
        if removed {
            let grants = self.send_grants(cfg);
            self.finish_grants(&grants);
        }
    }

    /// Choose up to `max_overcommit` (capped at [`MAX_GRANTS`]) RPCs to
    /// grant this round, honoring the per-peer fairness cap
    /// (`ChooseRpcs`).
    fn choose_rpcs(list: &[Arc<Rpc>], cfg: &TunedConfig) -> Vec<Arc<Rpc>> {
        let cap = cfg.max_overcommit.min(MAX_GRANTS) as usize;
        let mut chosen = Vec::with_capacity(cap);
        let mut per_peer: std::collections::HashMap<u64, u32> = std::collections::HashMap::new();
        for rpc in list.iter() {
            if chosen.len() >= cap {
                break;
            }
            let peer_key = rpc.peer.id().0;
            let count = per_peer.entry(peer_key).or_insert(0);
            if *count >= cfg.max_rpcs_per_peer {
                continue;
            }
            *count += 1;
            chosen.push(rpc.clone());
        }
        chosen
    }

    /// Compute grant increments for `chosen`, in priority rank order
    /// (`CreateGrants`). `available` is the
    /// remaining global headroom (`max_incoming - total_incoming`).
    /// `list` is the grantable list, locked continuously since
    /// `choose_rpcs` chose from it.
    fn create_grants(&self, list: &mut Vec<Arc<Rpc>>, chosen: &[Arc<Rpc>], cfg: &TunedConfig, mut available: i64) -> (Vec<PendingGrant>, u32) {
        let mut grants = Vec::new();
        let n_chosen = chosen.len() as u32;
        let mut to_remove = Vec::new();
        let mut total_increment: u32 = 0;

        for (rank, rpc) in chosen.iter().enumerate() {
            if available <= 0 {
                break;
            }
            let mut msgin = rpc.msgin.lock();
            let length = msgin.length.max(0) as u32;
            let received = length - msgin.bytes_remaining;
            let window = if cfg.window != 0 {
                cfg.window
            } else {
                (cfg.max_incoming / (n_chosen + 1)).max(1)
            };
            let new_grant = (received + window).min(length);
            let increment = new_grant as i64 - msgin.granted as i64;
            if increment <= 0 {
                continue;
            }
            let increment = increment.min(available) as u32;
            if increment == 0 {
                break;
            }

            msgin.granted += increment;
            available -= increment as i64;
            total_increment += increment;
            rpc.grants_in_progress.fetch_add(1, Ordering::AcqRel);
            rpc.clear_silent_ticks();
            let resend_all = msgin.resend_all;
            msgin.resend_all = false;

            let levels = cfg.max_sched_prio + 1;
            let rank_priority = if n_chosen < levels {
                let shift = levels - n_chosen;
                (cfg.max_sched_prio).saturating_sub(rank as u32 + shift)
            } else {
                cfg.max_sched_prio.saturating_sub(rank as u32)
            };
            msgin.priority = rank_priority.min(cfg.max_sched_prio) as u8;

            let complete = msgin.granted >= length;
            let packet = GrantPacket {
                common: crate::wire::CommonHeader {
                    sport: rpc.sport,
                    dport: rpc.dport,
                    sender_id: rpc.id,
                },
                offset: msgin.granted,
                priority: msgin.priority,
                resend_all,
            };
            drop(msgin);

            grants.push(PendingGrant { rpc: rpc.clone(), packet });
            if complete {
                to_remove.push(rpc.clone());
            }
        }

        for rpc in to_remove {
            self.remove_grantable_locked(list, &rpc);
        }
        (grants, total_increment)
    }

    /// Pick the oldest-birth grantable RPC whose pity grant is used up
    /// (`ChooseFifoGrant`), and bump its `granted`
    /// by `fifo_grant_increment`. `list` is the grantable list, locked
    /// continuously since `choose_rpcs` chose from it.
    fn choose_fifo_grant(&self, list: &mut Vec<Arc<Rpc>>, cfg: &TunedConfig) -> Option<PendingGrant> {
        let mut best: Option<(Arc<Rpc>, u64)> = None;
        for rpc in list.iter() {
            let msgin = rpc.msgin.lock();
            let received = msgin.length.max(0) as u32 - msgin.bytes_remaining;
            let outstanding = msgin.granted.saturating_sub(received);
            if outstanding > cfg.unsched_bytes {
                continue;
            }
            let birth = msgin.birth;
            drop(msgin);
            if best.as_ref().map(|(_, b)| birth < *b).unwrap_or(true) {
                best = Some((rpc.clone(), birth));
            }
        }

        let (rpc, _) = best?;
        let mut msgin = rpc.msgin.lock();
        let length = msgin.length.max(0) as u32;
        let new_grant = (msgin.granted + cfg.fifo_grant_increment).min(length);
        if new_grant <= msgin.granted {
            return None;
        }
        msgin.granted = new_grant;
        rpc.grants_in_progress.fetch_add(1, Ordering::AcqRel);
        let complete = msgin.granted >= length;
        let packet = GrantPacket {
            common: crate::wire::CommonHeader {
                sport: rpc.sport,
                dport: rpc.dport,
                sender_id: rpc.id,
            },
            offset: msgin.granted,
            priority: cfg.max_sched_prio as u8,
            resend_all: false,
        };
        drop(msgin);
        if complete {
            self.remove_grantable_locked(list, &rpc);
        }
        Some(PendingGrant { rpc, packet })
    }

    /// Compute this round's grants. Returns the grants the caller must
    /// transmit and then feed to [`GrantEngine::finish_grants`].
    ///
    /// Holds the grantable lock for the entire `ChooseRpcs` ->
    /// `CreateGrants` -> FIFO-anti-starvation sequence, mirroring the
    /// single `homa_grantable_lock`/`homa_grantable_unlock` pair around
    /// all three steps in `homa_send_grants`, so a concurrent
    /// `check_grantable`/`remove_grantable` can't mutate the list
    /// mid-round.
    pub fn send_grants(&self, cfg: &TunedConfig) -> Vec<PendingGrant> {
        let available = cfg.max_incoming as i64 - self.total_incoming() as i64;
        if available <= 0 {
            return Vec::new();
        }

        let mut list = self.grantable.lock();
        if list.is_empty() {
            return Vec::new();
        }

        let chosen = Self::choose_rpcs(&list, cfg);
        let (mut grants, total_increment) = self.create_grants(&mut list, &chosen, cfg, available);
        log::debug!("[homa::grant] round: {} chosen, {} bytes granted", chosen.len(), total_increment);

        let left = self
            .grant_nonfifo_left
            .fetch_sub(total_increment as i64, Ordering::Relaxed)
            - total_increment as i64;
        if left <= 0 {
            self.grant_nonfifo_left
                .store(cfg.grant_nonfifo as i64, Ordering::Relaxed);
            if let Some(fifo) = self.choose_fifo_grant(&mut list, cfg) {
                grants.push(fifo);
            }
        }

        grants
    }

    /// Caller has finished transmitting; release the `grants_in_progress`
    /// borrow on every granted RPC.
    pub fn finish_grants(&self, grants: &[PendingGrant]) {
        for g in grants {
            g.rpc.grants_in_progress.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
