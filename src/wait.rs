// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread interest registration and the poll-then-sleep wait path
//! ("Handoff and Wait").

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};

use crate::clock::Clock;
use crate::collab::BufferPool;
use crate::config::TunedConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::reassembly;
use crate::rpc::{Rpc, RpcState};
use crate::socket::Socket;

/// A thread's registration in the wait path. `ready_rpc` is the atomic
/// slot `handoff` publishes into; `wake` backs the sleep step with a
/// condvar so `wait_for_message` isn't limited to busy-polling.
pub struct Interest {
    pub core: u32,
    /// Client RPC id this interest targets, or `None` for an
    /// untargeted (request/response queue) wait.
    pub reg_rpc: Option<u64>,
    ready_rpc: ArcSwapOption<Rpc>,
    /// True while the registering thread still owns the claim; cleared
    /// by `Handoff` so the waking thread inherits the RPC pre-locked.
    locked: AtomicBool,
    error: Mutex<Option<Error>>,
    wake_flag: Mutex<bool>,
    wake_cv: Condvar,
}

impl Interest {
    pub fn new(core: u32, reg_rpc: Option<u64>) -> Self {
        Self {
            core,
            reg_rpc,
            ready_rpc: ArcSwapOption::from(None),
            locked: AtomicBool::new(true),
            error: Mutex::new(None),
            wake_flag: Mutex::new(false),
            wake_cv: Condvar::new(),
        }
    }

    pub fn has_ready(&self) -> bool {
        self.ready_rpc.load().is_some()
    }

    /// True while the registering thread still owns the claim on the
    /// targeted RPC; false once `Handoff` has handed it off (the waking
    /// thread then owns the RPC pre-locked and must not re-lock it).
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn take_ready(&self) -> Option<Arc<Rpc>> {
        self.ready_rpc.swap(None)
    }

    pub fn error(&self) -> Option<Error> {
        self.error.lock().clone()
    }

    fn notify(&self) {
        let mut flag = self.wake_flag.lock();
        *flag = true;
        self.wake_cv.notify_one();
    }

    /// Publish `rpc` into this interest and wake the owning thread
    /// (: "publishes it into `interest.ready_rpc`
    /// atomically with release semantics").
    pub fn claim(&self, rpc: Arc<Rpc>) {
        self.ready_rpc.store(Some(rpc));
        self.notify();
    }

    pub fn wake_shutdown(&self) {
        *self.error.lock() = Some(Error::SocketShutdown);
        self.notify();
    }

    pub fn wake_interrupted(&self) {
        *self.error.lock() = Some(Error::Interrupted);
        self.notify();
    }

    /// Sleep until handed off, signaled, or `deadline` (in clock cycles,
    /// `None` for no deadline) passes.
    fn sleep_until_ready(&self, clock: &dyn Clock, deadline: Option<u64>) {
        let mut flag = self.wake_flag.lock();
        while !*flag {
            match deadline {
                Some(d) => {
                    let remaining_cycles = d.saturating_sub(clock.cycles());
                    if remaining_cycles == 0 {
                        return;
                    }
                    let remaining_nanos = remaining_cycles.saturating_mul(1_000_000_000) / clock.frequency_hz().max(1);
                    let timed_out = self
                        .wake_cv
                        .wait_for(&mut flag, Duration::from_nanos(remaining_nanos))
                        .timed_out();
                    if timed_out {
                        return;
                    }
                }
                None => self.wake_cv.wait(&mut flag),
            }
        }
        *flag = false;
    }
}

/// Per-core activity clock for [`choose_interest`]'s idle preference
/// (`ChooseInterest`).
pub struct CoreTracker {
    last_active: Vec<AtomicU64>,
}

impl CoreTracker {
    pub fn new(num_cores: usize) -> Self {
        Self {
            last_active: (0..num_cores).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn note_active(&self, core: u32, now: u64) {
        if let Some(slot) = self.last_active.get(core as usize) {
            slot.store(now, Ordering::Relaxed);
        }
    }

    pub fn is_idle(&self, core: u32, now: u64, busy_cycles: u64) -> bool {
        match self.last_active.get(core as usize) {
            Some(slot) => now.saturating_sub(slot.load(Ordering::Relaxed)) > busy_cycles,
            None => true,
        }
    }
}

/// Prefer an interest whose core hasn't done Homa work recently, to
/// spread hand-offs off hot cores; otherwise the first entry.
pub fn choose_interest(interests: &[Arc<Interest>], cores: &CoreTracker, now: u64, busy_cycles: u64) -> usize {
    interests
        .iter()
        .position(|i| cores.is_idle(i.core, now, busy_cycles))
        .unwrap_or(0)
}

/// Register a thread's interest (`RegisterInterest`).
/// Returns `true` if the targeted RPC was already ready and claimed
/// immediately.
pub fn register_interest(
    interest: &Arc<Interest>,
    socket: &Socket,
    request_side: bool,
    targeted_rpc: Option<Arc<Rpc>>,
) -> Result<bool> {
    if let Some(rpc) = &targeted_rpc {
        let mut guard = rpc.targeted_interest.lock();
        if guard.is_some() {
            return Err(Error::InvalidArgument);
        }
        *guard = Some(interest.clone());
        drop(guard);

        if rpc.is_pkts_ready() || rpc.error().is_some() {
            rpc.set_handing_off();
            interest.claim(rpc.clone());
            return Ok(true);
        }
        socket.push_interest(interest.clone(), request_side);
        return Ok(false);
    }

    match socket.claim_ready_or_push_interest(interest.clone(), request_side) {
        Some(rpc) => {
            rpc.in_ready_queue.store(false, Ordering::Release);
            interest.claim(rpc);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Hand off a ready RPC to a waiting thread, or queue it if none is
/// waiting (`Handoff`). Returns `true` if a thread
/// was woken directly.
pub fn handoff(rpc: &Arc<Rpc>, socket: &Socket, request_side: bool, cores: &CoreTracker, now: u64, busy_cycles: u64, metrics: &Metrics) -> bool {
    if rpc.in_ready_queue.load(Ordering::Acquire) {
        return false; // already queued, nothing new to do
    }
    if !rpc.set_handing_off() {
        return false; // already handing off
    }

    if let Some(interest) = rpc.targeted_interest.lock().take() {
        interest.locked.store(false, Ordering::Release);
        interest.claim(rpc.clone());
        cores.note_active(interest.core, now);
        metrics.handoffs_thread_waiting.fetch_add(1, Ordering::Relaxed);
        return true;
    }

    let picked = socket.pop_interest(request_side, |ifs| choose_interest(ifs, cores, now, busy_cycles));
    match picked {
        Some(interest) => {
            interest.locked.store(false, Ordering::Release);
            interest.claim(rpc.clone());
            cores.note_active(interest.core, now);
            metrics.handoffs_alt_thread.fetch_add(1, Ordering::Relaxed);
            true
        }
        None => {
            rpc.clear_handing_off();
            rpc.in_ready_queue.store(true, Ordering::Release);
            socket.push_ready(rpc.clone(), request_side);
            if request_side {
                metrics.requests_queued.fetch_add(1, Ordering::Relaxed);
            } else {
                metrics.responses_queued.fetch_add(1, Ordering::Relaxed);
            }
            false
        }
    }
}

/// Block (or poll, if `nonblocking`) until `interest` receives a fully
/// or partially assembled message (`WaitForMessage`).
///
/// `reap` is the collaborator's `rpc_reap(limit) -> work_remaining`;
/// it's drained to idle before blocking so dead RPCs don't pin memory
/// while this thread sleeps.
#[allow(clippy::too_many_arguments)]
pub fn wait_for_message(
    interest: &Arc<Interest>,
    socket: &Socket,
    request_side: bool,
    targeted_rpc: Option<Arc<Rpc>>,
    nonblocking: bool,
    clock: &dyn Clock,
    cfg: &TunedConfig,
    pool: &dyn BufferPool,
    metrics: &Metrics,
    mut reap: impl FnMut(u32) -> u32,
) -> Result<Arc<Rpc>> {
    // Each iteration of this outer loop finds a candidate RPC, but a
    // handoff that raced with that RPC dying means there's nothing
    // usable to return; re-register interest and try again rather than
    // failing the whole call.
    'retry: loop {
        let mut claimed = register_interest(interest, socket, request_side, targeted_rpc.clone())?;

        if claimed {
            metrics.fast_wakeups.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics.slow_wakeups.fetch_add(1, Ordering::Relaxed);
        }

        if !claimed {
            loop {
                let remaining = reap(cfg.reap_limit);
                std::thread::yield_now();
                if remaining == 0 {
                    break;
                }
            }

            if nonblocking && !interest.has_ready() {
                socket.unlink_interest(interest);
                return Err(Error::WouldBlock);
            }

            let yield_credit_cycles = clock.frequency_hz() / 200_000; // ~5us
            let poll_deadline = clock.cycles().saturating_add(cfg.poll_cycles);
            while clock.cycles() < poll_deadline && !interest.has_ready() {
                let before = clock.cycles();
                std::thread::yield_now();
                let elapsed = clock.cycles().saturating_sub(before);
                if elapsed > yield_credit_cycles {
                    // A long-blocking yield is credited as sleep, not poll;
                    // stop spinning and fall through to the real sleep.
                    break;
                }
            }

            if !interest.has_ready() {
                interest.sleep_until_ready(clock, None);
            }
            claimed = true;
        }
        let _ = claimed;

        socket.unlink_interest(interest);

        if let Some(err) = interest.error() {
            return Err(err);
        }

        loop {
            let rpc = interest.take_ready().ok_or(Error::Interrupted)?;
            if let Some(err) = rpc.error() {
                return Err(err);
            }
            if rpc.state() == RpcState::Dead {
                continue 'retry;
            }

            reassembly::copy_to_user(&rpc, pool).map_err(|_| Error::BufferPoolExhausted)?;

            let complete = {
                let msgin = rpc.msgin.lock();
                msgin.packets.is_empty() && msgin.bytes_remaining == 0
            };
            if complete {
                return Ok(rpc);
            }

            rpc.clear_pkts_ready();
            // More of this message is still in flight; re-attach as a
            // targeted wait on the same RPC and sleep for the rest.
            let mut guard = rpc.targeted_interest.lock();
            *guard = Some(interest.clone());
            drop(guard);
            if rpc.is_pkts_ready() {
                interest.claim(rpc.clone());
            } else {
                interest.sleep_until_ready(clock, None);
            }
            if let Some(err) = interest.error() {
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::collab::TestBufferPool;
    use crate::config::HomaConfig;
    use crate::peer::{Peer, PeerId};
    use crate::rpc::Role;

    fn new_rpc(id: u64) -> Arc<Rpc> {
        Arc::new(Rpc::new(id, Role::Client, Arc::new(Peer::new(PeerId(1))), 1, 2, RpcState::Incoming))
    }

    #[test]
    fn targeted_register_claims_immediately_when_already_ready() {
        let socket = Socket::new();
        let rpc = new_rpc(2);
        rpc.set_pkts_ready_if_clear();
        let interest = Arc::new(Interest::new(0, Some(2)));
        let claimed = register_interest(&interest, &socket, true, Some(rpc.clone())).unwrap();
        assert!(claimed);
        assert!(interest.has_ready());
    }

    #[test]
    fn second_targeted_register_on_same_rpc_errors() {
        let rpc = new_rpc(2);
        let socket = Socket::new();
        let i1 = Arc::new(Interest::new(0, Some(2)));
        let i2 = Arc::new(Interest::new(1, Some(2)));
        register_interest(&i1, &socket, true, Some(rpc.clone())).unwrap();
        let err = register_interest(&i2, &socket, true, Some(rpc)).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn handoff_to_targeted_interest_wakes_it() {
        let rpc = new_rpc(2);
        let socket = Socket::new();
        let interest = Arc::new(Interest::new(0, Some(2)));
        register_interest(&interest, &socket, true, Some(rpc.clone())).unwrap();
        rpc.clear_handing_off();
        let cores = CoreTracker::new(4);
        assert!(handoff(&rpc, &socket, true, &cores, 100, 10, &Metrics::default()));
        assert!(interest.has_ready());
    }

    #[test]
    fn handoff_without_waiter_queues_the_rpc() {
        let rpc = new_rpc(2);
        let socket = Socket::new();
        let cores = CoreTracker::new(4);
        let metrics = Metrics::default();
        assert!(!handoff(&rpc, &socket, true, &cores, 100, 10, &metrics));
        assert!(socket.pop_ready(true).is_some());
        assert_eq!(metrics.requests_queued(), 1);
    }

    #[test]
    fn repeated_handoff_does_not_double_enqueue() {
        let rpc = new_rpc(2);
        let socket = Socket::new();
        let cores = CoreTracker::new(4);
        let metrics = Metrics::default();
        assert!(!handoff(&rpc, &socket, true, &cores, 100, 10, &metrics));
        assert!(!handoff(&rpc, &socket, true, &cores, 100, 10, &metrics));
        assert!(socket.pop_ready(true).is_some());
        assert!(socket.pop_ready(true).is_none());
    }

    #[test]
    fn untargeted_register_claims_from_ready_queue() {
        let rpc = new_rpc(2);
        let socket = Socket::new();
        socket.push_ready(rpc.clone(), true);
        let interest = Arc::new(Interest::new(0, None));
        let claimed = register_interest(&interest, &socket, true, None).unwrap();
        assert!(claimed);
        assert!(interest.has_ready());
    }

    #[test]
    fn wait_for_message_returns_complete_rpc_immediately() {
        let rpc = new_rpc(2);
        {
            let mut msgin = rpc.msgin.lock();
            msgin.init(10, 10, 1000, 0);
        }
        let pool = TestBufferPool::new(1);
        pool.allocate(rpc.id, 10).unwrap();
        crate::reassembly::add_packet(&rpc, crate::rpc::PacketBuf { offset: 0, data: vec![1u8; 10] }, false);
        rpc.set_pkts_ready_if_clear();

        let socket = Socket::new();
        let interest = Arc::new(Interest::new(0, Some(rpc.id)));
        let clock = FakeClock::new(1_000_000);
        let cfg = HomaConfig::default().tune(&clock);
        let result = wait_for_message(&interest, &socket, true, Some(rpc.clone()), false, &clock, &cfg, &pool, &Metrics::default(), |_| 0);
        assert!(result.is_ok());
        assert_eq!(pool.received_bytes(rpc.id), 10);
    }

    #[test]
    fn dead_handoff_loops_back_to_reregister_instead_of_erroring() {
        let dead = new_rpc(2);
        dead.set_state(RpcState::Dead);
        let socket = Socket::new();
        socket.push_ready(dead.clone(), true);
        let interest = Arc::new(Interest::new(0, None));
        let clock = FakeClock::new(1_000_000);
        let cfg = HomaConfig::default().tune(&clock);
        let pool = TestBufferPool::new(1);
        let result = wait_for_message(&interest, &socket, true, None, true, &clock, &cfg, &pool, &Metrics::default(), |_| 0);
        // The dead RPC is discarded and interest re-registers; with
        // nothing else ready and nonblocking set, the retry surfaces
        // WouldBlock rather than an error about the stale dead RPC.
        assert_eq!(result.unwrap_err(), Error::WouldBlock);
    }

    #[test]
    fn wait_for_message_nonblocking_without_data_would_block() {
        let rpc = new_rpc(2);
        let socket = Socket::new();
        let interest = Arc::new(Interest::new(0, Some(rpc.id)));
        let clock = FakeClock::new(1_000_000);
        let cfg = HomaConfig::default().tune(&clock);
        let pool = TestBufferPool::new(1);
        let result = wait_for_message(&interest, &socket, true, Some(rpc.clone()), true, &clock, &cfg, &pool, &Metrics::default(), |_| 0);
        assert_eq!(result.unwrap_err(), Error::WouldBlock);
    }
}
