// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-socket state: interest lists and ready queues.
//!
//! All four collections live behind one `Mutex` so claim-or-enqueue
//! decisions are atomic, matching a single per-socket lock in the
//! required lock-ordering discipline rather than one lock per list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::rpc::Rpc;
use crate::wait::Interest;

#[derive(Default)]
struct SocketInner {
    /// Inserted at the head, so a thread that recently waited here is
    /// reused first (cache locality).
    request_interests: VecDeque<Arc<Interest>>,
    response_interests: VecDeque<Arc<Interest>>,
    ready_requests: VecDeque<Arc<Rpc>>,
    ready_responses: VecDeque<Arc<Rpc>>,
}

/// One Homa socket's wait-side state. Socket-table membership, address
/// binding, and the `poll`/`epoll` data-ready notifier are collaborator
/// plumbing out of scope; this models only what `RegisterInterest` and
/// `Handoff` touch directly.
pub struct Socket {
    inner: Mutex<SocketInner>,
    shutdown: AtomicBool,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SocketInner::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Mark the socket shut down and wake every waiting interest with an
    /// error (: all waiters wake with "shutdown").
    pub fn shutdown(&self) {
        log::debug!("[homa::socket] shutting down, waking all waiters");
        self.shutdown.store(true, Ordering::Release);
        let mut inner = self.inner.lock();
        for interest in inner.request_interests.drain(..).chain(inner.response_interests.drain(..)) {
            interest.wake_shutdown();
        }
    }

    /// Insert `interest` at the head of the request or response list.
    pub fn push_interest(&self, interest: Arc<Interest>, request_side: bool) {
        let mut inner = self.inner.lock();
        if request_side {
            inner.request_interests.push_front(interest);
        } else {
            inner.response_interests.push_front(interest);
        }
    }

    /// Remove `interest` from whichever list it may currently be in.
    /// Safe to call even if a concurrent `Handoff` already removed it.
    pub fn unlink_interest(&self, interest: &Arc<Interest>) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.request_interests.iter().position(|i| Arc::ptr_eq(i, interest)) {
            inner.request_interests.remove(pos);
        }
        if let Some(pos) = inner.response_interests.iter().position(|i| Arc::ptr_eq(i, interest)) {
            inner.response_interests.remove(pos);
        }
    }

    /// Pop a waiting interest matching `request_side`, preferring the one
    /// `choose` selects (`ChooseInterest`).
    pub fn pop_interest(&self, request_side: bool, choose: impl Fn(&[Arc<Interest>]) -> usize) -> Option<Arc<Interest>> {
        let mut inner = self.inner.lock();
        let list = if request_side {
            &mut inner.request_interests
        } else {
            &mut inner.response_interests
        };
        if list.is_empty() {
            return None;
        }
        let slice: Vec<Arc<Interest>> = list.iter().cloned().collect();
        let idx = choose(&slice).min(list.len() - 1);
        list.remove(idx)
    }

    /// Atomically check the ready queue and, if empty, register
    /// `interest` — closing the race window between "is anything ready"
    /// and "register to be told when something is" (/// `RegisterInterest`'s untargeted path).
    pub fn claim_ready_or_push_interest(&self, interest: Arc<Interest>, request_side: bool) -> Option<Arc<Rpc>> {
        let mut inner = self.inner.lock();
        let queue = if request_side {
            &mut inner.ready_requests
        } else {
            &mut inner.ready_responses
        };
        if let Some(rpc) = queue.pop_front() {
            return Some(rpc);
        }
        let list = if request_side {
            &mut inner.request_interests
        } else {
            &mut inner.response_interests
        };
        list.push_front(interest);
        None
    }

    pub fn push_ready(&self, rpc: Arc<Rpc>, request_side: bool) {
        let mut inner = self.inner.lock();
        if request_side {
            inner.ready_requests.push_back(rpc);
        } else {
            inner.ready_responses.push_back(rpc);
        }
    }

    pub fn pop_ready(&self, request_side: bool) -> Option<Arc<Rpc>> {
        let mut inner = self.inner.lock();
        if request_side {
            inner.ready_requests.pop_front()
        } else {
            inner.ready_responses.pop_front()
        }
    }
}
