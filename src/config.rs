// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tuning configuration for the receive-side core.
//!
//! `HomaConfig` holds every user-facing tuning knob in user units;
//! `TunedConfig` holds the derived, cycle-based values rebuilt by
//! [`HomaConfig::tune`]. The clamps and formula in `tune` reproduce
//! `homa_incoming_sysctl_changed()` in `original_source/homa_incoming.c`.

use crate::clock::Clock;

/// Hard cap on RPCs granted concurrently in one `SendGrants` pass.
pub const MAX_GRANTS: u32 = 10;

/// User-facing tuning knobs.
#[derive(Debug, Clone)]
pub struct HomaConfig {
    /// Cap on outstanding granted-but-not-received bytes, globally.
    pub max_incoming: u32,
    /// Per-RPC window in bytes; 0 means compute dynamically.
    pub window: u32,
    /// Number of RPCs to grant concurrently (clamped to `MAX_GRANTS`).
    pub max_overcommit: u32,
    /// Fairness cap: RPCs chosen per peer in one `SendGrants` round.
    pub max_rpcs_per_peer: u32,
    /// Highest scheduled-priority level.
    pub max_sched_prio: u32,
    /// Bytes a sender may transmit unscheduled.
    pub unsched_bytes: u32,
    /// Share of grants routed via FIFO, in permil (0..=500).
    pub grant_fifo_fraction: u32,
    /// Bytes granted per FIFO "pity" grant.
    pub fifo_grant_increment: u32,
    /// Busy-wait window before sleeping in `WaitForMessage`, in usec.
    pub poll_usecs: u32,
    /// Staleness threshold for core-affinity handoff, in usec.
    pub busy_usecs: u32,
    /// User-buffer lease duration, in usec.
    pub bpage_lease_usecs: u32,
    /// Work budget per reap call.
    pub reap_limit: u32,
    /// Dead-RPC backlog that triggers inline reap during DATA handling.
    pub dead_buffs_limit: u32,
}

impl Default for HomaConfig {
    fn default() -> Self {
        Self {
            max_incoming: 1_000_000,
            window: 0,
            max_overcommit: 8,
            max_rpcs_per_peer: 4,
            max_sched_prio: 7,
            unsched_bytes: 10_000,
            grant_fifo_fraction: 50,
            fifo_grant_increment: 10_000,
            poll_usecs: 50,
            busy_usecs: 100,
            bpage_lease_usecs: 500_000,
            reap_limit: 10,
            dead_buffs_limit: 5000,
        }
    }
}

impl HomaConfig {
    /// Derive cycle-based tuning from this configuration, clamping
    /// out-of-range knobs to their documented limits.
    pub fn tune(&self, clock: &dyn Clock) -> TunedConfig {
        let max_overcommit = self.max_overcommit.min(MAX_GRANTS);
        let grant_fifo_fraction = self.grant_fifo_fraction.min(500);

        let grant_nonfifo = if grant_fifo_fraction == 0 {
            0
        } else {
            (1000u64 * self.fifo_grant_increment as u64) / grant_fifo_fraction as u64
                - self.fifo_grant_increment as u64
        };

        let hz = clock.frequency_hz();
        let to_cycles = |usecs: u32| -> u64 { (usecs as u64 * hz) / 1_000_000 };

        TunedConfig {
            max_incoming: self.max_incoming,
            window: self.window,
            max_overcommit,
            max_rpcs_per_peer: self.max_rpcs_per_peer,
            max_sched_prio: self.max_sched_prio,
            unsched_bytes: self.unsched_bytes,
            grant_fifo_fraction,
            fifo_grant_increment: self.fifo_grant_increment,
            grant_nonfifo,
            poll_cycles: to_cycles(self.poll_usecs),
            busy_cycles: to_cycles(self.busy_usecs),
            bpage_lease_cycles: to_cycles(self.bpage_lease_usecs),
            reap_limit: self.reap_limit,
            dead_buffs_limit: self.dead_buffs_limit,
        }
    }
}

/// Cycle-converted tuning, rebuilt whenever [`HomaConfig`] changes.
#[derive(Debug, Clone)]
pub struct TunedConfig {
    pub max_incoming: u32,
    pub window: u32,
    pub max_overcommit: u32,
    pub max_rpcs_per_peer: u32,
    pub max_sched_prio: u32,
    pub unsched_bytes: u32,
    pub grant_fifo_fraction: u32,
    pub fifo_grant_increment: u32,
    /// Non-FIFO bytes granted between two FIFO "pity" grants.
    pub grant_nonfifo: u64,
    pub poll_cycles: u64,
    pub busy_cycles: u64,
    pub bpage_lease_cycles: u64,
    pub reap_limit: u32,
    pub dead_buffs_limit: u32,
}
