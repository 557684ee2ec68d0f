// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Receive-side counters.
//!
//! All plain atomics rather than a metrics-crate registry: this crate
//! has no sysfs/exporter surface of its own, so the counters exist
//! purely to be read back by whatever process-wide metrics plumbing the
//! embedding application already has.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        #[derive(Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)+
        }

        impl $name {
            $(
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )+
        }
    };
}

counters!(Metrics {
    packet_discards,
    resent_discards,
    resent_packets_used,
    dropped_data_no_bufs,
    fast_wakeups,
    slow_wakeups,
    data_pkts_received,
    grant_pkts_received,
    resend_pkts_received,
    unknown_pkts_received,
    busy_pkts_received,
    cutoffs_pkts_received,
    need_ack_pkts_received,
    ack_pkts_received,
    unrecognized_pkts_received,
    fifo_grants,
    fifo_grants_no_incoming,
    handoffs_alt_thread,
    handoffs_thread_waiting,
    requests_queued,
    responses_queued,
    server_rpcs_unknown,
    server_rpc_discards,
    msg_bytes_small,
    msg_bytes_medium,
    msg_bytes_large,
});

/// Coarse 3-bucket size histogram: the original's
/// per-64-byte/per-1KB granularity is dropped as a deliberate
/// simplification (see DESIGN.md).
impl Metrics {
    pub fn record_message_length(&self, length: u32) {
        if length <= 1024 {
            self.msg_bytes_small.fetch_add(1, Ordering::Relaxed);
        } else if length <= 65536 {
            self.msg_bytes_medium.fetch_add(1, Ordering::Relaxed);
        } else {
            self.msg_bytes_large.fetch_add(1, Ordering::Relaxed);
        }
    }
}
