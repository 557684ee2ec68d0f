// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The global mutable transport state tying the grant engine, tuning,
//! and collaborators together: a single value owned by the transport
//! instance, passed to every handler.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::clock::Clock;
use crate::collab::{BufferPool, PacketSink, PeerTable, RpcTable};
use crate::config::{HomaConfig, TunedConfig};
use crate::grant::GrantEngine;
use crate::metrics::Metrics;
use crate::wait::CoreTracker;

/// Default core count used when the embedder doesn't know its own
/// topology ahead of time; [`CoreTracker`] degrades gracefully (treats
/// out-of-range cores as always idle) if the real count is larger.
const DEFAULT_CORE_COUNT: usize = 256;

/// One Homa transport instance's receive-side state. Shared (via `Arc`)
/// across every socket and packet-handling context.
pub struct Transport {
    pub grants: GrantEngine,
    /// Hot-swappable tuned config, via `arc_swap::ArcSwap` for lock-free
    /// config reload: rebuilt wholesale by [`Transport::set_config`],
    /// read lock-free everywhere else.
    config: ArcSwap<TunedConfig>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
    pub cores: CoreTracker,
    pub sink: Arc<dyn PacketSink>,
    pub pool: Arc<dyn BufferPool>,
    pub rpc_table: Arc<dyn RpcTable>,
    pub peer_table: Arc<dyn PeerTable>,
}

impl Transport {
    pub fn new(
        config: HomaConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn PacketSink>,
        pool: Arc<dyn BufferPool>,
        rpc_table: Arc<dyn RpcTable>,
        peer_table: Arc<dyn PeerTable>,
    ) -> Self {
        let tuned = config.tune(clock.as_ref());
        Self {
            grants: GrantEngine::new(),
            config: ArcSwap::from_pointee(tuned),
            clock,
            metrics: Metrics::default(),
            cores: CoreTracker::new(DEFAULT_CORE_COUNT),
            sink,
            pool,
            rpc_table,
            peer_table,
        }
    }

    pub fn config(&self) -> arc_swap::Guard<Arc<TunedConfig>> {
        self.config.load()
    }

    /// Re-derive cycle-based tuning from a changed [`HomaConfig`]
    /// (`homa_incoming_sysctl_changed()` in the original).
    pub fn set_config(&self, config: &HomaConfig) {
        self.config.store(Arc::new(config.tune(self.clock.as_ref())));
    }

    pub fn now(&self) -> u64 {
        self.clock.cycles()
    }
}
