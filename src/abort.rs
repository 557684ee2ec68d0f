// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Abort paths.
//!
//! Walking "every active socket" / "every active RPC on a socket" is the
//! out-of-scope socket-table/registry collaborator's job; these functions
//! take the already-filtered candidate RPCs as an iterator and apply the
//! abort/free decision to each.

use std::sync::Arc;

use crate::collab::RpcTable;
use crate::config::TunedConfig;
use crate::error::Error;
use crate::grant::GrantEngine;
use crate::metrics::Metrics;
use crate::rpc::{Role, Rpc};
use crate::socket::Socket;
use crate::wait::{handoff, CoreTracker};

/// Abort one RPC: unschedule it, record the error, and wake whatever
/// thread is waiting on it (`AbortRpc`).
#[allow(clippy::too_many_arguments)]
pub fn abort_rpc(
    rpc: &Arc<Rpc>,
    errno: Error,
    grants: &GrantEngine,
    cfg: &TunedConfig,
    socket: &Socket,
    cores: &CoreTracker,
    now: u64,
    busy_cycles: u64,
    metrics: &Metrics,
) {
    log::debug!("[homa::abort] aborting rpc {} with {}", rpc.id, errno);
    grants.remove_grantable(rpc, cfg);
    rpc.set_error(errno);
    if !socket.is_shutdown() {
        handoff(rpc, socket, true, cores, now, busy_cycles, metrics);
        handoff(rpc, socket, false, cores, now, busy_cycles, metrics);
    }
}

/// Abort or free every RPC matching a failed peer
/// (`AbortRpcsForPeer`): client RPCs are aborted so
/// the application sees the error; server RPCs are simply freed since no
/// application thread owns them directly.
#[allow(clippy::too_many_arguments)]
pub fn abort_rpcs_for_peer<'a>(
    rpcs: impl IntoIterator<Item = (&'a Arc<Rpc>, &'a Socket)>,
    errno: Error,
    grants: &GrantEngine,
    cfg: &TunedConfig,
    rpc_table: &dyn RpcTable,
    cores: &CoreTracker,
    now: u64,
    busy_cycles: u64,
    metrics: &Metrics,
) {
    for (rpc, socket) in rpcs {
        match rpc.role {
            Role::Client => abort_rpc(rpc, errno.clone(), grants, cfg, socket, cores, now, busy_cycles, metrics),
            Role::Server => {
                grants.remove_grantable(rpc, cfg);
                rpc_table.remove(rpc.id);
            }
        }
    }
}

/// Abort (or free, if `errno` is `None`) every client RPC on one socket
/// (`AbortSocketRpcs`).
#[allow(clippy::too_many_arguments)]
pub fn abort_socket_rpcs<'a>(
    rpcs: impl IntoIterator<Item = &'a Arc<Rpc>>,
    errno: Option<Error>,
    grants: &GrantEngine,
    cfg: &TunedConfig,
    rpc_table: &dyn RpcTable,
    socket: &Socket,
    cores: &CoreTracker,
    now: u64,
    busy_cycles: u64,
    metrics: &Metrics,
) {
    for rpc in rpcs {
        if rpc.role != Role::Client {
            continue;
        }
        match &errno {
            Some(err) => abort_rpc(rpc, err.clone(), grants, cfg, socket, cores, now, busy_cycles, metrics),
            None => {
                grants.remove_grantable(rpc, cfg);
                rpc_table.remove(rpc.id);
            }
        }
    }
}
