// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UNKNOWN packet handling ("UNKNOWN").
//!
//! A peer sends UNKNOWN when it has no record of an RPC we believe is
//! still alive: our client half restarts transmission from scratch at
//! unscheduled priority; our server half simply gives up and frees it.

use std::sync::Arc;

use crate::collab::RpcTable;
use crate::rpc::{Role, Rpc, RpcState};
use crate::transport::Transport;

pub fn handle(transport: &Transport, rpc: &Arc<Rpc>) {
    match rpc.role {
        Role::Client => {
            if rpc.state() != RpcState::Outgoing {
                log::error!("[homa::unknown] received UNKNOWN for rpc {} in bogus state {:?}; discarding", rpc.id, rpc.state());
                return;
            }
            let msgout = rpc.msgout.lock();
            let next_xmit_offset = msgout.next_xmit_offset;
            let length = msgout.length;
            drop(msgout);
            if next_xmit_offset > 0 {
                let priority = rpc.peer.unsched_priority(length);
                transport.sink.retransmit_data(rpc.id, 0, next_xmit_offset, priority);
            }
        }
        Role::Server => {
            rpc.set_state(RpcState::Dead);
            transport.rpc_table.remove(rpc.id);
        }
    }
}
