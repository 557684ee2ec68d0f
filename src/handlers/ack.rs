// SPDX-License-Identifier: Apache-2.0 OR MIT

//! ACK packet handling ("ACK").
//!
//! Every id named by an ACK (the RPC it rode in on, plus each piggybacked
//! entry) names a server-side RPC the peer has fully received and will
//! never ask us to resend; we free our record of it.

use crate::collab::RpcTable;
use crate::wire::AckPacket;

pub fn handle(rpc_table: &dyn RpcTable, local_rpc_id: Option<u64>, pkt: &AckPacket) {
    if let Some(id) = local_rpc_id {
        rpc_table.remove(id);
    }
    for entry in &pkt.acks {
        rpc_table.remove(entry.client_id ^ 1);
    }
}
