// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DATA packet handling ("DATA").

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::maybe_send_cutoffs;
use crate::reassembly::{add_packet, AddOutcome};
use crate::rpc::{PacketBuf, Role, Rpc};
use crate::socket::Socket;
use crate::transport::Transport;
use crate::wait::handoff;
use crate::wire::DataPacket;

/// True for a server RPC (an incoming DATA here is a request) vs. a
/// client RPC (an incoming DATA here is a response).
fn is_request_side(rpc: &Rpc) -> bool {
    rpc.role == Role::Server
}

pub fn handle(transport: &Transport, socket: &Socket, rpc: &Arc<Rpc>, pkt: &DataPacket) {
    if rpc.role == Role::Client {
        rpc.transition_to_incoming_if_outgoing();
    }

    // Server RPCs have msgin initialized eagerly at creation (see
    // `RpcTable::new_server`); a client RPC's incoming response message
    // is initialized here, on the first DATA packet of that response.
    let cfg = transport.config();
    if rpc.msgin.lock().length < 0 {
        let mut msgin = rpc.msgin.lock();
        if msgin.length < 0 {
            msgin.init(pkt.message_length, pkt.incoming, cfg.unsched_bytes, transport.now());
            transport.metrics.record_message_length(pkt.message_length);
        }
    }

    if rpc.msgin.lock().num_bpages == 0 {
        match transport.pool.allocate(rpc.id, pkt.message_length) {
            Ok(n) if n > 0 => rpc.msgin.lock().num_bpages = n,
            _ => {
                transport.metrics.dropped_data_no_bufs.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    let buf = PacketBuf {
        offset: pkt.seg.offset,
        data: pkt.payload.clone(),
    };
    let (outcome, delta) = add_packet(rpc, buf, pkt.retransmit);

    match outcome {
        AddOutcome::Kept => {
            if delta > 0 {
                transport.grants.adjust_total_incoming(-delta);
            }
            if pkt.retransmit {
                transport.metrics.resent_packets_used.fetch_add(1, Ordering::Relaxed);
            }
            if rpc.set_pkts_ready_if_clear() {
                handoff(
                    rpc,
                    socket,
                    is_request_side(rpc),
                    &transport.cores,
                    transport.now(),
                    cfg.busy_cycles,
                    &transport.metrics,
                );
            }
            let scheduled = rpc.msgin.lock().scheduled;
            if scheduled {
                transport.grants.check_grantable(rpc);
            }
            maybe_send_cutoffs(transport, rpc, pkt.cutoff_version);
        }
        AddOutcome::DiscardedTooLong => {
            transport.metrics.packet_discards.fetch_add(1, Ordering::Relaxed);
        }
        AddOutcome::DiscardedTooLongRetransmit => {
            transport.metrics.resent_discards.fetch_add(1, Ordering::Relaxed);
        }
        AddOutcome::DiscardedViolation => {
            transport.metrics.packet_discards.fetch_add(1, Ordering::Relaxed);
        }
        AddOutcome::DiscardedDuplicate => {}
    }
}
