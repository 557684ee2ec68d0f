// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RESEND packet handling ("RESEND").

use crate::rpc::{Role, Rpc, RpcState};
use crate::transport::Transport;
use crate::wire::{BusyPacket, CommonHeader, ControlPacket, ResendPacket};

/// `rpc` is `None` when the dispatcher found no matching RPC: reply
/// UNKNOWN so the peer can decide whether to restart or give up.
pub fn handle_unknown_rpc(transport: &Transport, common: &CommonHeader) {
    transport.sink.transmit_control(
        ControlPacket::Unknown(crate::wire::UnknownPacket {
            common: CommonHeader {
                sport: common.dport,
                dport: common.sport,
                sender_id: common.sender_id ^ 1,
            },
        }),
        common.sender_id ^ 1,
    );
}

fn reply_busy(transport: &Transport, rpc: &Rpc) {
    transport.sink.transmit_control(
        ControlPacket::Busy(BusyPacket {
            common: CommonHeader {
                sport: rpc.dport,
                dport: rpc.sport,
                sender_id: rpc.id,
            },
        }),
        rpc.id,
    );
}

pub fn handle(transport: &Transport, rpc: &Rpc, pkt: &ResendPacket) {
    if rpc.role == Role::Server && rpc.state() != RpcState::Outgoing {
        // We're still receiving this request; nothing to retransmit yet.
        reply_busy(transport, rpc);
        return;
    }

    let msgout = rpc.msgout.lock();
    if msgout.next_xmit_offset < msgout.granted {
        // We've chosen not to transmit data from this message yet; send
        // BUSY rather than resending bytes we never sent in the first
        // place.
        drop(msgout);
        reply_busy(transport, rpc);
        return;
    }
    let priority = msgout.priority.max(pkt.priority);
    drop(msgout);

    if pkt.length == 0 {
        // Liveness probe: nothing outstanding to resend, but we're alive.
        reply_busy(transport, rpc);
        return;
    }

    transport.sink.retransmit_data(rpc.id, pkt.offset, pkt.offset + pkt.length, priority);
}
