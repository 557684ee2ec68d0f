// SPDX-License-Identifier: Apache-2.0 OR MIT

//! GRANT packet handling ("GRANT").

use crate::rpc::Rpc;
use crate::transport::Transport;
use crate::wire::GrantPacket;

pub fn handle(transport: &Transport, rpc: &Rpc, pkt: &GrantPacket) {
    let mut msgout = rpc.msgout.lock();
    if pkt.offset > msgout.granted {
        msgout.granted = pkt.offset.min(msgout.length);
    }
    msgout.priority = pkt.priority;

    if pkt.resend_all {
        let start = 0;
        let end = msgout.next_xmit_offset;
        drop(msgout);
        if end > start {
            transport.sink.retransmit_data(rpc.id, start, end, pkt.priority);
        }
    } else {
        drop(msgout);
    }
    transport.sink.transmit_data(rpc.id, false);
}
