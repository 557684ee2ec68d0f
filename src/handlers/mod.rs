// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One handler module per wire packet type.

pub mod ack;
pub mod busy;
pub mod cutoffs;
pub mod data;
pub mod grant;
pub mod need_ack;
pub mod resend;
pub mod unknown;

use crate::rpc::Rpc;
use crate::transport::Transport;

/// At most one CUTOFFS transmission per peer per jiffy
/// (DATA). We don't have a literal kernel jiffy
/// tick, so one is approximated as a fixed-size slice of clock cycles.
pub(crate) fn current_jiffy(transport: &Transport) -> u32 {
    let cycles_per_jiffy = (transport.clock.frequency_hz() / 1000).max(1);
    (transport.now() / cycles_per_jiffy) as u32
}

/// Send a fresh CUTOFFS packet to `rpc`'s peer if its cutoff epoch is
/// stale, rate-limited to once per jiffy.
pub(crate) fn maybe_send_cutoffs(transport: &Transport, rpc: &Rpc, sender_cutoff_version: u16) {
    if sender_cutoff_version as u32 == rpc.peer.cutoff_version() {
        return;
    }
    let jiffy = current_jiffy(transport);
    if !rpc.peer.note_cutoffs_jiffy(jiffy) {
        return;
    }
    let packet = crate::wire::CutoffsPacket {
        common: crate::wire::CommonHeader {
            sport: rpc.sport,
            dport: rpc.dport,
            sender_id: rpc.id,
        },
        unsched_cutoffs: rpc.peer.unsched_cutoffs(),
        cutoff_version: rpc.peer.cutoff_version() as u16,
    };
    transport
        .sink
        .transmit_control(crate::wire::ControlPacket::Cutoffs(packet), rpc.id);
}
