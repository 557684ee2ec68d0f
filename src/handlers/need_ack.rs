// SPDX-License-Identifier: Apache-2.0 OR MIT

//! NEED_ACK packet handling ("NEED_ACK").
//!
//! Silently ignored if the named RPC is still incomplete (the sender
//! will just ask again later); otherwise replies with an ACK naming the
//! RPC plus up to [`crate::wire::MAX_ACKS_PER_PACKET`] other ids we owe
//! this peer an acknowledgment for.

use crate::peer::Peer;
use crate::rpc::Rpc;
use crate::transport::Transport;
use crate::wire::{AckEntry, AckPacket, CommonHeader, ControlPacket, NeedAckPacket};

pub fn handle(transport: &Transport, peer: &Peer, rpc: Option<&Rpc>, pkt: &NeedAckPacket) {
    if let Some(rpc) = rpc {
        if !rpc.msgin.lock().is_complete() && rpc.error().is_none() {
            return;
        }
    }

    let mut acks = Vec::new();
    if let Some(rpc) = rpc {
        acks.push(AckEntry {
            client_id: rpc.id,
            client_port: rpc.sport,
            server_port: rpc.dport,
        });
    }
    for id in peer.take_acks(crate::wire::MAX_ACKS_PER_PACKET) {
        acks.push(AckEntry {
            client_id: id,
            client_port: pkt.common.dport,
            server_port: pkt.common.sport,
        });
    }

    transport.sink.transmit_control(
        ControlPacket::Ack(AckPacket {
            common: CommonHeader {
                sport: pkt.common.dport,
                dport: pkt.common.sport,
                sender_id: pkt.common.sender_id ^ 1,
            },
            acks,
        }),
        pkt.common.sender_id ^ 1,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::collab::{TestBufferPool, TestPacketSink, TestPeerTable, TestRpcTable};
    use crate::config::HomaConfig;
    use crate::peer::PeerId;
    use crate::rpc::{Role, RpcState};
    use std::sync::Arc;

    fn test_transport() -> (Transport, Arc<TestPacketSink>) {
        let sink = Arc::new(TestPacketSink::new());
        let transport = Transport::new(
            HomaConfig::default(),
            Arc::new(FakeClock::new(1_000_000)),
            sink.clone(),
            Arc::new(TestBufferPool::new(4)),
            Arc::new(TestRpcTable::new()),
            Arc::new(TestPeerTable::new()),
        );
        (transport, sink)
    }

    fn need_ack_pkt() -> NeedAckPacket {
        NeedAckPacket {
            common: CommonHeader { sport: 1, dport: 2, sender_id: 2 },
        }
    }

    #[test]
    fn incomplete_rpc_is_silently_ignored() {
        let (transport, sink) = test_transport();
        let peer = Peer::new(PeerId(1));
        let rpc = Rpc::new(3, Role::Server, Arc::new(Peer::new(PeerId(1))), 1, 2, RpcState::Incoming);
        rpc.msgin.lock().length = 1000;
        rpc.msgin.lock().bytes_remaining = 1000;
        handle(&transport, &peer, Some(&rpc), &need_ack_pkt());
        assert!(sink.controls.lock().is_empty());
    }

    #[test]
    fn complete_rpc_acks_with_piggybacked_ids() {
        let (transport, sink) = test_transport();
        let peer = Peer::new(PeerId(1));
        peer.add_unacked(40);
        peer.add_unacked(42);
        let rpc = Rpc::new(3, Role::Server, Arc::new(Peer::new(PeerId(1))), 1, 2, RpcState::Incoming);
        rpc.msgin.lock().length = 0;
        handle(&transport, &peer, Some(&rpc), &need_ack_pkt());
        let controls = sink.controls.lock();
        match &controls[0].1 {
            ControlPacket::Ack(ack) => {
                assert_eq!(ack.acks.len(), 3);
                assert_eq!(ack.acks[0].client_id, 3);
            }
            _ => panic!("expected ACK"),
        }
    }
}
