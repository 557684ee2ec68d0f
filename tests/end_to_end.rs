// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios driving the public API the way an embedder
//! would: through `dispatch::dispatch` for arriving packets and
//! `wait::wait_for_message` for a thread claiming a completed message.

use std::sync::Arc;

use homa_recv::clock::FakeClock;
use homa_recv::collab::{TestBufferPool, TestPacketSink, TestPeerTable, TestRpcTable};
use homa_recv::config::HomaConfig;
use homa_recv::dispatch::{dispatch, Dispatcher};
use homa_recv::socket::Socket;
use homa_recv::transport::Transport;
use homa_recv::wire::{AckEntry, CommonHeader, DataPacket, Packet, Segment};

fn test_transport() -> (Transport, Arc<TestPacketSink>, Arc<TestBufferPool>) {
    let sink = Arc::new(TestPacketSink::new());
    let pool = Arc::new(TestBufferPool::new(4));
    let transport = Transport::new(
        HomaConfig::default(),
        Arc::new(FakeClock::new(1_000_000)),
        sink.clone(),
        pool.clone(),
        Arc::new(TestRpcTable::new()),
        Arc::new(TestPeerTable::new()),
    );
    (transport, sink, pool)
}

fn data_packet(sender_id: u64, offset: u32, payload_len: u32, message_length: u32) -> Packet {
    Packet::Data(DataPacket {
        common: CommonHeader { sport: 10, dport: 20, sender_id },
        message_length,
        incoming: message_length.min(3000),
        cutoff_version: 0,
        retransmit: false,
        seg: Segment {
            offset,
            segment_length: payload_len,
            ack: AckEntry { client_id: 0, client_port: 0, server_port: 0 },
        },
        payload: vec![0xab; payload_len as usize],
    })
}

/// Scenario 1: in-order two-packet message, drained
/// by a waiting thread once complete.
#[test]
fn in_order_two_packet_message_is_handed_off_and_drained() {
    let (transport, _sink, pool) = test_transport();
    let dispatcher = Dispatcher::new();
    let socket = Socket::new();

    dispatch(&transport, &dispatcher, &socket, 1, &data_packet(2, 0, 1000, 2000));
    dispatch(&transport, &dispatcher, &socket, 1, &data_packet(2, 1000, 1000, 2000));

    let rpc = transport.rpc_table.find_server(homa_recv::peer::PeerId(1), 20, 3).unwrap();
    assert_eq!(rpc.msgin.lock().recv_end, 2000);
    assert_eq!(rpc.msgin.lock().bytes_remaining, 0);
    assert!(rpc.is_pkts_ready());

    let interest = Arc::new(homa_recv::wait::Interest::new(0, Some(rpc.id)));
    homa_recv::wait::register_interest(&interest, &socket, true, Some(rpc.clone())).unwrap();
    let cfg = HomaConfig::default().tune(transport.clock.as_ref());
    let result = homa_recv::wait::wait_for_message(
        &interest,
        &socket,
        true,
        Some(rpc.clone()),
        false,
        transport.clock.as_ref(),
        &cfg,
        pool.as_ref(),
        &transport.metrics,
        |_| 0,
    )
    .unwrap();
    assert_eq!(result.id, rpc.id);
    assert_eq!(pool.received_bytes(rpc.id), 2000);
}

/// Scenarios 2+3: out-of-order arrival opens a gap,
/// a resend request targets exactly the missing range, and an interior
/// fill splits the gap in two.
#[test]
fn out_of_order_then_interior_fill_produces_expected_gaps() {
    let (transport, _sink, _pool) = test_transport();
    let dispatcher = Dispatcher::new();
    let socket = Socket::new();

    dispatch(&transport, &dispatcher, &socket, 1, &data_packet(2, 2000, 1000, 3000));
    let rpc = transport.rpc_table.find_server(homa_recv::peer::PeerId(1), 20, 3).unwrap();
    assert_eq!(rpc.msgin.lock().gaps.as_slice(), &[0..2000]);

    dispatch(&transport, &dispatcher, &socket, 1, &data_packet(2, 0, 1000, 3000));
    assert_eq!(rpc.msgin.lock().gaps.as_slice(), &[1000..2000]);
    assert_eq!(homa_recv::reassembly::get_resend_range(&rpc), (1000, 1000));

    dispatch(&transport, &dispatcher, &socket, 1, &data_packet(2, 1200, 600, 3000));
    assert_eq!(rpc.msgin.lock().gaps.as_slice(), &[1000..1200, 1800..2000]);
}

/// Scenario 6: an UNKNOWN reply restarts a client
/// RPC's transmission at unscheduled priority without killing it.
#[test]
fn unknown_packet_restarts_client_transmission() {
    let sink = Arc::new(TestPacketSink::new());
    let rpc_table = Arc::new(TestRpcTable::new());
    let transport = Transport::new(
        HomaConfig::default(),
        Arc::new(FakeClock::new(1_000_000)),
        sink.clone(),
        Arc::new(TestBufferPool::new(4)),
        rpc_table.clone(),
        Arc::new(TestPeerTable::new()),
    );
    let dispatcher = Dispatcher::new();
    let socket = Socket::new();

    let rpc = Arc::new(homa_recv::rpc::Rpc::new(
        2,
        homa_recv::rpc::Role::Client,
        Arc::new(homa_recv::peer::Peer::new(homa_recv::peer::PeerId(1))),
        10,
        20,
        homa_recv::rpc::RpcState::Outgoing,
    ));
    rpc.msgout.lock().next_xmit_offset = 4000;
    rpc.msgout.lock().granted = 4000;
    rpc.msgout.lock().length = 4000;
    rpc_table.insert_client(rpc.clone());

    let unknown = Packet::Unknown(homa_recv::wire::UnknownPacket {
        // The RPC's local id is 2 (client-owned, even); a packet naming
        // it arrives with sender_id = local_id ^ 1 = 3.
        common: CommonHeader { sport: 20, dport: 10, sender_id: 3 },
    });
    dispatch(&transport, &dispatcher, &socket, 1, &unknown);

    assert_eq!(sink.retransmits.lock()[0], (2, 0, 4000, 0));
    assert_eq!(rpc.state(), homa_recv::rpc::RpcState::Outgoing);
}

/// Scenario 5: grant fairness spreads across peers
/// even when more RPCs are grantable than the overcommit cap allows.
#[test]
fn grant_round_respects_per_peer_cap_across_dispatched_rpcs() {
    let (transport, _sink, pool) = test_transport();
    let dispatcher = Dispatcher::new();
    let socket = Socket::new();
    pool.set_exhausted(false);

    transport.set_config(&HomaConfig {
        max_rpcs_per_peer: 1,
        max_overcommit: 4,
        unsched_bytes: 0,
        ..HomaConfig::default()
    });

    // Two RPCs per peer address (1 and 2), all scheduled from byte 0.
    // Even sender_id (client-numbered request) is required to route
    // through the server-creation path in `dispatch`.
    for (peer_addr, sender_id, length) in [(1u64, 2u64, 20000u32), (1, 4, 30000), (2, 6, 15000), (2, 8, 25000)] {
        dispatch(&transport, &dispatcher, &socket, peer_addr, &data_packet(sender_id, 0, 100, length));
    }

    let cfg = transport.config();
    let grants = transport.grants.send_grants(&cfg);
    let peers: std::collections::HashSet<u64> = grants
        .iter()
        .map(|g| g.rpc.peer.id().0)
        .collect();
    assert_eq!(peers.len(), 2);
    assert!(grants.len() <= 4);
}
