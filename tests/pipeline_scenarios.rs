//! End-to-end scenarios over loopback UDP: login, traffic in both directions,
//! zone-key rotation, the de-duplication window and resends.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{client_socket, eventually, recv_datagram, RunningRouter, TestClient};
use map_router::bus::{BasicPacket, RoutedPacket, WorkerEndpoint};
use map_router::core::packet::{LOGIN_PACKET_TYPE, ZONE_PACKET_TYPE};
use map_router::protocol::SessionStatus;

const CHARACTER: u32 = 21828;

async fn next_packet(worker: &mut WorkerEndpoint) -> RoutedPacket {
    tokio::time::timeout(Duration::from_secs(5), worker.recv())
        .await
        .expect("timed out waiting for bus")
        .expect("bus closed")
        .expect("bad bus frame")
}

async fn assert_bus_quiet(worker: &mut WorkerEndpoint) {
    let pending = tokio::time::timeout(Duration::from_millis(100), worker.recv()).await;
    assert!(pending.is_err(), "unexpected packet on the bus: {pending:?}");
}

fn reply(to: std::net::SocketAddr, packet_type: u16, data: &[u8]) -> RoutedPacket {
    RoutedPacket {
        client_addr: to,
        character_id: CHARACTER,
        packet: BasicPacket {
            packet_type,
            size: data.len() as u16,
            sequence: 0,
            data: data.to_vec(),
        },
    }
}

/// Log in and swallow the login packet on the bus.
async fn logged_in(running: &mut RunningRouter) -> (tokio::net::UdpSocket, TestClient) {
    let socket = client_socket().await;
    let client = TestClient::new(CHARACTER);
    socket.send_to(&client.login(0), running.addr).await.unwrap();

    let login = next_packet(&mut running.worker).await;
    assert_eq!(login.packet.packet_type, LOGIN_PACKET_TYPE);
    assert_eq!(login.client_addr, socket.local_addr().unwrap());
    (socket, client)
}

#[tokio::test]
async fn test_client_packets_reach_worker() {
    let mut running = RunningRouter::start([CHARACTER]).await;
    let (socket, mut client) = logged_in(&mut running).await;

    let datagram = client.datagram(&[(0x015, &b"move"[..]), (0x01A, &b"chat1234"[..])]);
    socket.send_to(&datagram, running.addr).await.unwrap();

    let first = next_packet(&mut running.worker).await;
    let second = next_packet(&mut running.worker).await;
    assert_eq!(first.character_id, CHARACTER);
    assert_eq!(first.packet.packet_type, 0x015);
    assert_eq!(first.packet.data, b"move");
    assert_eq!(first.packet.sequence, 1);
    assert_eq!(second.packet.packet_type, 0x01A);
    assert_eq!(second.packet.data, b"chat1234");
    assert_eq!(second.packet.sequence, 2);

    let snap = running.metrics.snapshot();
    assert_eq!(snap.logins, 1);
    assert_eq!(snap.subpackets_forwarded, 3);
    running.stop().await;
}

#[tokio::test]
async fn test_worker_reply_reaches_client() {
    let mut running = RunningRouter::start([CHARACTER]).await;
    let (socket, mut client) = logged_in(&mut running).await;
    let client_addr = socket.local_addr().unwrap();

    running
        .worker
        .send(&reply(client_addr, 0x030, b"spawn npc"))
        .await
        .unwrap();

    let datagram = recv_datagram(&socket).await;
    assert!(datagram.len() <= 4096);
    let (header, packets) = client.open(&datagram);
    assert_eq!(header.sequence, 0);
    assert_eq!(header.ack, 0);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, 0x030);
    assert_eq!(&packets[0].payload[..9], b"spawn npc");

    let session = running.router.sessions().get(&client_addr).await.unwrap();
    assert_eq!(session.lock().await.status(), SessionStatus::Sent);
    running.stop().await;
}

#[tokio::test]
async fn test_zone_rotation_and_previous_key_fallback() {
    let mut running = RunningRouter::start([CHARACTER]).await;
    let (socket, mut client) = logged_in(&mut running).await;
    let client_addr = socket.local_addr().unwrap();

    running
        .worker
        .send(&reply(client_addr, ZONE_PACKET_TYPE, b"zone"))
        .await
        .unwrap();
    let datagram = recv_datagram(&socket).await;
    let (_, packets) = client.open(&datagram);
    assert_eq!(packets[0].packet_type, ZONE_PACKET_TYPE);
    eventually(|| running.metrics.snapshot().key_rotations == 1).await;

    // A datagram already in flight under the old key
    let old = client.previous.clone().unwrap();
    client.sequence += 1;
    let region = {
        let mut region = bytes::BytesMut::new();
        map_router::core::packet::SubPacket::new(0x015, b"late".to_vec())
            .encode_into(client.sequence, &mut region)
            .unwrap();
        region.extend_from_slice(&[0]);
        region
    };
    let stale = client.seal_with(&old, client.sequence, &region);
    socket.send_to(&stale, running.addr).await.unwrap();
    assert_eq!(next_packet(&mut running.worker).await.packet.data, b"late");
    assert_eq!(running.metrics.snapshot().previous_key_decrypts, 1);

    let session = running.router.sessions().get(&client_addr).await.unwrap();
    assert_eq!(session.lock().await.status(), SessionStatus::PendingZone);

    // The first datagram under the new key completes the rotation
    let fresh = client.datagram(&[(0x015, &b"here"[..])]);
    socket.send_to(&fresh, running.addr).await.unwrap();
    assert_eq!(next_packet(&mut running.worker).await.packet.data, b"here");
    assert_eq!(session.lock().await.status(), SessionStatus::Accepted);
    assert!(session.lock().await.previous_cipher().is_none());

    // The old key is no longer accepted
    client.sequence += 1;
    let too_late = client.seal_with(&old, client.sequence, &region);
    socket.send_to(&too_late, running.addr).await.unwrap();
    eventually(|| running.metrics.snapshot().decrypt_failures == 1).await;
    assert_bus_quiet(&mut running.worker).await;
    running.stop().await;
}

#[tokio::test]
async fn test_login_during_pending_rotation_abandons_previous_key() {
    let mut running = RunningRouter::start([CHARACTER]).await;
    let (socket, mut client) = logged_in(&mut running).await;
    let client_addr = socket.local_addr().unwrap();

    running
        .worker
        .send(&reply(client_addr, ZONE_PACKET_TYPE, b"zone"))
        .await
        .unwrap();
    client.open(&recv_datagram(&socket).await);
    eventually(|| running.metrics.snapshot().key_rotations == 1).await;

    let session = running.router.sessions().get(&client_addr).await.unwrap();
    assert_eq!(session.lock().await.status(), SessionStatus::PendingZone);
    assert!(session.lock().await.previous_cipher().is_some());

    // The client logs in again before sending anything under either key
    socket.send_to(&client.login(0), running.addr).await.unwrap();
    eventually(|| running.metrics.snapshot().logins == 2).await;
    assert_eq!(session.lock().await.status(), SessionStatus::Waiting);
    assert!(session.lock().await.previous_cipher().is_none());
    assert_eq!(running.router.sessions().len().await, 1);

    // The rotated key stays current and is accepted
    let fresh = client.datagram(&[(0x015, &b"back"[..])]);
    socket.send_to(&fresh, running.addr).await.unwrap();
    let routed = loop {
        let routed = next_packet(&mut running.worker).await;
        if routed.packet.packet_type != LOGIN_PACKET_TYPE {
            break routed;
        }
    };
    assert_eq!(routed.packet.data, b"back");
    assert_eq!(session.lock().await.status(), SessionStatus::Accepted);

    // The abandoned key gets no fallback
    let old = client.previous.clone().unwrap();
    client.sequence += 1;
    let mut region = bytes::BytesMut::new();
    map_router::core::packet::SubPacket::new(0x015, b"gone".to_vec())
        .encode_into(client.sequence, &mut region)
        .unwrap();
    region.extend_from_slice(&[0]);
    let stale = client.seal_with(&old, client.sequence, &region);
    socket.send_to(&stale, running.addr).await.unwrap();
    eventually(|| running.metrics.snapshot().decrypt_failures == 1).await;
    assert_eq!(running.metrics.snapshot().previous_key_decrypts, 0);
    assert_bus_quiet(&mut running.worker).await;
    running.stop().await;
}

#[tokio::test]
async fn test_duplicate_datagram_forwarded_once() {
    let mut running = RunningRouter::start([CHARACTER]).await;
    let (socket, mut client) = logged_in(&mut running).await;

    let datagram = client.datagram(&[(0x015, &b"once"[..])]);
    socket.send_to(&datagram, running.addr).await.unwrap();
    assert_eq!(next_packet(&mut running.worker).await.packet.data, b"once");

    socket.send_to(&datagram, running.addr).await.unwrap();
    eventually(|| running.metrics.snapshot().subpackets_skipped == 1).await;
    assert_bus_quiet(&mut running.worker).await;

    // Older sub-packets in a newer datagram are skipped too
    let mixed = client.datagram_at(3, &[(0x015, 1, &b"old!"[..]), (0x016, 3, &b"new!"[..])]);
    socket.send_to(&mixed, running.addr).await.unwrap();
    assert_eq!(next_packet(&mut running.worker).await.packet.data, b"new!");
    eventually(|| running.metrics.snapshot().subpackets_skipped == 2).await;

    let session = running
        .router
        .sessions()
        .get(&socket.local_addr().unwrap())
        .await
        .unwrap();
    assert_eq!(session.lock().await.last_client_sequence(), 3);
    running.stop().await;
}

#[tokio::test]
async fn test_lagging_ack_triggers_resend() {
    let mut running = RunningRouter::start([CHARACTER]).await;
    let (socket, mut client) = logged_in(&mut running).await;
    let client_addr = socket.local_addr().unwrap();

    running.worker.send(&reply(client_addr, 0x030, b"one!")).await.unwrap();
    let first = recv_datagram(&socket).await;
    client.open(&first);

    running.worker.send(&reply(client_addr, 0x030, b"two!")).await.unwrap();
    let second = recv_datagram(&socket).await;
    let (header, _) = client.open(&second);
    assert_eq!(header.sequence, 1);

    // Pretend the second datagram never arrived
    client.last_server_sequence = 0;
    let datagram = client.datagram(&[(0x015, &b"ping"[..])]);
    socket.send_to(&datagram, running.addr).await.unwrap();

    let resent = recv_datagram(&socket).await;
    assert_eq!(resent, second);
    assert_eq!(running.metrics.snapshot().resends, 1);
    running.stop().await;
}

#[tokio::test]
async fn test_login_resync_resets_sequences() {
    let mut running = RunningRouter::start([CHARACTER]).await;
    let (socket, mut client) = logged_in(&mut running).await;
    let client_addr = socket.local_addr().unwrap();

    for _ in 0..3 {
        let datagram = client.datagram(&[(0x015, &b"step"[..])]);
        socket.send_to(&datagram, running.addr).await.unwrap();
        next_packet(&mut running.worker).await;
    }

    socket.send_to(&client.login(40), running.addr).await.unwrap();
    next_packet(&mut running.worker).await;

    let session = running.router.sessions().get(&client_addr).await.unwrap();
    assert_eq!(session.lock().await.last_client_sequence(), 40);
    assert_eq!(session.lock().await.last_server_sequence(), 0);
    assert_eq!(running.router.sessions().len().await, 1);
    running.stop().await;
}

#[tokio::test]
async fn test_unknown_sender_and_unknown_character_are_dropped() {
    let mut running = RunningRouter::start([CHARACTER]).await;

    let stranger = client_socket().await;
    let mut impostor = TestClient::new(CHARACTER);
    stranger
        .send_to(&impostor.datagram(&[(0x015, &b"hi!!"[..])]), running.addr)
        .await
        .unwrap();

    let unknown = TestClient::new(99);
    stranger.send_to(&unknown.login(0), running.addr).await.unwrap();

    assert_bus_quiet(&mut running.worker).await;
    assert!(running.router.sessions().is_empty().await);

    // The router keeps serving known clients
    logged_in(&mut running).await;
    running.stop().await;
}
