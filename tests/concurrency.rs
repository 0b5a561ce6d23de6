//! Many clients against one router over loopback UDP

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{client_socket, recv_datagram, RunningRouter, TestClient};
use map_router::bus::{BasicPacket, RoutedPacket};
use map_router::core::blowfish::CipherKey;
use map_router::core::packet::{SubPacket, LOGIN_PACKET_TYPE};
use map_router::protocol::Session;
use map_router::transport::SessionTable;
use tokio::task::JoinSet;

const CLIENTS: u32 = 32;
const DATAGRAMS_PER_CLIENT: usize = 20;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_clients_keep_their_streams_apart() {
    let mut running = RunningRouter::start(1..=CLIENTS).await;
    let router_addr = running.addr;

    let mut tasks = JoinSet::new();
    for character in 1..=CLIENTS {
        tasks.spawn(async move {
            let socket = client_socket().await;
            let mut client = TestClient::new(character);
            socket.send_to(&client.login(0), router_addr).await.unwrap();
            // Let the login land before encrypted traffic
            tokio::time::sleep(Duration::from_millis(50)).await;

            for i in 0..DATAGRAMS_PER_CLIENT {
                let payload = (i as u32).to_le_bytes();
                let datagram = client.datagram(&[(0x015, &payload[..])]);
                socket.send_to(&datagram, router_addr).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            (character, socket.local_addr().unwrap())
        });
    }

    let mut addrs = HashMap::new();
    while let Some(done) = tasks.join_next().await {
        let (character, addr) = done.unwrap();
        addrs.insert(character, addr);
    }

    // Collect until the bus has been quiet for a while
    let mut per_character: HashMap<u32, Vec<u32>> = HashMap::new();
    while let Ok(Some(routed)) =
        tokio::time::timeout(Duration::from_millis(300), running.worker.recv()).await
    {
        let routed = routed.unwrap();
        assert_eq!(addrs[&routed.character_id], routed.client_addr);
        if routed.packet.packet_type == LOGIN_PACKET_TYPE {
            continue;
        }
        let data = &routed.packet.data;
        per_character
            .entry(routed.character_id)
            .or_default()
            .push(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
    }

    // Nothing is forwarded twice or out of order, and every sub-packet is
    // either forwarded or counted as skipped
    for character in 1..=CLIENTS {
        let seen = per_character.get(&character).cloned().unwrap_or_default();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "character {character}: {seen:?}");
    }
    let forwarded: usize = per_character.values().map(Vec::len).sum();
    let snap = running.metrics.snapshot();
    assert_eq!(
        forwarded as u64 + snap.subpackets_skipped,
        u64::from(CLIENTS) * DATAGRAMS_PER_CLIENT as u64
    );

    assert_eq!(running.router.sessions().len().await, CLIENTS as usize);
    assert_eq!(running.metrics.snapshot().decrypt_failures, 0);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replies_fan_out_to_every_client() {
    let mut running = RunningRouter::start(1..=8).await;

    let mut clients = Vec::new();
    for character in 1..=8u32 {
        let socket = client_socket().await;
        let client = TestClient::new(character);
        socket.send_to(&client.login(0), running.addr).await.unwrap();
        running.worker.recv().await.unwrap().unwrap();
        clients.push((socket, client));
    }

    for (socket, client) in &clients {
        for n in 0..3u8 {
            running
                .worker
                .send(&RoutedPacket {
                    client_addr: socket.local_addr().unwrap(),
                    character_id: client.character_id,
                    packet: BasicPacket {
                        packet_type: 0x040,
                        size: 4,
                        sequence: 0,
                        data: vec![n; 4],
                    },
                })
                .await
                .unwrap();
        }
    }

    for (socket, client) in &mut clients {
        let mut received = Vec::new();
        while received.len() < 3 {
            let datagram = recv_datagram(socket).await;
            let (_, packets) = client.open(&datagram);
            received.extend(packets.into_iter().map(|p| p.payload[0]));
        }
        assert_eq!(received, vec![0, 1, 2]);
    }
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locked_session_does_not_stall_other_clients() {
    let mut running = RunningRouter::start([1, 2]).await;

    let busy_socket = client_socket().await;
    let mut busy = TestClient::new(1);
    busy_socket.send_to(&busy.login(0), running.addr).await.unwrap();
    running.worker.recv().await.unwrap().unwrap();
    let busy_addr = busy_socket.local_addr().unwrap();

    // A queued reply makes the flush task wait on the held session
    let session = running.router.sessions().get(&busy_addr).await.unwrap();
    let guard = session.lock().await;
    running
        .router
        .queue_outbound(busy_addr, [SubPacket::new(0x040, vec![9u8; 4])])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other_socket = client_socket().await;
    let mut other = TestClient::new(2);
    other_socket.send_to(&other.login(0), running.addr).await.unwrap();
    let login = tokio::time::timeout(Duration::from_secs(2), running.worker.recv())
        .await
        .expect("second client stalled behind a locked session")
        .unwrap()
        .unwrap();
    assert_eq!(login.character_id, 2);

    let datagram = other.datagram(&[(0x015, &b"free"[..])]);
    other_socket.send_to(&datagram, running.addr).await.unwrap();
    let routed = tokio::time::timeout(Duration::from_secs(2), running.worker.recv())
        .await
        .expect("traffic stalled behind a locked session")
        .unwrap()
        .unwrap();
    assert_eq!(routed.packet.data, b"free");

    // Releasing the lock lets the queued reply out
    drop(guard);
    let reply = recv_datagram(&busy_socket).await;
    let (_, packets) = busy.open(&reply);
    assert_eq!(&packets[0].payload[..4], &[9u8; 4]);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_table_under_contention() {
    let table = Arc::new(SessionTable::new(64));

    let mut tasks = JoinSet::new();
    for worker in 0..8u16 {
        let table = table.clone();
        tasks.spawn(async move {
            for i in 0..16u16 {
                let addr: SocketAddr = format!("10.0.{worker}.{i}:4000").parse().unwrap();
                let (session, _, _) = table
                    .get_or_insert_with(addr, || {
                        Ok::<_, ()>(Session::new(addr, u32::from(i), CipherKey::from_str_key("k")))
                    })
                    .await
                    .unwrap();
                session.lock().await.touch();
            }
        });
    }
    while let Some(done) = tasks.join_next().await {
        done.unwrap();
    }

    let stats = table.stats().await;
    assert_eq!(stats.live_sessions, 64);
    assert_eq!(stats.total_created, 128);
    assert_eq!(stats.total_evicted, 64);
    assert!(table.evict_idle(Duration::from_secs(60)).await.is_empty());
}
