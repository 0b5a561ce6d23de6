//! Shared helpers for the integration tests: a simulated game client and a
//! router running on a loopback socket.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use map_router::bus::{channel_bus, WorkerEndpoint};
use map_router::config::{BusFormat, RouterConfig, HEADER_SIZE};
use map_router::core::blowfish::{Blowfish, CipherKey};
use map_router::core::codec::BitCodec;
use map_router::core::packet::{
    compressed_region, seal, verify_checksum, DatagramHeader, SubPacket, SubPackets,
};
use map_router::core::tables::TableBuilder;
use map_router::protocol::login::build_login_datagram;
use map_router::protocol::{SessionKeyMaterial, StaticKeyProvider};
use map_router::router::Router;
use map_router::utils::metrics::Metrics;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SESSION_KEY: &str = "1f0b1767829e1a0b";

pub fn codec() -> BitCodec {
    BitCodec::new(TableBuilder::new().build().expect("tables"))
}

pub fn key_provider(characters: impl IntoIterator<Item = u32>) -> StaticKeyProvider {
    let keys = StaticKeyProvider::new();
    for character in characters {
        keys.insert(
            character,
            SessionKeyMaterial::new(CipherKey::from_str_key(&format!("{SESSION_KEY}{character}"))),
        );
    }
    keys
}

pub fn test_config() -> RouterConfig {
    RouterConfig::default_with_overrides(|c| {
        c.server.bind_address = "127.0.0.1:0".to_string();
        c.server.shutdown_timeout = Duration::from_secs(1);
        c.outbound.flush_interval = Duration::from_millis(5);
        c.logging.metrics_interval = Duration::ZERO;
    })
}

/// A router serving on loopback, plus the worker half of its bus.
pub struct RunningRouter {
    pub router: Arc<Router>,
    pub addr: SocketAddr,
    pub worker: WorkerEndpoint,
    pub metrics: Arc<Metrics>,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<map_router::Result<()>>,
}

impl RunningRouter {
    pub async fn start(characters: impl IntoIterator<Item = u32>) -> Self {
        Self::start_with(test_config(), characters).await
    }

    pub async fn start_with(config: RouterConfig, characters: impl IntoIterator<Item = u32>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let (bus, worker, replies) = channel_bus(1024, BusFormat::Bincode);
        let router = Router::bind(
            config,
            codec(),
            Arc::new(key_provider(characters)),
            Arc::new(bus),
            metrics.clone(),
        )
        .await
        .expect("bind router");
        let router = Arc::new(router);
        let addr = router.local_addr().expect("local addr");

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Arc::clone(&router).run(Some(replies), shutdown_rx));

        Self {
            router,
            addr,
            worker,
            metrics,
            shutdown_tx,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("router did not stop")
            .expect("router task panicked")
            .expect("router returned an error");
    }
}

/// Client side of the protocol, the mirror image of the router's pipelines.
pub struct TestClient {
    pub character_id: u32,
    pub cipher: Blowfish,
    pub previous: Option<Blowfish>,
    codec: BitCodec,
    pub sequence: u16,
    pub last_server_sequence: u16,
}

impl TestClient {
    pub fn new(character_id: u32) -> Self {
        Self {
            character_id,
            cipher: Blowfish::new(CipherKey::from_str_key(&format!(
                "{SESSION_KEY}{character_id}"
            ))),
            previous: None,
            codec: codec(),
            sequence: 0,
            last_server_sequence: 0,
        }
    }

    pub fn login(&self, sync: u16) -> Vec<u8> {
        build_login_datagram(self.character_id, sync, sync, &[])
    }

    /// Encrypted datagram carrying `packets`, each stamped with the next sequence.
    pub fn datagram(&mut self, packets: &[(u16, &[u8])]) -> Vec<u8> {
        let mut region = BytesMut::new();
        for (packet_type, payload) in packets {
            self.sequence = self.sequence.wrapping_add(1);
            SubPacket::new(*packet_type, payload.to_vec())
                .encode_into(self.sequence, &mut region)
                .expect("encode");
        }
        region.extend_from_slice(&[0]);
        self.seal_with(&self.cipher, self.sequence, &region)
    }

    /// Same as [`TestClient::datagram`] with explicit header and sub-packet sequences.
    pub fn datagram_at(&self, header_sequence: u16, packets: &[(u16, u16, &[u8])]) -> Vec<u8> {
        let mut region = BytesMut::new();
        for (packet_type, sequence, payload) in packets {
            SubPacket::new(*packet_type, payload.to_vec())
                .encode_into(*sequence, &mut region)
                .expect("encode");
        }
        region.extend_from_slice(&[0]);
        self.seal_with(&self.cipher, header_sequence, &region)
    }

    pub fn seal_with(&self, cipher: &Blowfish, sequence: u16, region: &[u8]) -> Vec<u8> {
        let (bits, compressed) = self.codec.compress_to_vec(region).expect("compress");
        let mut buf = BytesMut::new();
        DatagramHeader {
            sequence,
            ack: self.last_server_sequence,
            timestamp: 0,
        }
        .write(&mut buf);
        seal(&mut buf, &compressed, bits);
        cipher.encrypt_packet(&mut buf, HEADER_SIZE);
        buf.to_vec()
    }

    /// Decrypt and demultiplex a datagram from the router. A zone packet
    /// rotates the client key, as the game client does.
    pub fn open(&mut self, datagram: &[u8]) -> (DatagramHeader, Vec<SubPacket>) {
        let mut buf = datagram.to_vec();
        self.cipher.decrypt_packet(&mut buf, HEADER_SIZE);
        assert!(verify_checksum(&buf), "server datagram failed checksum");

        let header = DatagramHeader::read(&buf).expect("header");
        let (compressed, bits) = compressed_region(&buf).expect("region");
        let mut plain = vec![0u8; 4096];
        let len = self
            .codec
            .decompress(compressed, bits, &mut plain)
            .expect("decompress");

        let packets: Vec<SubPacket> = SubPackets::new(&plain[..len]).map(|raw| raw.to_owned()).collect();
        self.last_server_sequence = header.sequence;

        if packets.iter().any(|p| p.packet_type == map_router::core::packet::ZONE_PACKET_TYPE) {
            self.previous = Some(self.cipher.clone());
            self.cipher.increment_key();
        }
        (header, packets)
    }
}

/// Loopback socket for a simulated client.
pub async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind client")
}

pub async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv");
    buf.truncate(len);
    buf
}

/// Wait until `check` holds, polling every few milliseconds.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
