//! # Message Bus
//!
//! Hand-off point between the router and stateless game-logic workers.
//!
//! Every accepted inbound sub-packet is published as a [`RoutedPacket`]; workers
//! answer with routed packets of their own, which the router frames and queues
//! for the addressed client.
//!
//! ## Wire Format
//! ```text
//! [Format(1)] [Payload(N)]
//! ```
//! The format byte selects bincode (`0x01`, default) or JSON (`0x02`), so a
//! consumer can decode any frame without out-of-band agreement.
//!
//! ## In-process Bus
//! [`channel_bus`] wires the router to workers through bounded tokio channels
//! carrying encoded frames. Publishing never blocks the receive path: a full
//! channel is a [`ProtocolError::BusError`] and the packet is dropped.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::BusFormat;
use crate::core::packet::SubPacket;
use crate::error::{ProtocolError, Result};

impl BusFormat {
    /// Get the format identifier byte for the wire
    pub fn format_byte(self) -> u8 {
        match self {
            BusFormat::Bincode => 0x01,
            BusFormat::Json => 0x02,
        }
    }

    /// Detect format from identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(BusFormat::Bincode),
            0x02 => Some(BusFormat::Json),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BusFormat::Bincode => "Bincode",
            BusFormat::Json => "JSON",
        }
    }
}

/// Types that travel over the bus in either format
pub trait WireFormat: Serialize + DeserializeOwned + Sized {
    fn encode_format(&self, format: BusFormat) -> Result<Vec<u8>> {
        Ok(match format {
            BusFormat::Bincode => bincode::serialize(self)?,
            BusFormat::Json => serde_json::to_vec(self)?,
        })
    }

    /// Serialize with the leading format byte
    fn encode_with_header(&self, format: BusFormat) -> Result<Vec<u8>> {
        let mut data = vec![format.format_byte()];
        data.extend(self.encode_format(format)?);
        Ok(data)
    }

    fn decode_format(data: &[u8], format: BusFormat) -> Result<Self> {
        Ok(match format {
            BusFormat::Bincode => bincode::deserialize(data)?,
            BusFormat::Json => serde_json::from_slice(data)?,
        })
    }

    /// Deserialize a frame produced by [`WireFormat::encode_with_header`]
    fn decode_with_header(data: &[u8]) -> Result<(Self, BusFormat)> {
        let (&first, payload) = data
            .split_first()
            .ok_or_else(|| ProtocolError::BusError("Empty bus frame".to_string()))?;

        let format = BusFormat::from_byte(first)
            .ok_or_else(|| ProtocolError::BusError(format!("Unknown format byte: {first:#04x}")))?;

        Ok((Self::decode_format(payload, format)?, format))
    }
}

/// One application packet without its transport framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicPacket {
    pub packet_type: u16,
    /// Payload length in bytes
    pub size: u16,
    pub sequence: u16,
    pub data: Vec<u8>,
}

/// A packet plus the client it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedPacket {
    pub client_addr: SocketAddr,
    pub character_id: u32,
    pub packet: BasicPacket,
}

impl WireFormat for RoutedPacket {}

impl RoutedPacket {
    pub fn from_subpacket(client_addr: SocketAddr, character_id: u32, sub: &SubPacket) -> Self {
        Self {
            client_addr,
            character_id,
            packet: BasicPacket {
                packet_type: sub.packet_type,
                size: sub.payload.len() as u16,
                sequence: sub.sequence,
                data: sub.payload.to_vec(),
            },
        }
    }

    /// Outbound sub-packet; the sequence is assigned when it is packed.
    pub fn into_subpacket(self) -> SubPacket {
        SubPacket::new(self.packet.packet_type, self.packet.data)
    }
}

/// Where accepted inbound packets go
pub trait PacketBus: Send + Sync {
    fn publish(&self, packet: &RoutedPacket) -> Result<()>;
}

/// Router side of the in-process bus
#[derive(Debug, Clone)]
pub struct ChannelBus {
    format: BusFormat,
    to_workers: mpsc::Sender<Bytes>,
}

impl PacketBus for ChannelBus {
    fn publish(&self, packet: &RoutedPacket) -> Result<()> {
        let frame = Bytes::from(packet.encode_with_header(self.format)?);
        self.to_workers.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ProtocolError::BusError("Worker channel full".to_string()),
            TrySendError::Closed(_) => ProtocolError::BusError("Worker channel closed".to_string()),
        })
    }
}

/// Worker side of the in-process bus
#[derive(Debug)]
pub struct WorkerEndpoint {
    format: BusFormat,
    from_router: mpsc::Receiver<Bytes>,
    to_router: mpsc::Sender<Bytes>,
}

impl WorkerEndpoint {
    /// Next inbound packet; `None` once the router is gone.
    pub async fn recv(&mut self) -> Option<Result<RoutedPacket>> {
        let frame = self.from_router.recv().await?;
        Some(RoutedPacket::decode_with_header(&frame).map(|(packet, _)| packet))
    }

    /// Queue a packet for the client named in `packet.client_addr`.
    pub async fn send(&self, packet: &RoutedPacket) -> Result<()> {
        let frame = Bytes::from(packet.encode_with_header(self.format)?);
        self.to_router
            .send(frame)
            .await
            .map_err(|_| ProtocolError::BusError("Router channel closed".to_string()))
    }
}

/// Packets coming back from workers, consumed by the router
#[derive(Debug)]
pub struct ReplyReceiver {
    from_workers: mpsc::Receiver<Bytes>,
}

impl ReplyReceiver {
    pub async fn recv(&mut self) -> Option<Result<RoutedPacket>> {
        let frame = self.from_workers.recv().await?;
        Some(RoutedPacket::decode_with_header(&frame).map(|(packet, _)| packet))
    }
}

/// Build both halves of an in-process bus.
pub fn channel_bus(capacity: usize, format: BusFormat) -> (ChannelBus, WorkerEndpoint, ReplyReceiver) {
    let (to_workers, from_router) = mpsc::channel(capacity.max(1));
    let (to_router, from_workers) = mpsc::channel(capacity.max(1));
    (
        ChannelBus { format, to_workers },
        WorkerEndpoint {
            format,
            from_router,
            to_router,
        },
        ReplyReceiver { from_workers },
    )
}
