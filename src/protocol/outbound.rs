//! # Outbound Pipeline
//!
//! Packs queued sub-packets for one client into a single datagram.
//!
//! ## Assembly
//! ```text
//! header(seq, ack, time) | sub-packets... 0x00 | -> compress -> | bits | md5 |
//!                          \___________ encrypted in place ______________/
//! ```
//! Every packed sub-packet is stamped with the session's server sequence, the
//! same value written into the header. Packing stops at the per-datagram limit
//! or before a sub-packet would reach 4096 bytes.
//!
//! ## Rotation
//! When a zone sub-packet goes out, the key rotates after encryption, so the
//! datagram itself is readable under the old key.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, instrument};

use crate::config::{BIT_COUNT_SIZE, CHECKSUM_SIZE, HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_SUBPACKETS_PER_DATAGRAM};
use crate::core::codec::{compressed_size, BitCodec};
use crate::core::packet::{seal, DatagramHeader, SubPacket, ZONE_PACKET_TYPE};
use crate::error::{ProtocolError, Result};
use crate::protocol::session::Session;
use crate::utils::time::unix_timestamp;

/// Room left for compressed bytes once header and trailer are accounted for.
pub const MAX_COMPRESSED_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE - BIT_COUNT_SIZE - CHECKSUM_SIZE;

/// A finished datagram ready for the socket.
#[derive(Debug, Clone)]
pub struct AssembledDatagram {
    pub bytes: Bytes,
    /// Server sequence stamped into this datagram
    pub sequence: u16,
    /// Number of leading sub-packets taken from the batch
    pub consumed: usize,
    /// Whether the key rotated after this datagram
    pub rotated: bool,
}

#[derive(Debug, Clone)]
pub struct OutboundPipeline {
    codec: BitCodec,
    max_subpackets: usize,
}

impl OutboundPipeline {
    pub fn new(codec: BitCodec) -> Self {
        Self::with_limit(codec, MAX_SUBPACKETS_PER_DATAGRAM)
    }

    /// Pipeline packing at most `max_subpackets` (clamped to 1..=10) per datagram.
    pub fn with_limit(codec: BitCodec, max_subpackets: usize) -> Self {
        Self {
            codec,
            max_subpackets: max_subpackets.clamp(1, MAX_SUBPACKETS_PER_DATAGRAM),
        }
    }

    pub fn max_subpackets(&self) -> usize {
        self.max_subpackets
    }

    /// Assemble one datagram from the front of `packets`.
    ///
    /// Sub-packets past `consumed` are left for the next datagram. If the packed
    /// region does not compress into the space left, fewer sub-packets are tried.
    #[instrument(level = "debug", skip_all, fields(client = %session.addr(), queued = packets.len()))]
    pub fn assemble(&self, session: &mut Session, packets: &[SubPacket]) -> Result<AssembledDatagram> {
        let mut limit = packets.len().min(self.max_subpackets);
        loop {
            match self.build(session, &packets[..limit]) {
                Ok((buf, consumed, zone)) => return Ok(self.finish(session, buf, consumed, zone)),
                Err(ProtocolError::CapacityExceeded { needed_bits, available_bits }) if limit > 1 => {
                    debug!(limit, needed_bits, available_bits, "Batch does not fit, retrying with fewer sub-packets");
                    limit -= 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build(&self, session: &Session, packets: &[SubPacket]) -> Result<(BytesMut, usize, bool)> {
        let sequence = session.last_server_sequence();

        let mut region = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
        let mut consumed = 0;
        let mut zone = false;
        for packet in packets {
            if HEADER_SIZE + region.len() + packet.frame_len() >= MAX_DATAGRAM_SIZE {
                break;
            }
            packet.encode_into(sequence, &mut region)?;
            zone |= packet.packet_type == ZONE_PACKET_TYPE;
            consumed += 1;
        }
        if HEADER_SIZE + region.len() < MAX_DATAGRAM_SIZE {
            region.put_u8(0);
        }

        let mut compressed = [0u8; MAX_COMPRESSED_SIZE];
        let bits = self.codec.compress(&region, &mut compressed)?;

        let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
        DatagramHeader {
            sequence,
            ack: session.last_client_sequence(),
            timestamp: unix_timestamp(),
        }
        .write(&mut buf);
        seal(&mut buf, &compressed[..compressed_size(bits)], bits);
        session.cipher().encrypt_packet(&mut buf, HEADER_SIZE);

        Ok((buf, consumed, zone))
    }

    fn finish(&self, session: &mut Session, buf: BytesMut, consumed: usize, zone: bool) -> AssembledDatagram {
        let sequence = session.last_server_sequence();
        let bytes = buf.freeze();
        session.record_sent(bytes.clone());

        if zone {
            session.rotate_key();
            debug!(seq = sequence, "Zone packet sent, session key rotated");
        }

        AssembledDatagram {
            bytes,
            sequence,
            consumed,
            rotated: zone,
        }
    }
}
