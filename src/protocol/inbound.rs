//! # Inbound Pipeline
//!
//! Turns one client datagram into the sub-packets that should reach game logic.
//!
//! ## Steps
//! 1. Decrypt with the session cipher, falling back to the previous key while a
//!    rotation is pending, and verify the MD5 trailer
//! 2. Check the bit count against the compressed length and decompress into a
//!    4096-byte scratch buffer
//! 3. Demultiplex sub-packets and apply the sequence window
//! 4. Advance the session's client sequence and look for a lagging ack
//!
//! Login datagrams skip steps 1 and 2; see [`InboundPipeline::process_login`].
//! Any error leaves the session untouched apart from the decrypt state machine.

use bytes::Bytes;
use tracing::{debug, instrument, trace};

use crate::config::{CHECKSUM_SIZE, HEADER_SIZE, MAX_DATAGRAM_SIZE};
use crate::core::codec::BitCodec;
use crate::core::packet::{
    compressed_region, DatagramHeader, DemuxEnd, SubPacket, SubPackets, LOGIN_PACKET_TYPE,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::login::LoginRequest;
use crate::protocol::session::{DecryptOutcome, Session};
use crate::utils::buffer_pool::BufferPool;

/// How a datagram got past the cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Login,
    Decrypted(DecryptOutcome),
}

/// Everything the router needs after one inbound datagram.
#[derive(Debug)]
pub struct InboundResult {
    pub header: DatagramHeader,
    pub kind: InboundKind,
    /// Accepted sub-packets in datagram order
    pub packets: Vec<SubPacket>,
    /// Sub-packets dropped by the sequence window
    pub skipped: usize,
    pub end: DemuxEnd,
    /// Last sent datagram, when the client's ack shows it was lost
    pub resend: Option<Bytes>,
}

#[derive(Clone)]
pub struct InboundPipeline {
    codec: BitCodec,
    scratch: BufferPool,
}

impl InboundPipeline {
    pub fn new(codec: BitCodec) -> Self {
        Self {
            codec,
            scratch: BufferPool::new(16, MAX_DATAGRAM_SIZE),
        }
    }

    pub fn codec(&self) -> &BitCodec {
        &self.codec
    }

    /// Demultiplex the raw sub-packets of a validated login datagram.
    #[instrument(level = "debug", skip_all, fields(client = %session.addr(), character = login.character_id))]
    pub fn process_login(
        &self,
        session: &mut Session,
        datagram: &[u8],
        login: &LoginRequest,
    ) -> InboundResult {
        let (packets, skipped, end) =
            Self::demux(session, login.header.sequence, LoginRequest::body(datagram));
        session.touch();

        InboundResult {
            header: login.header,
            kind: InboundKind::Login,
            packets,
            skipped,
            end,
            resend: None,
        }
    }

    /// Decrypt, verify, decompress and demultiplex an encrypted datagram.
    #[instrument(level = "debug", skip_all, fields(client = %session.addr(), len = datagram.len()))]
    pub fn process(&self, session: &mut Session, datagram: &mut [u8]) -> Result<InboundResult> {
        if datagram.len() <= HEADER_SIZE + CHECKSUM_SIZE {
            return Err(ProtocolError::InputTruncated {
                needed: HEADER_SIZE + CHECKSUM_SIZE + 1,
                available: datagram.len(),
            });
        }

        let outcome = session.decrypt(datagram)?;
        let header = DatagramHeader::read(datagram)?;
        let (compressed, bit_count) = compressed_region(datagram)?;

        let mut scratch = self.scratch.acquire();
        let len = self.codec.decompress(compressed, bit_count, &mut scratch)?;
        trace!(bit_count, decompressed = len, "Payload decompressed");

        let (packets, skipped, end) = Self::demux(session, header.sequence, &scratch[..len]);
        session.touch();

        Ok(InboundResult {
            header,
            kind: InboundKind::Decrypted(outcome),
            packets,
            skipped,
            end,
            resend: session.resend_for_ack(header.ack),
        })
    }

    fn demux(
        session: &mut Session,
        header_sequence: u16,
        region: &[u8],
    ) -> (Vec<SubPacket>, usize, DemuxEnd) {
        let mut packets = Vec::new();
        let mut skipped = 0;

        let mut iter = SubPackets::new(region);
        for raw in iter.by_ref() {
            if raw.packet_type == LOGIN_PACKET_TYPE
                || session.in_window(raw.sequence, header_sequence)
            {
                packets.push(raw.to_owned());
            } else {
                debug!(
                    packet_type = raw.packet_type,
                    seq = raw.sequence,
                    last = session.last_client_sequence(),
                    header_seq = header_sequence,
                    "Sub-packet outside sequence window"
                );
                skipped += 1;
            }
        }

        let end = iter.end();
        if let DemuxEnd::Truncated {
            packet_type,
            declared,
            remaining,
        } = end
        {
            debug!(packet_type, declared, remaining, "Sub-packet overruns datagram, parsing stopped");
        }

        if !packets.is_empty() {
            session.advance_client_sequence(header_sequence);
        }
        (packets, skipped, end)
    }
}
