//! # Datagram Framing
//!
//! Byte layout of map datagrams and the sub-packets they carry.
//!
//! ## Datagram Layout
//! ```text
//! [Header(28)] [Compressed(N)] [BitCount(4, LE)] [MD5(16)]
//! ```
//! The header is never encrypted. Everything after it is encrypted in place by
//! [`Blowfish::encrypt_packet`](crate::core::blowfish::Blowfish::encrypt_packet).
//! The login datagram is the one exception: it carries raw sub-packets and no
//! bit count, but still ends with an MD5 over everything after the header.
//!
//! ## Sub-packet Layout
//! ```text
//! [TypeLo(1)] [TypeHi:1 | SizeUnits:7 (1)] [Sequence(2, LE)] [Payload...]
//! ```
//! The size field counts 4-byte units of the whole sub-packet, header included.
//! Readers take `byte1 & 0xFE` as a count of 2-byte units, which is the same
//! length. A zero size terminates the datagram.

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};

use crate::config::{BIT_COUNT_SIZE, CHECKSUM_SIZE, HEADER_SIZE};
use crate::core::codec::compressed_size;
use crate::error::{constants, ProtocolError, Result};

/// Size of a sub-packet header.
pub const SUBPACKET_HEADER_SIZE: usize = 4;

/// Largest sub-packet the 7-bit size field can describe.
pub const MAX_SUBPACKET_SIZE: usize = 0x7F * 4;

/// Largest payload that fits in one sub-packet.
pub const MAX_SUBPACKET_PAYLOAD: usize = MAX_SUBPACKET_SIZE - SUBPACKET_HEADER_SIZE;

/// Sub-packet type of the client login request.
pub const LOGIN_PACKET_TYPE: u16 = 0x00A;

/// Sub-packet type that triggers a key rotation when sent.
pub const ZONE_PACKET_TYPE: u16 = 0x00B;

/// Sub-packet types use 9 bits.
pub const PACKET_TYPE_MASK: u16 = 0x1FF;

/// Plaintext header at the start of every datagram.
///
/// Client datagrams carry their own sequence first and the last server sequence
/// they saw second. Server datagrams carry the same pair from the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatagramHeader {
    pub sequence: u16,
    pub ack: u16,
    pub timestamp: u32,
}

impl DatagramHeader {
    pub fn read(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < HEADER_SIZE {
            return Err(ProtocolError::InputTruncated {
                needed: HEADER_SIZE,
                available: datagram.len(),
            });
        }
        Ok(Self {
            sequence: u16::from_le_bytes([datagram[0], datagram[1]]),
            ack: u16::from_le_bytes([datagram[2], datagram[3]]),
            timestamp: u32::from_le_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]),
        })
    }

    /// Append the full 28-byte header. Unused bytes are zero.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.ack);
        buf.put_u32_le(0);
        buf.put_u32_le(self.timestamp);
        buf.put_bytes(0, HEADER_SIZE - 12);
    }
}

/// One application message inside a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubPacket {
    pub packet_type: u16,
    pub sequence: u16,
    pub payload: bytes::Bytes,
}

impl SubPacket {
    pub fn new(packet_type: u16, payload: impl Into<bytes::Bytes>) -> Self {
        Self {
            packet_type: packet_type & PACKET_TYPE_MASK,
            sequence: 0,
            payload: payload.into(),
        }
    }

    /// Framed length: header plus payload rounded up to 4 bytes.
    pub fn frame_len(&self) -> usize {
        (SUBPACKET_HEADER_SIZE + self.payload.len()).next_multiple_of(4)
    }

    /// Append this sub-packet stamped with `sequence`.
    pub fn encode_into(&self, sequence: u16, buf: &mut BytesMut) -> Result<()> {
        let total = self.frame_len();
        if total > MAX_SUBPACKET_SIZE {
            return Err(ProtocolError::OversizedPacket(self.payload.len()));
        }

        let units = (total / 4) as u8;
        buf.put_u8((self.packet_type & 0xFF) as u8);
        buf.put_u8((((self.packet_type >> 8) & 1) as u8) | (units << 1));
        buf.put_u16_le(sequence);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, total - SUBPACKET_HEADER_SIZE - self.payload.len());
        Ok(())
    }
}

/// Borrowed view of a sub-packet found by [`SubPackets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSubPacket<'a> {
    pub packet_type: u16,
    pub sequence: u16,
    /// Whole sub-packet including its 4-byte header.
    pub bytes: &'a [u8],
}

impl<'a> RawSubPacket<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[SUBPACKET_HEADER_SIZE.min(self.bytes.len())..]
    }

    pub fn to_owned(&self) -> SubPacket {
        SubPacket {
            packet_type: self.packet_type,
            sequence: self.sequence,
            payload: bytes::Bytes::copy_from_slice(self.payload()),
        }
    }
}

/// Why [`SubPackets`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxEnd {
    /// Still iterating.
    Running,
    /// Reached the end of the region or a zero-size terminator.
    Complete,
    /// A declared length ran past the region.
    Truncated { packet_type: u16, declared: usize, remaining: usize },
}

/// Iterator over the sub-packets of a decompressed region.
#[derive(Debug, Clone)]
pub struct SubPackets<'a> {
    data: &'a [u8],
    pos: usize,
    end: DemuxEnd,
}

impl<'a> SubPackets<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: DemuxEnd::Running,
        }
    }

    pub fn end(&self) -> DemuxEnd {
        self.end
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for SubPackets<'a> {
    type Item = RawSubPacket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end != DemuxEnd::Running {
            return None;
        }

        let remaining = self.data.len() - self.pos;
        if remaining < SUBPACKET_HEADER_SIZE {
            self.end = DemuxEnd::Complete;
            return None;
        }

        let head = &self.data[self.pos..];
        let declared = ((head[1] & 0xFE) as usize) * 2;
        if declared == 0 {
            self.end = DemuxEnd::Complete;
            return None;
        }

        let packet_type = u16::from_le_bytes([head[0], head[1]]) & PACKET_TYPE_MASK;
        let len = if declared <= remaining {
            declared
        } else if packet_type == LOGIN_PACKET_TYPE {
            remaining
        } else {
            self.end = DemuxEnd::Truncated {
                packet_type,
                declared,
                remaining,
            };
            return None;
        };

        let item = RawSubPacket {
            packet_type,
            sequence: u16::from_le_bytes([head[2], head[3]]),
            bytes: &head[..len],
        };
        self.pos += len;
        Some(item)
    }
}

pub fn md5_digest(parts: &[&[u8]]) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// True when the trailing 16 bytes are the MD5 of everything between the header
/// and the checksum.
pub fn verify_checksum(datagram: &[u8]) -> bool {
    if datagram.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return false;
    }
    let split = datagram.len() - CHECKSUM_SIZE;
    md5_digest(&[&datagram[HEADER_SIZE..split]]) == datagram[split..]
}

/// Split a decrypted datagram into its compressed region and bit count.
pub fn compressed_region(datagram: &[u8]) -> Result<(&[u8], u32)> {
    let trailer = BIT_COUNT_SIZE + CHECKSUM_SIZE;
    if datagram.len() < HEADER_SIZE + trailer {
        return Err(ProtocolError::InputTruncated {
            needed: HEADER_SIZE + trailer,
            available: datagram.len(),
        });
    }

    let count_at = datagram.len() - trailer;
    let bit_count = u32::from_le_bytes([
        datagram[count_at],
        datagram[count_at + 1],
        datagram[count_at + 2],
        datagram[count_at + 3],
    ]);
    let compressed = &datagram[HEADER_SIZE..count_at];
    if compressed_size(bit_count) != compressed.len() {
        return Err(ProtocolError::CorruptStream(format!(
            "{}: {} bits in {} bytes",
            constants::ERR_LENGTH_MISMATCH,
            bit_count,
            compressed.len()
        )));
    }
    Ok((compressed, bit_count))
}

/// Append the bit count and the MD5 over compressed bytes plus bit count.
pub fn seal(buf: &mut BytesMut, compressed: &[u8], bit_count: u32) {
    let count = bit_count.to_le_bytes();
    buf.put_slice(compressed);
    buf.put_slice(&count);
    buf.put_slice(&md5_digest(&[compressed, &count]));
}
