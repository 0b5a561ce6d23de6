//! # Login Datagrams
//!
//! The first datagram of a session is sent before the client has a key. It is
//! neither encrypted nor compressed:
//!
//! ```text
//! [Header(28)] [Login sub-packet(0x5C)] [more sub-packets...] [MD5(16)]
//! ```
//!
//! Inside the login sub-packet:
//! - offset 2: the client's sync value, used to restart sequencing
//! - offset 4: a byte-sum of bytes 8..0x5C
//! - offset 12: the character id

use bytes::BytesMut;

use crate::config::{CHECKSUM_SIZE, HEADER_SIZE};
use crate::core::packet::{md5_digest, verify_checksum, DatagramHeader, LOGIN_PACKET_TYPE, PACKET_TYPE_MASK};
use crate::error::{constants, ProtocolError, Result};

/// Minimum size of the login sub-packet.
pub const LOGIN_PACKET_SIZE: usize = 0x5C;

const SUM_OFFSET: usize = 4;
const SUM_START: usize = 8;
const CHARACTER_ID_OFFSET: usize = 12;

/// Sync values above this restart the session's sequence counters.
pub const RESYNC_THRESHOLD: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginRequest {
    pub header: DatagramHeader,
    pub character_id: u32,
    pub sync: u16,
}

impl LoginRequest {
    /// Recognise a plaintext login datagram.
    ///
    /// `Ok(None)` means the checksum does not hold over the raw bytes, so the
    /// datagram is assumed to be encrypted. A datagram that passes the checksum
    /// but is not a valid login is an error.
    pub fn parse(datagram: &[u8]) -> Result<Option<Self>> {
        if !verify_checksum(datagram) {
            return Ok(None);
        }

        let body = &datagram[HEADER_SIZE..datagram.len() - CHECKSUM_SIZE];
        if body.len() < 2 {
            return Err(ProtocolError::MalformedSubPacket(constants::ERR_NOT_LOGIN.to_string()));
        }
        let packet_type = u16::from_le_bytes([body[0], body[1]]) & PACKET_TYPE_MASK;
        if packet_type != LOGIN_PACKET_TYPE {
            return Err(ProtocolError::MalformedSubPacket(format!(
                "{} (type {packet_type:#05x})",
                constants::ERR_NOT_LOGIN
            )));
        }
        if body.len() < LOGIN_PACKET_SIZE {
            return Err(ProtocolError::InputTruncated {
                needed: LOGIN_PACKET_SIZE,
                available: body.len(),
            });
        }

        let sum = body[SUM_START..LOGIN_PACKET_SIZE]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != body[SUM_OFFSET] {
            return Err(ProtocolError::ChecksumMismatch);
        }

        let id = &body[CHARACTER_ID_OFFSET..CHARACTER_ID_OFFSET + 4];
        Ok(Some(Self {
            header: DatagramHeader::read(datagram)?,
            character_id: u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
            sync: u16::from_le_bytes([body[2], body[3]]),
        }))
    }

    pub fn wants_resync(&self) -> bool {
        self.sync > RESYNC_THRESHOLD
    }

    /// Sub-packet bytes of a login datagram, without header or checksum.
    pub fn body(datagram: &[u8]) -> &[u8] {
        let end = datagram.len().saturating_sub(CHECKSUM_SIZE);
        datagram.get(HEADER_SIZE..end).unwrap_or(&[])
    }
}

/// Build a plaintext login datagram, as the client would.
pub fn build_login_datagram(
    character_id: u32,
    sync: u16,
    client_sequence: u16,
    extra: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    DatagramHeader {
        sequence: client_sequence,
        ack: 0,
        timestamp: 0,
    }
    .write(&mut buf);

    let mut login = [0u8; LOGIN_PACKET_SIZE];
    login[0] = LOGIN_PACKET_TYPE as u8;
    login[1] = ((LOGIN_PACKET_SIZE / 4) as u8) << 1;
    login[2..4].copy_from_slice(&sync.to_le_bytes());
    login[CHARACTER_ID_OFFSET..CHARACTER_ID_OFFSET + 4].copy_from_slice(&character_id.to_le_bytes());
    login[SUM_OFFSET] = login[SUM_START..]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));

    buf.extend_from_slice(&login);
    buf.extend_from_slice(extra);
    let digest = md5_digest(&[&buf[HEADER_SIZE..]]);
    buf.extend_from_slice(&digest);
    buf.to_vec()
}
