//! # Sessions
//!
//! Per-client protocol state: the cipher pair, sequence counters, the resend
//! slot and the rotation state machine.
//!
//! ## Status Transitions
//! ```text
//! Waiting --send--> Sent --decrypt--> Accepted --zone packet sent--> PendingZone
//!    ^                                                                  |
//!    +----------- login while pending / current-key decrypt ------------+
//! ```
//! A current-key decrypt while `PendingZone` completes the rotation: the old
//! cipher is dropped and the session is `Accepted` again. A previous-key
//! decrypt keeps the session in `PendingZone`.
//!
//! ## Key Material
//! Keys come from a [`SessionKeyProvider`] at session creation. A
//! [`KeyAdjustment`] may tweak the key of a character's first login before the
//! cipher is built.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;

use crate::config::{KeyAdjustmentConfig, HEADER_SIZE};
use crate::core::blowfish::{Blowfish, CipherKey, KEY_SIZE};
use crate::core::packet::verify_checksum;
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, nothing sent yet
    Waiting,
    /// At least one datagram sent, nothing decrypted yet
    Sent,
    /// Client traffic decrypts under the current key
    Accepted,
    /// Key rotated, client may still use the previous key
    PendingZone,
}

/// How an encrypted datagram was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptOutcome {
    Accepted,
    /// Decrypted only by the pre-rotation key
    AcceptedUnderPreviousKey,
}

/// The single datagram kept for retransmission.
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub sequence: u16,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub struct Session {
    addr: SocketAddr,
    character_id: u32,
    current: Blowfish,
    previous: Option<Blowfish>,
    status: SessionStatus,
    last_client_sequence: u16,
    last_server_sequence: u16,
    last_sent: Option<SentDatagram>,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(addr: SocketAddr, character_id: u32, key: CipherKey) -> Self {
        let now = Instant::now();
        Self {
            addr,
            character_id,
            current: Blowfish::new(key),
            previous: None,
            status: SessionStatus::Waiting,
            last_client_sequence: 0,
            last_server_sequence: 0,
            last_sent: None,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn character_id(&self) -> u32 {
        self.character_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn cipher(&self) -> &Blowfish {
        &self.current
    }

    pub fn previous_cipher(&self) -> Option<&Blowfish> {
        self.previous.as_ref()
    }

    pub fn last_client_sequence(&self) -> u16 {
        self.last_client_sequence
    }

    pub fn last_server_sequence(&self) -> u16 {
        self.last_server_sequence
    }

    pub fn last_sent(&self) -> Option<&SentDatagram> {
        self.last_sent.as_ref()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Decrypt `datagram` in place and verify its checksum.
    ///
    /// On failure under every key the buffer holds garbage and must be dropped.
    pub fn decrypt(&mut self, datagram: &mut [u8]) -> Result<DecryptOutcome> {
        if datagram.len() <= HEADER_SIZE {
            return Err(ProtocolError::InputTruncated {
                needed: HEADER_SIZE + 1,
                available: datagram.len(),
            });
        }

        let backup = match (&self.previous, self.status) {
            (Some(_), SessionStatus::PendingZone) => Some(datagram.to_vec()),
            _ => None,
        };

        self.current.decrypt_packet(datagram, HEADER_SIZE);
        if verify_checksum(datagram) {
            self.previous = None;
            self.status = SessionStatus::Accepted;
            return Ok(DecryptOutcome::Accepted);
        }

        if let (Some(previous), Some(mut backup)) = (&self.previous, backup) {
            previous.decrypt_packet(&mut backup, HEADER_SIZE);
            if verify_checksum(&backup) {
                datagram.copy_from_slice(&backup);
                return Ok(DecryptOutcome::AcceptedUnderPreviousKey);
            }
        }

        Err(ProtocolError::DecryptionFailure)
    }

    /// Move to the next key. The old cipher stays until the client confirms.
    pub fn rotate_key(&mut self) {
        self.previous = Some(self.current.clone());
        self.current.increment_key();
        self.status = SessionStatus::PendingZone;
    }

    /// Record a transmitted datagram stamped with the current server sequence.
    pub fn record_sent(&mut self, bytes: Bytes) {
        self.last_sent = Some(SentDatagram {
            sequence: self.last_server_sequence,
            bytes,
        });
        if self.status == SessionStatus::Waiting {
            self.status = SessionStatus::Sent;
        }
        self.last_server_sequence = self.last_server_sequence.wrapping_add(1);
    }

    /// Restart sequencing after a login that carries a sync value.
    pub fn resync(&mut self, client_sequence: u16) {
        self.last_server_sequence = 0;
        self.last_client_sequence = client_sequence;
    }

    /// A repeated login abandons any rotation still waiting for the client.
    pub fn restart_login(&mut self) {
        if self.status == SessionStatus::PendingZone {
            self.previous = None;
            self.status = SessionStatus::Waiting;
        }
    }

    /// Inclusive upper bound check for the de-duplication window.
    pub fn in_window(&self, sequence: u16, header_sequence: u16) -> bool {
        sequence > self.last_client_sequence && sequence <= header_sequence
    }

    /// Advance the client sequence. Never moves backwards.
    pub fn advance_client_sequence(&mut self, header_sequence: u16) {
        self.last_client_sequence = self.last_client_sequence.max(header_sequence);
    }

    /// The last datagram, if the client's ack shows it never arrived.
    pub fn resend_for_ack(&self, ack: u16) -> Option<Bytes> {
        self.last_sent
            .as_ref()
            .filter(|sent| ack < sent.sequence)
            .map(|sent| sent.bytes.clone())
    }
}

/// Key material bound to a character by the login servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeyMaterial {
    pub key: CipherKey,
    /// First login since the character was created
    pub first_login: bool,
}

impl SessionKeyMaterial {
    pub fn new(key: CipherKey) -> Self {
        Self {
            key,
            first_login: false,
        }
    }
}

/// Resolves the session key for a character at login.
pub trait SessionKeyProvider: Send + Sync {
    fn session_key(&self, character_id: u32) -> Result<SessionKeyMaterial>;
}

/// In-memory key store, filled by whatever talks to the login servers.
#[derive(Debug, Default)]
pub struct StaticKeyProvider {
    keys: RwLock<HashMap<u32, SessionKeyMaterial>>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, character_id: u32, material: SessionKeyMaterial) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(character_id, material);
        }
    }

    pub fn remove(&self, character_id: u32) -> Option<SessionKeyMaterial> {
        self.keys.write().ok()?.remove(&character_id)
    }

    pub fn len(&self) -> usize {
        self.keys.read().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a key file:
    ///
    /// ```toml
    /// [[keys]]
    /// character_id = 21828
    /// key = "session key"
    /// first_login = false
    /// ```
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: KeyFile = toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse key file: {e}")))?;

        let provider = Self::new();
        for entry in file.keys {
            provider.insert(
                entry.character_id,
                SessionKeyMaterial {
                    key: CipherKey::from_str_key(&entry.key),
                    first_login: entry.first_login,
                },
            );
        }
        Ok(provider)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read key file: {e}")))?;
        Self::from_toml(&content)
    }
}

#[derive(Deserialize)]
struct KeyFile {
    #[serde(default)]
    keys: Vec<KeyFileEntry>,
}

#[derive(Deserialize)]
struct KeyFileEntry {
    character_id: u32,
    key: String,
    #[serde(default)]
    first_login: bool,
}

impl SessionKeyProvider for StaticKeyProvider {
    fn session_key(&self, character_id: u32) -> Result<SessionKeyMaterial> {
        let keys = self
            .keys
            .read()
            .map_err(|_| ProtocolError::KeyProviderError("key store poisoned".to_string()))?;
        keys.get(&character_id).copied().ok_or_else(|| {
            ProtocolError::KeyProviderError(format!("no session key for character {character_id}"))
        })
    }
}

/// Hook applied to the key bytes before the first cipher is built.
pub trait KeyAdjustment: Send + Sync {
    fn adjust(&self, key: &mut [u8; KEY_SIZE], material: &SessionKeyMaterial);
}

/// Leaves every key untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdjustment;

impl KeyAdjustment for NoAdjustment {
    fn adjust(&self, _key: &mut [u8; KEY_SIZE], _material: &SessionKeyMaterial) {}
}

/// Adds `delta` to one key byte on a character's first login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteOffsetAdjustment {
    pub index: usize,
    pub delta: u8,
}

impl From<KeyAdjustmentConfig> for ByteOffsetAdjustment {
    fn from(config: KeyAdjustmentConfig) -> Self {
        Self {
            index: config.index,
            delta: config.delta,
        }
    }
}

impl KeyAdjustment for ByteOffsetAdjustment {
    fn adjust(&self, key: &mut [u8; KEY_SIZE], material: &SessionKeyMaterial) {
        if !material.first_login {
            return;
        }
        if let Some(byte) = key.get_mut(self.index) {
            *byte = byte.wrapping_add(self.delta);
        }
    }
}

/// Final key for a new session.
pub fn session_cipher_key(material: &SessionKeyMaterial, adjustment: &dyn KeyAdjustment) -> CipherKey {
    let mut key = material.key;
    adjustment.adjust(key.as_bytes_mut(), material);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHECKSUM_SIZE;
    use crate::core::packet::md5_digest;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    /// A 28-byte header, 16 payload bytes and a valid checksum, encrypted under `cipher`.
    fn sealed(cipher: &Blowfish, fill: u8) -> Vec<u8> {
        let mut datagram = vec![0u8; HEADER_SIZE];
        let payload = [fill; 16];
        datagram.extend_from_slice(&payload);
        datagram.extend_from_slice(&md5_digest(&[&payload]));
        assert_eq!(datagram.len(), HEADER_SIZE + 16 + CHECKSUM_SIZE);
        cipher.encrypt_packet(&mut datagram, HEADER_SIZE);
        datagram
    }

    #[test]
    fn test_first_decrypt_accepts() {
        let key = CipherKey::from_str_key("session-key");
        let mut session = Session::new(addr(), 7, key);
        assert_eq!(session.status(), SessionStatus::Waiting);

        let mut datagram = sealed(&Blowfish::new(key), 0x11);
        assert_eq!(session.decrypt(&mut datagram).unwrap(), DecryptOutcome::Accepted);
        assert_eq!(session.status(), SessionStatus::Accepted);
        assert_eq!(&datagram[HEADER_SIZE..HEADER_SIZE + 16], &[0x11; 16]);
    }

    #[test]
    fn test_previous_key_fallback() {
        let key = CipherKey::from_str_key("session-key");
        let mut session = Session::new(addr(), 7, key);
        session.rotate_key();
        assert_eq!(session.status(), SessionStatus::PendingZone);
        assert_eq!(session.cipher().key(), &key.incremented());

        let mut old = sealed(&Blowfish::new(key), 0x22);
        assert_eq!(
            session.decrypt(&mut old).unwrap(),
            DecryptOutcome::AcceptedUnderPreviousKey
        );
        assert_eq!(&old[HEADER_SIZE..HEADER_SIZE + 16], &[0x22; 16]);
        assert_eq!(session.status(), SessionStatus::PendingZone);

        let mut new = sealed(&Blowfish::new(key.incremented()), 0x33);
        assert_eq!(session.decrypt(&mut new).unwrap(), DecryptOutcome::Accepted);
        assert_eq!(session.status(), SessionStatus::Accepted);
        assert!(session.previous_cipher().is_none());

        // rotation complete, the old key is gone
        let mut old = sealed(&Blowfish::new(key), 0x44);
        assert!(matches!(
            session.decrypt(&mut old),
            Err(ProtocolError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut session = Session::new(addr(), 1, CipherKey::from_str_key("right"));
        let mut datagram = sealed(&Blowfish::new(CipherKey::from_str_key("wrong")), 1);
        assert!(matches!(
            session.decrypt(&mut datagram),
            Err(ProtocolError::DecryptionFailure)
        ));
        assert_eq!(session.status(), SessionStatus::Waiting);
    }

    #[test]
    fn test_sent_and_resend() {
        let mut session = Session::new(addr(), 1, CipherKey::default());
        session.record_sent(Bytes::from_static(b"first"));
        assert_eq!(session.status(), SessionStatus::Sent);
        assert_eq!(session.last_server_sequence(), 1);
        session.record_sent(Bytes::from_static(b"second"));
        assert_eq!(session.last_sent().unwrap().sequence, 1);

        assert_eq!(session.resend_for_ack(0).as_deref(), Some(&b"second"[..]));
        assert!(session.resend_for_ack(1).is_none());
        assert!(session.resend_for_ack(5).is_none());
    }

    #[test]
    fn test_window_and_advance() {
        let mut session = Session::new(addr(), 1, CipherKey::default());
        session.resync(10);
        assert!(!session.in_window(10, 12));
        assert!(session.in_window(11, 12));
        assert!(session.in_window(12, 12));
        assert!(!session.in_window(13, 12));

        session.advance_client_sequence(12);
        session.advance_client_sequence(3);
        assert_eq!(session.last_client_sequence(), 12);
    }

    #[test]
    fn test_login_clears_rotation() {
        let mut session = Session::new(addr(), 1, CipherKey::default());
        session.rotate_key();
        session.restart_login();
        assert_eq!(session.status(), SessionStatus::Waiting);
        assert!(session.previous_cipher().is_none());
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticKeyProvider::new();
        assert!(provider.session_key(5).is_err());

        let material = SessionKeyMaterial::new(CipherKey::from_str_key("abc"));
        provider.insert(5, material);
        assert_eq!(provider.session_key(5).unwrap(), material);
        assert_eq!(provider.len(), 1);
        assert_eq!(provider.remove(5), Some(material));
        assert!(provider.is_empty());
    }

    #[test]
    fn test_byte_offset_adjustment() {
        let adjust = ByteOffsetAdjustment { index: 16, delta: 6 };
        let mut material = SessionKeyMaterial::new(CipherKey::from_bytes(&[0xFE; 20]));

        assert_eq!(session_cipher_key(&material, &adjust), material.key);

        material.first_login = true;
        let key = session_cipher_key(&material, &adjust);
        assert_eq!(key.as_bytes()[16], 0x04);
        assert_eq!(key.as_bytes()[15], 0xFE);

        assert_eq!(session_cipher_key(&material, &NoAdjustment), material.key);
    }

    #[test]
    fn test_key_file() {
        let provider = StaticKeyProvider::from_toml(
            r#"
            [[keys]]
            character_id = 1
            key = "alpha"

            [[keys]]
            character_id = 2
            key = "beta"
            first_login = true
            "#,
        )
        .unwrap();
        assert_eq!(provider.len(), 2);
        let beta = provider.session_key(2).unwrap();
        assert!(beta.first_login);
        assert_eq!(beta.key.to_key_string(), "beta");
        assert!(!provider.session_key(1).unwrap().first_login);

        assert!(StaticKeyProvider::from_toml("keys = 5").is_err());
        assert!(StaticKeyProvider::from_toml("").unwrap().is_empty());
    }
}
