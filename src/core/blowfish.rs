//! # Session Cipher
//!
//! 16-round Blowfish with the key handling the game client expects.
//!
//! ## Key Derivation
//! - The session key is up to 20 bytes, zero padded, viewed as five LE words
//! - `hash = MD5(key)`, then every hash byte from the first zero byte onward is zeroed
//! - The 16 hash bytes are folded into the P-array with each byte **sign-extended**
//!   before it is shifted in, so bytes `>= 0x80` flood the upper bits of the word
//! - The standard Blowfish schedule then runs over an evolving zero block
//!
//! ## Block Layout
//! Blocks are two little-endian words, left half first. ECB helpers leave a
//! trailing partial block untouched; the packet helpers only touch an even
//! number of words after the datagram header.
//!
//! ## Rotation
//! [`Blowfish::increment_key`] adds 2 to key word 4 and rebuilds the schedule.
//! Rotation is always triggered by the caller.

use md5::{Digest, Md5};

use crate::core::blowfish_tables::{P_INIT, S_INIT};

/// Session key size in bytes.
pub const KEY_SIZE: usize = 20;

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 8;

const ROUNDS: usize = 16;
const P_WORDS: usize = ROUNDS + 2;
const HASH_SIZE: usize = 16;
const KEY_WORDS: usize = KEY_SIZE / 4;

/// Raw 20-byte session key.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Key from raw bytes. Input past 20 bytes is ignored, shorter input is zero padded.
    pub fn from_bytes(key: &[u8]) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        let len = key.len().min(KEY_SIZE);
        bytes[..len].copy_from_slice(&key[..len]);
        Self { bytes }
    }

    /// Key from the session-key string handed out at login.
    pub fn from_str_key(key: &str) -> Self {
        Self::from_bytes(key.as_bytes())
    }

    pub fn from_words(words: [u32; KEY_WORDS]) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self { bytes }
    }

    pub fn words(&self) -> [u32; KEY_WORDS] {
        let mut words = [0u32; KEY_WORDS];
        for (word, chunk) in words.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; KEY_SIZE] {
        &mut self.bytes
    }

    /// Inverse of [`CipherKey::from_str_key`]: trailing zero bytes are trimmed and
    /// an all-zero key becomes the empty string.
    pub fn to_key_string(&self) -> String {
        let len = self
            .bytes
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        String::from_utf8_lossy(&self.bytes[..len]).into_owned()
    }

    /// Key used after a zone transition.
    pub fn incremented(&self) -> Self {
        let mut words = self.words();
        words[KEY_WORDS - 1] = words[KEY_WORDS - 1].wrapping_add(2);
        Self::from_words(words)
    }

    /// MD5 of the key with everything from the first zero byte forced to zero.
    pub fn schedule_hash(&self) -> [u8; HASH_SIZE] {
        let digest = Md5::digest(self.bytes);
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&digest);
        if let Some(first_zero) = hash.iter().position(|&b| b == 0) {
            hash[first_zero..].fill(0);
        }
        hash
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("rotation_word", &self.words()[KEY_WORDS - 1])
            .finish_non_exhaustive()
    }
}

/// Keyed cipher schedule. Immutable except through [`Blowfish::increment_key`].
#[derive(Clone)]
pub struct Blowfish {
    key: CipherKey,
    p: [u32; P_WORDS],
    s: Box<[[u32; 256]; 4]>,
}

impl std::fmt::Debug for Blowfish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blowfish").field("key", &self.key).finish()
    }
}

impl Blowfish {
    pub fn new(key: CipherKey) -> Self {
        let mut cipher = Self::expand(&key.schedule_hash(), true);
        cipher.key = key;
        cipher
    }

    /// Run the key schedule over `material`.
    ///
    /// `sign_extend` selects the client's treatment of key bytes as signed chars.
    /// Plain Blowfish (`false`) is only used to check the round function against
    /// published vectors.
    fn expand(material: &[u8], sign_extend: bool) -> Self {
        let mut cipher = Self {
            key: CipherKey::default(),
            p: P_INIT,
            s: Box::new(S_INIT),
        };

        let mut j = 0;
        for word in cipher.p.iter_mut() {
            let mut data = 0u32;
            for _ in 0..4 {
                let byte = material[j];
                let lane = if sign_extend {
                    byte as i8 as i32 as u32
                } else {
                    u32::from(byte)
                };
                data = (data << 8) | lane;
                j = (j + 1) % material.len();
            }
            *word ^= data;
        }

        let (mut l, mut r) = (0u32, 0u32);
        for i in (0..P_WORDS).step_by(2) {
            (l, r) = cipher.encrypt_block(l, r);
            cipher.p[i] = l;
            cipher.p[i + 1] = r;
        }
        for sbox in 0..4 {
            for i in (0..256).step_by(2) {
                (l, r) = cipher.encrypt_block(l, r);
                cipher.s[sbox][i] = l;
                cipher.s[sbox][i + 1] = r;
            }
        }
        cipher
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    #[inline]
    fn round(&self, x: u32) -> u32 {
        let s = &self.s;
        let a = s[0][(x >> 24) as usize];
        let b = s[1][((x >> 16) & 0xFF) as usize];
        let c = s[2][((x >> 8) & 0xFF) as usize];
        let d = s[3][(x & 0xFF) as usize];
        (a.wrapping_add(b) ^ c).wrapping_add(d)
    }

    pub fn encrypt_block(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        for i in 0..ROUNDS {
            l ^= self.p[i];
            r ^= self.round(l);
            std::mem::swap(&mut l, &mut r);
        }
        std::mem::swap(&mut l, &mut r);
        r ^= self.p[ROUNDS];
        l ^= self.p[ROUNDS + 1];
        (l, r)
    }

    pub fn decrypt_block(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        for i in (2..P_WORDS).rev() {
            l ^= self.p[i];
            r ^= self.round(l);
            std::mem::swap(&mut l, &mut r);
        }
        std::mem::swap(&mut l, &mut r);
        r ^= self.p[1];
        l ^= self.p[0];
        (l, r)
    }

    fn apply_ecb(&self, buf: &mut [u8], encrypt: bool) {
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            let l = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
            let r = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
            let (l, r) = if encrypt {
                self.encrypt_block(l, r)
            } else {
                self.decrypt_block(l, r)
            };
            block[..4].copy_from_slice(&l.to_le_bytes());
            block[4..].copy_from_slice(&r.to_le_bytes());
        }
    }

    /// Encrypt whole 8-byte blocks in place. A trailing partial block is untouched.
    pub fn encrypt_ecb(&self, buf: &mut [u8]) {
        self.apply_ecb(buf, true);
    }

    pub fn decrypt_ecb(&self, buf: &mut [u8]) {
        self.apply_ecb(buf, false);
    }

    /// Length of the region after `header_size` that the packet helpers touch.
    pub fn packet_cipher_len(datagram_len: usize, header_size: usize) -> usize {
        if datagram_len <= header_size {
            return 0;
        }
        (((datagram_len - header_size) / 4) & !1) * 4
    }

    /// Encrypt everything after the header, an even number of words at a time.
    pub fn encrypt_packet(&self, datagram: &mut [u8], header_size: usize) {
        let len = Self::packet_cipher_len(datagram.len(), header_size);
        if len > 0 {
            self.encrypt_ecb(&mut datagram[header_size..header_size + len]);
        }
    }

    pub fn decrypt_packet(&self, datagram: &mut [u8], header_size: usize) {
        let len = Self::packet_cipher_len(datagram.len(), header_size);
        if len > 0 {
            self.decrypt_ecb(&mut datagram[header_size..header_size + len]);
        }
    }

    /// Rotate to the next zone key and rebuild the schedule.
    pub fn increment_key(&mut self) {
        *self = Self::new(self.key.incremented());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    const SESSION_KEY: &str = "1f0b1767829e1a0b";

    #[test]
    fn test_plain_blowfish_vector() {
        let cipher = Blowfish::expand(&[0u8; 8], false);
        assert_eq!(cipher.encrypt_block(0, 0), (0x4EF9_9745, 0x6198_DD78));
        assert_eq!(cipher.decrypt_block(0x4EF9_9745, 0x6198_DD78), (0, 0));
    }

    #[test]
    fn test_key_words() {
        let key = CipherKey::from_str_key(SESSION_KEY);
        assert_eq!(
            key.words(),
            [1647339057, 926299953, 1698247224, 1647337777, 0]
        );
        assert_eq!(key.to_key_string(), SESSION_KEY);
        assert_eq!(CipherKey::from_words(key.words()), key);
    }

    #[test]
    fn test_key_string_edges() {
        assert_eq!(CipherKey::default().to_key_string(), "");
        assert_eq!(CipherKey::from_str_key("test").words(), [1953719668, 0, 0, 0, 0]);
        let long = "12345678901234567890xyz";
        assert_eq!(CipherKey::from_str_key(long).to_key_string(), &long[..20]);
    }

    #[test]
    fn test_schedule_hash() {
        let key = CipherKey::from_str_key(SESSION_KEY);
        assert_eq!(hex(&key.schedule_hash()), "497295ff5318b707d9871d268fe223b6");
    }

    #[test]
    fn test_schedule_hash_truncates_after_zero() {
        // MD5 of this key is 213db59cf1e10e003bf2ea3df655b2a6
        let key = CipherKey::from_str_key("k0");
        assert_eq!(hex(&key.schedule_hash()), "213db59cf1e10e000000000000000000");
    }

    #[test]
    fn test_session_vectors() {
        let cipher = Blowfish::new(CipherKey::from_str_key(SESSION_KEY));
        let mut buf: Vec<u8> = (0..16).collect();
        cipher.encrypt_ecb(&mut buf);
        assert_eq!(hex(&buf), "d4d39058be909fa30cc689da360b5860");
        cipher.decrypt_ecb(&mut buf);
        assert_eq!(buf, (0..16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_sign_extension_matters() {
        let hash = CipherKey::from_str_key(SESSION_KEY).schedule_hash();
        let quirky = Blowfish::expand(&hash, true);
        let plain = Blowfish::expand(&hash, false);
        assert_ne!(quirky.encrypt_block(0, 0), plain.encrypt_block(0, 0));
    }

    #[test]
    fn test_increment_key() {
        let mut cipher = Blowfish::new(CipherKey::from_str_key(SESSION_KEY));
        let before = cipher.key().words();
        cipher.increment_key();
        let after = cipher.key().words();
        assert_eq!(after[4], before[4] + 2);
        assert_eq!(after[..4], before[..4]);

        let mut buf: Vec<u8> = (0..16).collect();
        cipher.encrypt_ecb(&mut buf);
        assert_eq!(hex(&buf), "3e96d6958d221b9622e5d61de086fed7");
    }

    #[test]
    fn test_increment_key_wraps() {
        let key = CipherKey::from_words([0, 0, 0, 0, u32::MAX]);
        assert_eq!(key.incremented().words()[4], 1);
    }

    #[test]
    fn test_ecb_leaves_partial_block() {
        let cipher = Blowfish::new(CipherKey::from_str_key(SESSION_KEY));
        let mut buf = [7u8; 13];
        cipher.encrypt_ecb(&mut buf);
        assert_eq!(&buf[8..], &[7u8; 5]);
        assert_ne!(&buf[..8], &[7u8; 8]);
    }

    #[test]
    fn test_packet_region() {
        assert_eq!(Blowfish::packet_cipher_len(28, 28), 0);
        assert_eq!(Blowfish::packet_cipher_len(20, 28), 0);
        assert_eq!(Blowfish::packet_cipher_len(48, 28), 16);
        assert_eq!(Blowfish::packet_cipher_len(52, 28), 24);
        assert_eq!(Blowfish::packet_cipher_len(55, 28), 24);
    }

    #[test]
    fn test_packet_vector() {
        let cipher = Blowfish::new(CipherKey::from_str_key(SESSION_KEY));
        let mut datagram: Vec<u8> = (0..48).collect();
        cipher.encrypt_packet(&mut datagram, 28);
        assert_eq!(
            hex(&datagram),
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b\
             45cd26e2123fa8201b5792a548b0cba32c2d2e2f"
        );
        cipher.decrypt_packet(&mut datagram, 28);
        assert_eq!(datagram, (0..48).collect::<Vec<u8>>());
    }

    #[test]
    fn test_short_packet_untouched() {
        let cipher = Blowfish::new(CipherKey::from_str_key(SESSION_KEY));
        let mut datagram = [9u8; 30];
        cipher.encrypt_packet(&mut datagram, 28);
        assert_eq!(datagram, [9u8; 30]);
    }
}
