//! # Core Protocol Components
//!
//! Stateless building blocks of the map transport.
//!
//! ## Components
//! - **Tables**: Compression resource files and the decode trie built from them
//! - **Codec**: Table-driven bit compression of datagram payloads
//! - **Blowfish**: The session cipher with its key schedule and packet helpers
//! - **Packet**: Datagram header, sub-packet framing and checksums
//!
//! Nothing in this module knows about sessions or sockets. Every type here is
//! either immutable after construction or owned by exactly one session.

pub mod blowfish;
mod blowfish_tables;
pub mod codec;
pub mod packet;
pub mod tables;
