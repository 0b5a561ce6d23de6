//! # Protocol Layer
//!
//! Session state and the two datagram pipelines built on top of [`crate::core`].
//!
//! ## Components
//! - **Session**: Cipher pair, sequence counters, resend slot, rotation state
//! - **Login**: Recognition and validation of the plaintext login datagram
//! - **Inbound**: Decrypt, verify, decompress, demultiplex
//! - **Outbound**: Pack, compress, checksum, encrypt, rotate
//!
//! The pipelines operate on a `&mut Session` and never touch sockets, so the
//! caller decides how sessions are locked and when bytes hit the wire.

pub mod inbound;
pub mod login;
pub mod outbound;
pub mod session;

pub use inbound::{InboundKind, InboundPipeline, InboundResult};
pub use login::LoginRequest;
pub use outbound::{AssembledDatagram, OutboundPipeline};
pub use session::{
    ByteOffsetAdjustment, DecryptOutcome, KeyAdjustment, NoAdjustment, Session,
    SessionKeyMaterial, SessionKeyProvider, SessionStatus, StaticKeyProvider,
};
