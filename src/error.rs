//! # Error Types
//!
//! Error handling for the map transport.
//!
//! Every failure the router can hit is a variant of [`ProtocolError`]. Variants are
//! grouped into coarse categories through [`ProtocolError::category`] so the receive
//! loop can decide what to do with them without matching every case.
//!
//! ## Error Categories
//! - **Configuration**: bad resource tables or config values, fatal at startup
//! - **Decode**: corrupt or truncated bitstreams, the datagram is dropped
//! - **Crypto**: decrypt + checksum mismatch under every available key
//! - **Protocol**: malformed sub-packet framing or unknown sessions
//! - **Capacity**: compression output would overflow its destination
//! - **Io / External**: socket failures and bus or key-provider errors
//!
//! Per-datagram errors never leave the session that produced them.
//!
//! ## Example Usage
//! ```rust
//! use map_router::error::{ErrorCategory, ProtocolError};
//!
//! let err = ProtocolError::CorruptStream("missing child".into());
//! assert_eq!(err.category(), ErrorCategory::Decode);
//! assert!(!err.is_fatal());
//! ```

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Static error messages shared by several call sites.
pub mod constants {
    /// Codec errors
    pub const ERR_EMPTY_INPUT: &str = "Compressed input is empty";
    pub const ERR_SHORT_BIT_COUNT: &str = "Bit count shorter than the header byte";
    pub const ERR_MISSING_CHILD: &str = "Decode trie has no child for the selected bit";

    /// Table loading errors
    pub const ERR_TABLE_LENGTH: &str = "Resource length is not a multiple of 4";
    pub const ERR_EMPTY_DECODE_TABLE: &str = "Decode table is empty";
    pub const ERR_MISSING_ROOT: &str = "Decode table root is not a pointer";

    /// Datagram errors
    pub const ERR_LENGTH_MISMATCH: &str = "Compressed length does not match bit count";

    /// Session errors
    pub const ERR_NOT_LOGIN: &str = "First sub-packet is not a login request";
}

/// Coarse classification used by callers to decide between dropping and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Decode,
    Crypto,
    Protocol,
    Capacity,
    Io,
    External,
}

// ProtocolError is the primary error type for all router operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid compressed header")]
    InvalidHeader,

    #[error("Corrupt compressed stream: {0}")]
    CorruptStream(String),

    #[error("Input truncated: needed {needed} bytes, got {available}")]
    InputTruncated { needed: usize, available: usize },

    #[error("Insufficient space: needed {needed_bits} bits, have {available_bits}")]
    CapacityExceeded {
        needed_bits: usize,
        available_bits: usize,
    },

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("No session for {0}")]
    SessionNotFound(SocketAddr),

    #[error("Malformed sub-packet: {0}")]
    MalformedSubPacket(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Bus error: {0}")]
    BusError(String),

    #[error("Key provider error: {0}")]
    KeyProviderError(String),
}

impl ProtocolError {
    /// Map this error onto its handling category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::ConfigError(_) => ErrorCategory::Configuration,
            ProtocolError::InvalidHeader
            | ProtocolError::CorruptStream(_)
            | ProtocolError::InputTruncated { .. } => ErrorCategory::Decode,
            ProtocolError::DecryptionFailure | ProtocolError::ChecksumMismatch => {
                ErrorCategory::Crypto
            }
            ProtocolError::SessionNotFound(_)
            | ProtocolError::MalformedSubPacket(_)
            | ProtocolError::OversizedPacket(_) => ErrorCategory::Protocol,
            ProtocolError::CapacityExceeded { .. } => ErrorCategory::Capacity,
            ProtocolError::Io(_) => ErrorCategory::Io,
            ProtocolError::Serialization(_)
            | ProtocolError::Json(_)
            | ProtocolError::BusError(_)
            | ProtocolError::KeyProviderError(_) => ErrorCategory::External,
        }
    }

    /// Only configuration problems should stop the process.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            ProtocolError::ConfigError("x".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ProtocolError::InvalidHeader.category(), ErrorCategory::Decode);
        assert_eq!(
            ProtocolError::ChecksumMismatch.category(),
            ErrorCategory::Crypto
        );
        assert_eq!(
            ProtocolError::CapacityExceeded {
                needed_bits: 10,
                available_bits: 8
            }
            .category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            ProtocolError::MalformedSubPacket("short".into()).category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn test_collaborator_failures_are_external() {
        assert_eq!(
            ProtocolError::KeyProviderError("unknown character".into()).category(),
            ErrorCategory::External
        );
        assert_eq!(ProtocolError::BusError("closed".into()).category(), ErrorCategory::External);
        let json: ProtocolError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(json.category(), ErrorCategory::External);
    }

    #[test]
    fn test_only_config_is_fatal() {
        assert!(ProtocolError::ConfigError("bad table".into()).is_fatal());
        assert!(!ProtocolError::DecryptionFailure.is_fatal());
        assert!(!ProtocolError::Io(io::Error::other("boom")).is_fatal());
    }

    #[test]
    fn test_display_includes_sizes() {
        let err = ProtocolError::InputTruncated {
            needed: 12,
            available: 4,
        };
        assert_eq!(err.to_string(), "Input truncated: needed 12 bytes, got 4");
    }
}
