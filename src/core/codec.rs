//! # Bit Codec
//!
//! Table-driven byte to bitstream transform used for every map datagram payload.
//!
//! ## Stream Format
//! ```text
//! [0x01] [bits...]
//! ```
//! The leading byte is always `1`. Each input byte contributes its code from the
//! [`EncodeTable`](crate::core::tables::EncodeTable), written LSB-first at a running
//! bit cursor. The reported bit count includes the 8 header bits.
//!
//! Decoding walks the [`DecodeTrie`] one bit at a time and restarts at the root
//! after every emitted byte.
//!
//! ## Example
//! ```rust
//! use map_router::core::codec::{compressed_size, BitCodec};
//! use map_router::core::tables::TableBuilder;
//!
//! let codec = BitCodec::new(TableBuilder::new().build().unwrap());
//! let mut packed = [0u8; 64];
//! let bits = codec.compress(b"hello", &mut packed).unwrap();
//!
//! let mut out = [0u8; 5];
//! let n = codec
//!     .decompress(&packed[..compressed_size(bits)], bits, &mut out)
//!     .unwrap();
//! assert_eq!(&out[..n], b"hello");
//! ```

use std::path::Path;
use std::sync::Arc;

use crate::core::tables::{CompressionTables, DecodeTrie, TrieNode};
use crate::error::{constants, ProtocolError, Result};

/// Value of the first byte of every compressed stream.
pub const STREAM_HEADER: u8 = 1;

/// Bits taken by the stream header.
pub const HEADER_BITS: u32 = 8;

/// Bytes needed to hold `bits` bits.
#[inline]
pub fn compressed_size(bits: u32) -> usize {
    (bits as usize).div_ceil(8)
}

/// Stateless codec over shared, immutable tables.
#[derive(Debug, Clone)]
pub struct BitCodec {
    tables: Arc<CompressionTables>,
    max_code_bits: u32,
}

impl BitCodec {
    pub fn new(tables: CompressionTables) -> Self {
        Self::from_shared(Arc::new(tables))
    }

    pub fn from_shared(tables: Arc<CompressionTables>) -> Self {
        let max_code_bits = (0..=255u8)
            .map(|b| tables.encode.code(b).bits)
            .max()
            .unwrap_or(0);
        Self {
            tables,
            max_code_bits,
        }
    }

    /// Load the resource tables from `dir`. Any problem is fatal for the caller.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Ok(Self::new(CompressionTables::load_dir(dir)?))
    }

    pub fn tables(&self) -> &CompressionTables {
        &self.tables
    }

    /// Destination size that always fits `input_len` bytes with these tables.
    pub fn max_compressed_len(&self, input_len: usize) -> usize {
        // one extra byte because the capacity check is strict
        1 + (input_len * self.max_code_bits as usize).div_ceil(8) + 1
    }

    /// Compress `input` into `output`, returning the bit count including the header byte.
    ///
    /// Fails with [`ProtocolError::CapacityExceeded`] when the next code would reach
    /// the end of `output`. Bits already written stay in `output`.
    pub fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<u32> {
        if output.is_empty() {
            return Err(ProtocolError::CapacityExceeded {
                needed_bits: HEADER_BITS as usize,
                available_bits: 0,
            });
        }

        let max_bits = (output.len() - 1) * 8;
        let body = &mut output[1..];
        let mut cursor = 0usize;

        for &byte in input {
            let code = self.tables.encode.code(byte);
            let bits = code.bits as usize;
            if cursor + bits >= max_bits {
                return Err(ProtocolError::CapacityExceeded {
                    needed_bits: cursor + bits,
                    available_bits: max_bits,
                });
            }

            for step in 0..bits {
                let at = cursor + step;
                let shift = at & 7;
                let bit = ((code.pattern >> step) & 1) as u8;
                let slot = &mut body[at / 8];
                *slot = (*slot & !(1 << shift)) | (bit << shift);
            }
            cursor += bits;
        }

        output[0] = STREAM_HEADER;
        Ok(cursor as u32 + HEADER_BITS)
    }

    /// Compress into a freshly sized buffer trimmed to the stream length.
    pub fn compress_to_vec(&self, input: &[u8]) -> Result<(u32, Vec<u8>)> {
        let mut out = vec![0u8; self.max_compressed_len(input.len())];
        let bits = self.compress(input, &mut out)?;
        out.truncate(compressed_size(bits));
        Ok((bits, out))
    }

    /// Decompress `bit_count` bits of `input` into `output`, returning bytes written.
    ///
    /// Stops early, without error, once `output` is full.
    pub fn decompress(&self, input: &[u8], bit_count: u32, output: &mut [u8]) -> Result<usize> {
        if input.is_empty() {
            return Err(ProtocolError::CorruptStream(
                constants::ERR_EMPTY_INPUT.to_string(),
            ));
        }
        if bit_count < HEADER_BITS {
            return Err(ProtocolError::CorruptStream(
                constants::ERR_SHORT_BIT_COUNT.to_string(),
            ));
        }

        let required = compressed_size(bit_count);
        if input.len() < required {
            return Err(ProtocolError::CorruptStream(format!(
                "bit count {bit_count} needs {required} bytes, got {}",
                input.len()
            )));
        }
        if input[0] != STREAM_HEADER {
            return Err(ProtocolError::InvalidHeader);
        }

        let trie = &self.tables.decode;
        let data = &input[1..required];
        let data_bits = (bit_count - HEADER_BITS) as usize;

        let mut node = DecodeTrie::ROOT;
        let mut written = 0;
        for i in 0..data_bits {
            if written >= output.len() {
                break;
            }

            let bit = (data[i / 8] >> (i & 7)) & 1;
            let child = trie.child(node, bit).ok_or_else(|| {
                ProtocolError::CorruptStream(format!("{} (bit {i})", constants::ERR_MISSING_CHILD))
            })?;

            match trie.node(child) {
                Some(TrieNode::Leaf { byte }) => {
                    output[written] = *byte;
                    written += 1;
                    node = DecodeTrie::ROOT;
                }
                Some(TrieNode::Internal { .. }) => node = child,
                None => {
                    return Err(ProtocolError::CorruptStream(format!(
                        "node {child} outside trie"
                    )))
                }
            }
        }

        Ok(written)
    }
}
