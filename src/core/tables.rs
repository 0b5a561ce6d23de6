//! # Compression Tables
//!
//! The two static resources that drive the bit codec.
//!
//! Both files are flat arrays of little-endian 32-bit words.
//!
//! ## Encode table (`compress.dat`)
//! Indexed by the *signed* value of an input byte. Words `0x00..0x100` hold the
//! bit patterns and words `0x100..0x200` the bit lengths:
//! ```text
//! pattern = words[0x80  + (byte as i8)]
//! length  = words[0x180 + (byte as i8)]
//! ```
//!
//! ## Decode table (`decompress.dat`)
//! A binary trie flattened into 4-word nodes `[left, right, unused, value]`.
//! Entries above `0xFF` are pointers, resolved against a base discovered from the
//! first word (`base = words[0] - 4`, `index = (entry - base) / 4`). Entries at or
//! below `0xFF` are terminal byte values. `words[0]` points at the root.
//!
//! The pointer walk is converted at load time into an arena of [`TrieNode`]s
//! addressed by [`NodeId`], so an out-of-range pointer is a load error rather
//! than a bad read during decoding.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{constants, ProtocolError, Result};

/// File name of the encode table inside the resource directory.
pub const COMPRESS_FILE_NAME: &str = "compress.dat";

/// File name of the decode table inside the resource directory.
pub const DECOMPRESS_FILE_NAME: &str = "decompress.dat";

/// Minimum number of words in a usable encode table.
pub const ENCODE_TABLE_WORDS: usize = 0x200;

const PATTERN_REGION: isize = 0x80;
const LENGTH_REGION: isize = 0x180;
const MAX_CODE_BITS: u32 = 32;
const MAX_VALUE_ENTRY: u32 = 0xFF;

/// Decode a resource file into little-endian words.
pub fn words_from_bytes(data: &[u8]) -> Result<Vec<u32>> {
    if data.len() % 4 != 0 {
        return Err(ProtocolError::ConfigError(format!(
            "{} ({} bytes)",
            constants::ERR_TABLE_LENGTH,
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encode words back into the on-disk byte layout.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// A variable-length code: `bits` bits taken LSB-first from `pattern`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Code {
    pub pattern: u32,
    pub bits: u32,
}

/// Per-byte code lookup, already resolved from the signed-index layout.
#[derive(Debug, Clone)]
pub struct EncodeTable {
    codes: [Code; 256],
}

impl EncodeTable {
    /// Build from the raw words of `compress.dat`.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.len() < ENCODE_TABLE_WORDS {
            return Err(ProtocolError::ConfigError(format!(
                "Encode table has {} words, need at least {}",
                words.len(),
                ENCODE_TABLE_WORDS
            )));
        }

        let mut codes = [Code::default(); 256];
        for (byte, code) in codes.iter_mut().enumerate() {
            let signed = byte as u8 as i8 as isize;
            let pattern = words[(PATTERN_REGION + signed) as usize];
            let bits = words[(LENGTH_REGION + signed) as usize];
            if bits > MAX_CODE_BITS {
                return Err(ProtocolError::ConfigError(format!(
                    "Code length {bits} for byte {byte:#04x} exceeds {MAX_CODE_BITS} bits"
                )));
            }
            *code = Code { pattern, bits };
        }

        Ok(Self { codes })
    }

    /// Code for one input byte.
    #[inline]
    pub fn code(&self, byte: u8) -> Code {
        self.codes[byte as usize]
    }
}

/// Index of a node in the [`DecodeTrie`] arena.
pub type NodeId = usize;

/// One node of the decode trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieNode {
    /// Branch. A `None` child means the bit path is not part of the code.
    Internal { children: [Option<NodeId>; 2] },
    /// Terminal node carrying the decoded byte.
    Leaf { byte: u8 },
}

/// Arena form of the decode table. The root is always [`DecodeTrie::ROOT`].
#[derive(Debug, Clone)]
pub struct DecodeTrie {
    nodes: Vec<TrieNode>,
}

impl DecodeTrie {
    pub const ROOT: NodeId = 0;

    /// Build from the raw words of `decompress.dat`.
    ///
    /// Every pointer in the table is range-checked, reachable nodes are
    /// converted into the arena, and a reachable leaf without a value slot is
    /// rejected.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.is_empty() {
            return Err(ProtocolError::ConfigError(
                constants::ERR_EMPTY_DECODE_TABLE.to_string(),
            ));
        }

        let base = words[0].wrapping_sub(4);
        let resolve = |entry: u32| -> Result<Option<usize>> {
            if entry <= MAX_VALUE_ENTRY {
                return Ok(None);
            }
            let index = (entry.wrapping_sub(base) / 4) as usize;
            if index >= words.len() {
                return Err(ProtocolError::ConfigError(format!(
                    "Decode pointer {entry:#x} resolves to {index}, table has {} words",
                    words.len()
                )));
            }
            Ok(Some(index))
        };

        for &entry in words {
            resolve(entry)?;
        }

        let root_slot = resolve(words[0])?
            .ok_or_else(|| ProtocolError::ConfigError(constants::ERR_MISSING_ROOT.to_string()))?;

        let mut ids: HashMap<usize, NodeId> = HashMap::new();
        let mut slots: Vec<usize> = Vec::new();
        ids.insert(root_slot, Self::ROOT);
        slots.push(root_slot);

        let mut nodes = Vec::new();
        let mut next = 0;
        while next < slots.len() {
            let slot = slots[next];
            next += 1;

            if slot + 1 >= words.len() {
                return Err(ProtocolError::ConfigError(format!(
                    "Decode node at word {slot} is truncated"
                )));
            }

            let left = resolve(words[slot])?;
            let right = resolve(words[slot + 1])?;

            let node = if left.is_none() && right.is_none() {
                match words.get(slot + 3) {
                    Some(&value) if value <= MAX_VALUE_ENTRY => TrieNode::Leaf { byte: value as u8 },
                    _ => {
                        return Err(ProtocolError::ConfigError(format!(
                            "Decode leaf at word {slot} has no terminal value"
                        )))
                    }
                }
            } else {
                let mut children = [None, None];
                for (child, target) in children.iter_mut().zip([left, right]) {
                    if let Some(target) = target {
                        let id = *ids.entry(target).or_insert_with(|| {
                            slots.push(target);
                            slots.len() - 1
                        });
                        *child = Some(id);
                    }
                }
                TrieNode::Internal { children }
            };
            nodes.push(node);
        }

        debug!(nodes = nodes.len(), words = words.len(), "Decode trie built");
        Ok(Self { nodes })
    }

    /// Child reached by following `bit` from `node`, if the path exists.
    #[inline]
    pub fn child(&self, node: NodeId, bit: u8) -> Option<NodeId> {
        match self.nodes.get(node) {
            Some(TrieNode::Internal { children }) => children[(bit & 1) as usize],
            _ => None,
        }
    }

    /// Node by id.
    #[inline]
    pub fn node(&self, id: NodeId) -> Option<&TrieNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Both codec tables, loaded once and shared read-only.
#[derive(Debug, Clone)]
pub struct CompressionTables {
    pub encode: EncodeTable,
    pub decode: DecodeTrie,
}

impl CompressionTables {
    /// Build from already-decoded word arrays.
    pub fn from_words(encode: &[u32], decode: &[u32]) -> Result<Self> {
        Ok(Self {
            encode: EncodeTable::from_words(encode)?,
            decode: DecodeTrie::from_words(decode)?,
        })
    }

    /// Build from the raw bytes of the two resource files.
    pub fn from_bytes(encode: &[u8], decode: &[u8]) -> Result<Self> {
        Self::from_words(&words_from_bytes(encode)?, &words_from_bytes(decode)?)
    }

    /// Load `compress.dat` and `decompress.dat` from a directory.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| {
            let path = dir.join(name);
            fs::read(&path).map_err(|e| {
                ProtocolError::ConfigError(format!(
                    "Resource {name} not readable at {}: {e}",
                    path.display()
                ))
            })
        };

        let tables = Self::from_bytes(&read(COMPRESS_FILE_NAME)?, &read(DECOMPRESS_FILE_NAME)?)?;
        info!(
            path = %dir.display(),
            trie_nodes = tables.decode.len(),
            "Compression tables loaded"
        );
        Ok(tables)
    }
}

/// Produces valid table pairs from a set of code lengths.
///
/// Codes are assigned canonically and written in the exact on-disk word
/// format, so the output goes through the same loader as real resources.
/// The default shape gives `0x00`, `0x20`, `0x65` and `0xFF` 3-bit codes and
/// every other byte a 9-bit code, which leaves a few bit paths unassigned.
#[derive(Debug, Clone)]
pub struct TableBuilder {
    lengths: [u32; 256],
}

#[derive(Default)]
struct BuildNode {
    children: [Option<usize>; 2],
    value: Option<u8>,
}

const DEFAULT_SHORT_CODES: [u8; 4] = [0x00, 0x20, 0x65, 0xFF];
const TABLE_POINTER_BASE: u32 = 0x1000;

impl Default for TableBuilder {
    fn default() -> Self {
        let mut lengths = [9u32; 256];
        for byte in DEFAULT_SHORT_CODES {
            lengths[byte as usize] = 3;
        }
        Self { lengths }
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit code lengths. Lengths must be 1..=32 and satisfy Kraft's inequality.
    pub fn with_lengths(lengths: [u32; 256]) -> Result<Self> {
        let mut kraft = 0f64;
        for (byte, &bits) in lengths.iter().enumerate() {
            if bits == 0 || bits > MAX_CODE_BITS {
                return Err(ProtocolError::ConfigError(format!(
                    "Code length {bits} for byte {byte:#04x} out of range"
                )));
            }
            kraft += 0.5f64.powi(bits as i32);
        }
        if kraft > 1.0 {
            return Err(ProtocolError::ConfigError(format!(
                "Code lengths are not a prefix code (kraft sum {kraft})"
            )));
        }
        Ok(Self { lengths })
    }

    /// Canonical codes, expressed as LSB-first emission patterns.
    pub fn codes(&self) -> [Code; 256] {
        let mut order: Vec<u8> = (0..=255).collect();
        order.sort_by_key(|&b| (self.lengths[b as usize], b));

        let mut codes = [Code::default(); 256];
        let mut code: u64 = 0;
        let mut prev_bits = self.lengths[order[0] as usize];
        for byte in order {
            let bits = self.lengths[byte as usize];
            code <<= bits - prev_bits;
            prev_bits = bits;

            let mut pattern = 0u32;
            for step in 0..bits {
                let bit = ((code >> (bits - 1 - step)) & 1) as u32;
                pattern |= bit << step;
            }
            codes[byte as usize] = Code { pattern, bits };
            code += 1;
        }
        codes
    }

    /// Words for `compress.dat`.
    pub fn encode_words(&self) -> Vec<u32> {
        let mut words = vec![0u32; ENCODE_TABLE_WORDS];
        for (byte, code) in self.codes().iter().enumerate() {
            let signed = byte as u8 as i8 as isize;
            words[(PATTERN_REGION + signed) as usize] = code.pattern;
            words[(LENGTH_REGION + signed) as usize] = code.bits;
        }
        words
    }

    /// Words for `decompress.dat`.
    pub fn decode_words(&self) -> Vec<u32> {
        let mut tree = vec![BuildNode::default()];
        for (byte, code) in self.codes().iter().enumerate() {
            let mut at = 0;
            for step in 0..code.bits {
                let bit = ((code.pattern >> step) & 1) as usize;
                at = match tree[at].children[bit] {
                    Some(next) => next,
                    None => {
                        tree.push(BuildNode::default());
                        let next = tree.len() - 1;
                        tree[at].children[bit] = Some(next);
                        next
                    }
                };
            }
            tree[at].value = Some(byte as u8);
        }

        let slot = |node: usize| 1 + 4 * node;
        let pointer = |node: usize| TABLE_POINTER_BASE + 4 * slot(node) as u32;

        let mut words = vec![0u32; 1 + 4 * tree.len()];
        words[0] = pointer(0);
        for (index, node) in tree.iter().enumerate() {
            let at = slot(index);
            for (offset, child) in node.children.iter().enumerate() {
                if let Some(child) = child {
                    words[at + offset] = pointer(*child);
                }
            }
            if let Some(value) = node.value {
                words[at + 3] = u32::from(value);
            }
        }
        words
    }

    /// Build loaded tables directly.
    pub fn build(&self) -> Result<CompressionTables> {
        CompressionTables::from_words(&self.encode_words(), &self.decode_words())
    }

    /// Write both resource files into `dir`.
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::write(
            dir.join(COMPRESS_FILE_NAME),
            words_to_bytes(&self.encode_words()),
        )?;
        fs::write(
            dir.join(DECOMPRESS_FILE_NAME),
            words_to_bytes(&self.decode_words()),
        )?;
        Ok(())
    }
}
