//! Block signature tables for incremental change detection

use crate::checksum::{strong_checksum, weak_checksum, WeakAlgo};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

/// Checksums for one fixed-size block of a file version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Weak rolling checksum (fast candidate matching, may collide)
    pub weak: u32,

    /// BLAKE3 digest (confirms a weak candidate)
    pub strong: [u8; 32],
}

/// Ordered per-block signatures of one file version.
///
/// The table is indexed by block number; the final block may be shorter
/// than `block_size` and its checksums cover the actual byte count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureTable {
    pub block_size: u32,
    pub file_size: u64,
    pub blocks: Vec<BlockSignature>,
}

impl SignatureTable {
    /// Create an empty table (zero-byte file)
    pub fn empty(block_size: u32) -> Self {
        Self {
            block_size,
            file_size: 0,
            blocks: Vec::new(),
        }
    }

    /// Compute signatures over an in-memory buffer
    pub fn from_bytes(data: &[u8], block_size: u32, algo: WeakAlgo) -> Self {
        let mut table = Self::empty(block_size);
        table.file_size = data.len() as u64;
        for chunk in data.chunks(block_size as usize) {
            let (weak, _, _) = weak_checksum(algo, chunk);
            table.blocks.push(BlockSignature {
                weak,
                strong: strong_checksum(chunk),
            });
        }
        table
    }

    /// Compute signatures by reading a stream in block-size steps
    pub fn from_reader<R: Read>(mut reader: R, block_size: u32, algo: WeakAlgo) -> Result<Self> {
        let mut table = Self::empty(block_size);
        let mut buffer = vec![0u8; block_size as usize];
        loop {
            let n = read_block(&mut reader, &mut buffer)
                .map_err(|e| Error::io("reading file for signatures", e))?;
            if n == 0 {
                break;
            }
            let chunk = &buffer[..n];
            let (weak, _, _) = weak_checksum(algo, chunk);
            table.blocks.push(BlockSignature {
                weak,
                strong: strong_checksum(chunk),
            });
            table.file_size += n as u64;
        }
        Ok(table)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Actual byte length of a block (the last one may be short)
    pub fn block_len(&self, index: usize) -> usize {
        let bs = self.block_size as u64;
        let start = index as u64 * bs;
        let end = (start + bs).min(self.file_size);
        end.saturating_sub(start) as usize
    }

    /// Whether the final block is shorter than the block size
    pub fn has_short_tail(&self) -> bool {
        !self.blocks.is_empty() && self.file_size % self.block_size as u64 != 0
    }
}

/// Fill the buffer completely unless the stream ends first
fn read_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Weak-checksum lookup index over the full-size blocks of a table.
///
/// Candidates sharing a weak value are kept in table order; the first
/// whose strong checksum also matches wins. A weak-only hit is never
/// trusted.
pub struct WeakIndex<'a> {
    table: &'a SignatureTable,
    by_weak: HashMap<u32, Vec<usize>>,
}

impl<'a> WeakIndex<'a> {
    pub fn new(table: &'a SignatureTable) -> Self {
        let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::new();
        for (idx, block) in table.blocks.iter().enumerate() {
            // Short tails cannot match a full sliding window
            if table.block_len(idx) == table.block_size as usize {
                by_weak.entry(block.weak).or_default().push(idx);
            }
        }
        Self { table, by_weak }
    }

    /// Confirm a weak hit against the window's strong checksum.
    ///
    /// Returns the first matching block index in table order, or None
    /// when every candidate was a collision.
    pub fn confirm(&self, weak: u32, window: &[u8]) -> Option<usize> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = strong_checksum(window);
        candidates
            .iter()
            .copied()
            .find(|&idx| self.table.blocks[idx].strong == strong)
    }

    /// Match the stream tail against the table's short final block
    pub fn confirm_tail(&self, algo: WeakAlgo, tail: &[u8]) -> Option<usize> {
        if !self.table.has_short_tail() {
            return None;
        }
        let last = self.table.block_count() - 1;
        if self.table.block_len(last) != tail.len() {
            return None;
        }
        let (weak, _, _) = weak_checksum(algo, tail);
        if self.table.blocks[last].weak == weak
            && self.table.blocks[last].strong == strong_checksum(tail)
        {
            Some(last)
        } else {
            None
        }
    }
}
