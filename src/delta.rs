//! Sliding-window delta engine
//!
//! Runs the new version of a file against the previous version's
//! signature table and emits match/literal tokens in a single pass. A
//! match is accepted only when the weak rolling checksum hits the table
//! AND the strong checksum confirms it; weak collisions silently fall
//! back to literal data.

use crate::checksum::{RollingSum, WeakAlgo};
use crate::signature::{SignatureTable, WeakIndex};

/// One step of a computed delta
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaToken {
    /// The next bytes equal reference block `index`
    Match(u64),

    /// Bytes with no counterpart in the reference version
    Literal(Vec<u8>),
}

/// Summary of a delta, used to decide and report savings
#[derive(Debug, Clone, Default)]
pub struct DeltaSummary {
    pub matched_blocks: u64,
    pub literal_bytes: u64,
}

/// Compute the delta of `data` against a previous version's signatures.
///
/// State machine: a freshly-read window is tested for a confirmed match
/// (seek state); on a miss the window slides one byte at a time under the
/// rolling checksum, accumulating evicted bytes as pending literal data;
/// a confirmed match flushes the pending literal first and refills the
/// window with a full read.
pub fn compute_delta(data: &[u8], table: &SignatureTable, algo: WeakAlgo) -> Vec<DeltaToken> {
    let bs = table.block_size as usize;
    let mut tokens = Vec::new();
    let mut literal: Vec<u8> = Vec::new();

    if table.blocks.is_empty() || data.len() < bs.min(table.file_size as usize) {
        // Nothing can match; level-0 shape
        if !data.is_empty() {
            tokens.push(DeltaToken::Literal(data.to_vec()));
        }
        return tokens;
    }

    let index = WeakIndex::new(table);
    let mut pos = 0usize;

    while pos + bs <= data.len() {
        let mut sum = RollingSum::new(algo, &data[pos..pos + bs]);
        loop {
            if let Some(block_idx) = index.confirm(sum.value(), &data[pos..pos + bs]) {
                flush_literal(&mut tokens, &mut literal);
                tokens.push(DeltaToken::Match(block_idx as u64));
                pos += bs;
                break;
            }
            if pos + bs < data.len() {
                // Slide: evict the oldest byte into the pending literal
                literal.push(data[pos]);
                sum.roll(data[pos], data[pos + bs]);
                pos += 1;
            } else {
                // Window reached the end without matching
                literal.extend_from_slice(&data[pos..]);
                pos = data.len();
                break;
            }
        }
    }

    // Tail shorter than a block: it can only equal the table's short
    // final block, otherwise it is literal data
    if pos < data.len() {
        let tail = &data[pos..];
        if let Some(block_idx) = index.confirm_tail(algo, tail) {
            flush_literal(&mut tokens, &mut literal);
            tokens.push(DeltaToken::Match(block_idx as u64));
        } else {
            literal.extend_from_slice(tail);
        }
    }

    flush_literal(&mut tokens, &mut literal);
    tokens
}

fn flush_literal(tokens: &mut Vec<DeltaToken>, literal: &mut Vec<u8>) {
    if !literal.is_empty() {
        tokens.push(DeltaToken::Literal(std::mem::take(literal)));
    }
}

/// Aggregate counts over a token sequence
pub fn summarize(tokens: &[DeltaToken]) -> DeltaSummary {
    let mut summary = DeltaSummary::default();
    for token in tokens {
        match token {
            DeltaToken::Match(_) => summary.matched_blocks += 1,
            DeltaToken::Literal(data) => summary.literal_bytes += data.len() as u64,
        }
    }
    summary
}

/// Derive the set of new-file blocks that must be resent for an in-place
/// patch.
///
/// The patch model overwrites block `j` of the on-disk previous version
/// with block `j` of the new version, then truncates to the new size. A
/// grid block is clean only where the token stream produced an aligned
/// match of the same index (content at that offset is identical to what
/// is already on disk); every other byte range dirties the blocks it
/// touches.
pub fn changed_blocks(tokens: &[DeltaToken], table: &SignatureTable, new_len: u64) -> Vec<u64> {
    let bs = table.block_size as u64;
    let block_count = new_len.div_ceil(bs);
    let mut dirty = vec![false; block_count as usize];

    let mut offset = 0u64;
    for token in tokens {
        match token {
            DeltaToken::Match(idx) => {
                let len = table.block_len(*idx as usize) as u64;
                if offset != idx * bs {
                    mark_dirty(&mut dirty, bs, offset, len);
                }
                offset += len;
            }
            DeltaToken::Literal(data) => {
                mark_dirty(&mut dirty, bs, offset, data.len() as u64);
                offset += data.len() as u64;
            }
        }
    }
    debug_assert_eq!(offset, new_len);

    dirty
        .iter()
        .enumerate()
        .filter(|(_, &d)| d)
        .map(|(i, _)| i as u64)
        .collect()
}

fn mark_dirty(dirty: &mut [bool], block_size: u64, offset: u64, len: u64) {
    if len == 0 {
        return;
    }
    let first = (offset / block_size) as usize;
    let last = ((offset + len - 1) / block_size) as usize;
    for flag in dirty.iter_mut().take(last + 1).skip(first) {
        *flag = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u32 = 8;

    fn sig(data: &[u8]) -> SignatureTable {
        SignatureTable::from_bytes(data, BS, WeakAlgo::Legacy)
    }

    #[test]
    fn test_identical_data_all_matches() {
        let data = b"AAAAAAAABBBBBBBBCCCCCCCC";
        let tokens = compute_delta(data, &sig(data), WeakAlgo::Legacy);
        assert_eq!(
            tokens,
            vec![
                DeltaToken::Match(0),
                DeltaToken::Match(1),
                DeltaToken::Match(2)
            ]
        );
        assert_eq!(summarize(&tokens).literal_bytes, 0);
    }

    #[test]
    fn test_identical_with_short_tail() {
        let data = b"AAAAAAAABBBBBBBBxy";
        let tokens = compute_delta(data, &sig(data), WeakAlgo::Legacy);
        assert_eq!(
            tokens,
            vec![
                DeltaToken::Match(0),
                DeltaToken::Match(1),
                DeltaToken::Match(2)
            ]
        );
    }

    #[test]
    fn test_completely_different_is_literal() {
        let old = b"old contents here!!!";
        let new = b"something else entirely that shares nothing";
        let tokens = compute_delta(new, &sig(old), WeakAlgo::Legacy);
        assert!(tokens.iter().all(|t| matches!(t, DeltaToken::Literal(_))));
        assert_eq!(summarize(&tokens).literal_bytes, new.len() as u64);
    }

    #[test]
    fn test_single_byte_change_stays_aligned() {
        let old: Vec<u8> = (0..4 * BS as usize).map(|i| (i % 251) as u8).collect();
        let mut new = old.clone();
        new[2 * BS as usize + 3] ^= 0xff;

        let table = sig(&old);
        let tokens = compute_delta(&new, &table, WeakAlgo::Legacy);
        let changed = changed_blocks(&tokens, &table, new.len() as u64);
        assert_eq!(changed, vec![2]);

        let summary = summarize(&tokens);
        assert_eq!(summary.matched_blocks, 3);
        assert_eq!(summary.literal_bytes, BS as u64);
    }

    #[test]
    fn test_collision_is_not_a_match() {
        // Blocks [1,1,1] and [0,3,0] share a weak checksum
        let old = [1u8, 1, 1];
        let new = [0u8, 3, 0];
        let table = SignatureTable::from_bytes(&old, 3, WeakAlgo::Legacy);
        let tokens = compute_delta(&new, &table, WeakAlgo::Legacy);
        assert_eq!(tokens, vec![DeltaToken::Literal(new.to_vec())]);
    }

    #[test]
    fn test_empty_input() {
        let table = sig(b"AAAAAAAA");
        let tokens = compute_delta(b"", &table, WeakAlgo::Legacy);
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_smaller_than_block_size() {
        let table = sig(b"AAAAAAAABBBBBBBB");
        let tokens = compute_delta(b"xyz", &table, WeakAlgo::Legacy);
        assert_eq!(tokens, vec![DeltaToken::Literal(b"xyz".to_vec())]);
    }

    #[test]
    fn test_changed_blocks_shrunk_file() {
        let old: Vec<u8> = vec![7u8; 3 * BS as usize];
        let new: Vec<u8> = vec![9u8; BS as usize + 2];
        let table = sig(&old);
        let tokens = compute_delta(&new, &table, WeakAlgo::Legacy);
        let changed = changed_blocks(&tokens, &table, new.len() as u64);
        assert_eq!(changed, vec![0, 1]);
    }

    #[test]
    fn test_unaligned_match_dirties_blocks() {
        // Insert one byte at the front: content matches old blocks but at
        // shifted offsets, so the patch model must resend everything the
        // shifted ranges touch.
        let old: Vec<u8> = (0..3 * BS as usize).map(|i| (i * 13 % 251) as u8).collect();
        let mut new = vec![0x5a];
        new.extend_from_slice(&old);

        let table = sig(&old);
        let tokens = compute_delta(&new, &table, WeakAlgo::Legacy);
        let changed = changed_blocks(&tokens, &table, new.len() as u64);

        // Reconstruct through the patch model and verify byte equality
        let mut patched = old.clone();
        patched.resize(new.len(), 0);
        for &idx in &changed {
            let start = (idx * BS as u64) as usize;
            let end = (start + BS as usize).min(new.len());
            patched[start..end].copy_from_slice(&new[start..end]);
        }
        assert_eq!(patched, new);
    }

    #[test]
    fn test_adler_algo_round_trip() {
        let old: Vec<u8> = (0..256u32).map(|i| (i % 256) as u8).collect();
        let mut new = old.clone();
        new[100] = new[100].wrapping_add(1);

        let table = SignatureTable::from_bytes(&old, 32, WeakAlgo::Adler);
        let tokens = compute_delta(&new, &table, WeakAlgo::Adler);
        let changed = changed_blocks(&tokens, &table, new.len() as u64);
        assert_eq!(changed, vec![3]);
    }
}
