//! Weak rolling checksums and the BLAKE3 strong block checksum
//!
//! Two weak algorithms are supported behind one rolling interface: the
//! legacy two-accumulator sum used by the v1 engine, and a 16-bit masked
//! Adler-class variant used by the v2 engine. Both satisfy the same O(1)
//! rolling-update law: rolling the window by one byte is bit-exact with
//! recomputing the checksum over the shifted window.

use serde::{Deserialize, Serialize};

/// Weak checksum algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeakAlgo {
    /// Full-width wrapping accumulators, combined as `(b << 16) | (a & 0xffff)`
    Legacy,
    /// Accumulators masked to 16 bits at every step (Adler-class)
    Adler,
}

impl WeakAlgo {
    #[inline]
    fn mask(self, v: u32) -> u32 {
        match self {
            WeakAlgo::Legacy => v,
            WeakAlgo::Adler => v & 0xffff,
        }
    }
}

/// Compute the weak checksum of a block from scratch.
///
/// Returns `(combined, a, b)` where `a = sum(byte_i)` and
/// `b = sum((n - i) * byte_i)`, both under the algorithm's modulus.
pub fn weak_checksum(algo: WeakAlgo, block: &[u8]) -> (u32, u32, u32) {
    let n = block.len() as u32;
    let mut a: u32 = 0;
    let mut b: u32 = 0;
    for (i, &byte) in block.iter().enumerate() {
        a = algo.mask(a.wrapping_add(byte as u32));
        b = algo.mask(b.wrapping_add((n - i as u32).wrapping_mul(byte as u32)));
    }
    (combine(algo, a, b), a, b)
}

/// Update `(a, b)` for a window shifted by one byte, without rescanning.
///
/// Must hold for every window W over every buffer:
/// `rolling_update(W[0], x, a, b, n) == weak_checksum(W[1..] + [x])`.
pub fn rolling_update(
    algo: WeakAlgo,
    removed: u8,
    added: u8,
    a: u32,
    b: u32,
    block_size: u32,
) -> (u32, u32, u32) {
    let r = removed as u32;
    let x = added as u32;
    let a2 = algo.mask(a.wrapping_sub(r).wrapping_add(x));
    let b2 = algo.mask(b.wrapping_sub(block_size.wrapping_mul(r)).wrapping_add(a2));
    (combine(algo, a2, b2), a2, b2)
}

#[inline]
fn combine(algo: WeakAlgo, a: u32, b: u32) -> u32 {
    match algo {
        WeakAlgo::Legacy => (b << 16) | (a & 0xffff),
        WeakAlgo::Adler => (b << 16) | a,
    }
}

/// Incremental rolling checksum over a fixed-size window
#[derive(Debug, Clone)]
pub struct RollingSum {
    algo: WeakAlgo,
    a: u32,
    b: u32,
    window: u32,
}

impl RollingSum {
    /// Initialize from a full window read
    pub fn new(algo: WeakAlgo, window: &[u8]) -> Self {
        let (_, a, b) = weak_checksum(algo, window);
        Self {
            algo,
            a,
            b,
            window: window.len() as u32,
        }
    }

    /// Current combined checksum value
    #[inline]
    pub fn value(&self) -> u32 {
        combine(self.algo, self.a, self.b)
    }

    /// Slide the window one byte forward
    #[inline]
    pub fn roll(&mut self, removed: u8, added: u8) {
        let (_, a, b) = rolling_update(self.algo, removed, added, self.a, self.b, self.window);
        self.a = a;
        self.b = b;
    }
}

/// Cryptographic strong checksum of a block.
///
/// Only ever used to confirm a weak-checksum candidate; weak collisions
/// are expected and must not cause corruption.
pub fn strong_checksum(block: &[u8]) -> [u8; 32] {
    *blake3::hash(block).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_checksum_deterministic() {
        for algo in [WeakAlgo::Legacy, WeakAlgo::Adler] {
            let (c1, _, _) = weak_checksum(algo, b"hello world");
            let (c2, _, _) = weak_checksum(algo, b"hello world");
            assert_eq!(c1, c2);
            let (c3, _, _) = weak_checksum(algo, b"hello worle");
            assert_ne!(c1, c3);
        }
    }

    #[test]
    fn test_rolling_matches_recompute() {
        // Every one-byte slide must be bit-exact with a fresh computation
        let data: Vec<u8> = (0..512u32).map(|i| (i * 37 % 251) as u8).collect();
        let window = 16;

        for algo in [WeakAlgo::Legacy, WeakAlgo::Adler] {
            let mut sum = RollingSum::new(algo, &data[0..window]);
            for pos in 1..=(data.len() - window) {
                sum.roll(data[pos - 1], data[pos + window - 1]);
                let (expected, _, _) = weak_checksum(algo, &data[pos..pos + window]);
                assert_eq!(sum.value(), expected, "algo {:?} at pos {}", algo, pos);
            }
        }
    }

    #[test]
    fn test_rolling_update_free_function() {
        let block = b"abcdefgh";
        for algo in [WeakAlgo::Legacy, WeakAlgo::Adler] {
            let (_, a, b) = weak_checksum(algo, &block[0..4]);
            let (combined, _, _) = rolling_update(algo, block[0], block[4], a, b, 4);
            let (expected, _, _) = weak_checksum(algo, &block[1..5]);
            assert_eq!(combined, expected);
        }
    }

    #[test]
    fn test_short_final_block() {
        // Checksums over short blocks use the actual byte count
        let (c_short, a, _) = weak_checksum(WeakAlgo::Legacy, b"ab");
        let (c_full, _, _) = weak_checksum(WeakAlgo::Legacy, b"ab\0\0");
        assert_ne!(c_short, c_full);
        assert_eq!(a, (b'a' + b'b') as u32);
    }

    #[test]
    fn test_engineered_weak_collision() {
        // Same byte sum and same weighted sum, different content
        let x = [0u8, 3, 0];
        let y = [1u8, 1, 1];
        let (cx, _, _) = weak_checksum(WeakAlgo::Legacy, &x);
        let (cy, _, _) = weak_checksum(WeakAlgo::Legacy, &y);
        assert_eq!(cx, cy);
        assert_ne!(strong_checksum(&x), strong_checksum(&y));
    }

    #[test]
    fn test_strong_checksum_distinguishes() {
        assert_ne!(strong_checksum(b"block a"), strong_checksum(b"block b"));
        assert_eq!(strong_checksum(b"same"), strong_checksum(b"same"));
    }
}
