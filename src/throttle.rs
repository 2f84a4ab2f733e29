//! Bandwidth limiting for the segment sink
//!
//! Token bucket over wall-clock time: tokens accrue at the configured
//! rate with a bounded burst, and a segment is only handed to the inner
//! sink once enough tokens are available.

use crate::error::Result;
use crate::storage::SegmentSink;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Token bucket limiter, rate in KiB/s (0 = unlimited)
#[derive(Debug)]
pub struct BandwidthLimiter {
    rate_bps: u64,
    tokens: f64,
    last_update: Instant,
    bytes_transferred: u64,
}

impl BandwidthLimiter {
    pub fn new(rate_kbps: u64) -> Self {
        let rate_bps = rate_kbps * 1024;
        Self {
            rate_bps,
            // Start with one second worth of tokens
            tokens: if rate_bps > 0 { rate_bps as f64 } else { f64::MAX },
            last_update: Instant::now(),
            bytes_transferred: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_limited(&self) -> bool {
        self.rate_bps > 0
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Block until `bytes` may be transferred
    pub fn acquire(&mut self, bytes: usize) {
        self.bytes_transferred += bytes as u64;
        if !self.is_limited() {
            return;
        }

        let needed = bytes as f64;
        loop {
            let elapsed = self.last_update.elapsed().as_secs_f64();
            self.last_update = Instant::now();
            let refill = elapsed * self.rate_bps as f64;
            // Max two seconds of burst
            self.tokens = (self.tokens + refill).min(self.rate_bps as f64 * 2.0);

            if self.tokens >= needed {
                self.tokens -= needed;
                return;
            }
            let wait = (needed - self.tokens) / self.rate_bps as f64;
            std::thread::sleep(Duration::from_secs_f64(wait.min(0.1)));
        }
    }
}

/// Sink wrapper that applies a bandwidth limit to each segment
pub struct ThrottledSink<S> {
    inner: S,
    limiter: BandwidthLimiter,
}

impl<S: SegmentSink> ThrottledSink<S> {
    pub fn new(inner: S, rate_kbps: u64) -> Self {
        Self {
            inner,
            limiter: BandwidthLimiter::new(rate_kbps),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: SegmentSink> SegmentSink for ThrottledSink<S> {
    fn put_segment(&mut self, data: Bytes) -> Result<()> {
        self.limiter.acquire(data.len());
        self.inner.put_segment(data)
    }
}
