//! Stateful streaming compressors for the segment stream and manifest
//!
//! All three algorithms are byte-stream transforms: input fed to the
//! decompressor does not need to align with compressor call boundaries.
//! `flush()` must be called exactly once at end-of-stream; pushing data
//! afterwards is an error.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::str::FromStr;

/// Compression algorithm for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "bzip2" => Ok(Compression::Bzip2),
            "xz" => Ok(Compression::Xz),
            other => Err(Error::config(format!(
                "unknown compression algorithm: {}",
                other
            ))),
        }
    }
}

enum CompressorInner {
    Gzip(flate2::write::ZlibEncoder<Vec<u8>>),
    Bzip2(bzip2::write::BzEncoder<Vec<u8>>),
    Xz(xz2::write::XzEncoder<Vec<u8>>),
}

/// Incremental compressor.
///
/// Output of a single call need not correspond to its input; bytes may
/// be buffered internally until `flush()`.
pub struct Compressor {
    inner: Option<CompressorInner>,
}

impl Compressor {
    pub fn new(algo: Compression) -> Self {
        let inner = match algo {
            Compression::Gzip => CompressorInner::Gzip(flate2::write::ZlibEncoder::new(
                Vec::new(),
                flate2::Compression::best(),
            )),
            Compression::Bzip2 => CompressorInner::Bzip2(bzip2::write::BzEncoder::new(
                Vec::new(),
                bzip2::Compression::best(),
            )),
            Compression::Xz => {
                CompressorInner::Xz(xz2::write::XzEncoder::new(Vec::new(), 9))
            }
        };
        Self { inner: Some(inner) }
    }

    /// Push bytes through the compressor, returning whatever output is
    /// ready so far (possibly empty)
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| Error::codec("compress called after flush"))?;
        match inner {
            CompressorInner::Gzip(enc) => {
                enc.write_all(data)
                    .map_err(|e| Error::codec(format!("gzip compress: {}", e)))?;
                Ok(std::mem::take(enc.get_mut()))
            }
            CompressorInner::Bzip2(enc) => {
                enc.write_all(data)
                    .map_err(|e| Error::codec(format!("bzip2 compress: {}", e)))?;
                Ok(std::mem::take(enc.get_mut()))
            }
            CompressorInner::Xz(enc) => {
                enc.write_all(data)
                    .map_err(|e| Error::codec(format!("xz compress: {}", e)))?;
                Ok(std::mem::take(enc.get_mut()))
            }
        }
    }

    /// Terminate the stream and return the remaining output.
    /// Must be called exactly once.
    pub fn flush(&mut self) -> Result<Vec<u8>> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| Error::codec("flush called twice"))?;
        let tail = match inner {
            CompressorInner::Gzip(enc) => enc
                .finish()
                .map_err(|e| Error::codec(format!("gzip flush: {}", e)))?,
            CompressorInner::Bzip2(enc) => enc
                .finish()
                .map_err(|e| Error::codec(format!("bzip2 flush: {}", e)))?,
            CompressorInner::Xz(enc) => enc
                .finish()
                .map_err(|e| Error::codec(format!("xz flush: {}", e)))?,
        };
        Ok(tail)
    }
}

enum DecompressorInner {
    Gzip(flate2::write::ZlibDecoder<Vec<u8>>),
    Bzip2(bzip2::write::BzDecoder<Vec<u8>>),
    Xz(xz2::write::XzDecoder<Vec<u8>>),
}

/// Incremental decompressor, symmetric to [`Compressor`]
pub struct Decompressor {
    inner: Option<DecompressorInner>,
}

impl Decompressor {
    pub fn new(algo: Compression) -> Self {
        let inner = match algo {
            Compression::Gzip => {
                DecompressorInner::Gzip(flate2::write::ZlibDecoder::new(Vec::new()))
            }
            Compression::Bzip2 => {
                DecompressorInner::Bzip2(bzip2::write::BzDecoder::new(Vec::new()))
            }
            Compression::Xz => DecompressorInner::Xz(xz2::write::XzDecoder::new(Vec::new())),
        };
        Self { inner: Some(inner) }
    }

    /// Push compressed bytes (any split) and return the plaintext ready
    /// so far. A corrupt stream (e.g. wrong decryption key upstream)
    /// surfaces here as a codec error.
    pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| Error::codec("decompress called after flush"))?;
        match inner {
            DecompressorInner::Gzip(dec) => {
                dec.write_all(data)
                    .map_err(|e| Error::codec(format!("gzip decompress: {}", e)))?;
                Ok(std::mem::take(dec.get_mut()))
            }
            DecompressorInner::Bzip2(dec) => {
                dec.write_all(data)
                    .map_err(|e| Error::codec(format!("bzip2 decompress: {}", e)))?;
                Ok(std::mem::take(dec.get_mut()))
            }
            DecompressorInner::Xz(dec) => {
                dec.write_all(data)
                    .map_err(|e| Error::codec(format!("xz decompress: {}", e)))?;
                Ok(std::mem::take(dec.get_mut()))
            }
        }
    }

    /// Drain whatever the decompressor still buffers at end-of-stream
    pub fn flush(&mut self) -> Result<Vec<u8>> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| Error::codec("flush called twice"))?;
        let tail = match inner {
            DecompressorInner::Gzip(dec) => dec
                .finish()
                .map_err(|e| Error::codec(format!("gzip flush: {}", e)))?,
            DecompressorInner::Bzip2(mut dec) => dec
                .finish()
                .map_err(|e| Error::codec(format!("bzip2 flush: {}", e)))?,
            DecompressorInner::Xz(mut dec) => dec
                .finish()
                .map_err(|e| Error::codec(format!("xz flush: {}", e)))?,
        };
        Ok(tail)
    }
}

/// Compress a complete buffer in one call (manifest persistence)
pub fn one_shot_compress(algo: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let mut compressor = Compressor::new(algo);
    let mut out = compressor.compress(data)?;
    out.extend(compressor.flush()?);
    Ok(out)
}

/// Decompress a complete buffer in one call
pub fn one_shot_decompress(algo: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let mut decompressor = Decompressor::new(algo);
    let mut out = decompressor.decompress(data)?;
    out.extend(decompressor.flush()?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALGOS: [Compression; 3] = [Compression::Gzip, Compression::Bzip2, Compression::Xz];

    #[test]
    fn test_one_shot_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        for algo in ALGOS {
            let compressed = one_shot_compress(algo, &data).unwrap();
            assert!(compressed.len() < data.len());
            let restored = one_shot_decompress(algo, &compressed).unwrap();
            assert_eq!(restored, data, "{}", algo);
        }
    }

    #[test]
    fn test_streaming_with_unaligned_chunks() {
        // Decompressor input split on boundaries unrelated to the
        // compressor's call boundaries
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        for algo in ALGOS {
            let mut compressor = Compressor::new(algo);
            let mut compressed = Vec::new();
            for chunk in data.chunks(1000) {
                compressed.extend(compressor.compress(chunk).unwrap());
            }
            compressed.extend(compressor.flush().unwrap());

            let mut decompressor = Decompressor::new(algo);
            let mut restored = Vec::new();
            for chunk in compressed.chunks(7) {
                restored.extend(decompressor.decompress(chunk).unwrap());
            }
            restored.extend(decompressor.flush().unwrap());
            assert_eq!(restored, data, "{}", algo);
        }
    }

    #[test]
    fn test_compress_after_flush_is_error() {
        let mut compressor = Compressor::new(Compression::Gzip);
        compressor.compress(b"data").unwrap();
        compressor.flush().unwrap();
        assert!(compressor.compress(b"more").is_err());
        assert!(compressor.flush().is_err());
    }

    #[test]
    fn test_garbage_input_fails() {
        let mut decompressor = Decompressor::new(Compression::Gzip);
        let garbage = vec![0xA5u8; 256];
        let pushed = decompressor.decompress(&garbage);
        let flushed = decompressor.flush();
        assert!(pushed.is_err() || flushed.is_err());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("bzip2".parse::<Compression>().unwrap(), Compression::Bzip2);
        assert_eq!("xz".parse::<Compression>().unwrap(), Compression::Xz);
        assert!("zstd".parse::<Compression>().is_err());
    }
}
