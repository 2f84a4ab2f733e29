//! Incremental engine variants and per-run metadata
//!
//! Two engine generations share the delta machinery and differ only in
//! the weak checksum they roll. A restore must use the engine the run
//! was written with, so the choice is recorded next to the segments.

use crate::checksum::WeakAlgo;
use crate::codec::Compression;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Engine variant selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    /// First-generation engine: full-width weak accumulators
    #[serde(rename = "rsync")]
    RsyncV1,

    /// Second-generation engine: 16-bit masked Adler-class weak checksum
    #[serde(rename = "rsyncv2")]
    RsyncV2,
}

impl EngineKind {
    pub fn weak_algo(&self) -> WeakAlgo {
        match self {
            EngineKind::RsyncV1 => WeakAlgo::Legacy,
            EngineKind::RsyncV2 => WeakAlgo::Adler,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::RsyncV1 => "rsync",
            EngineKind::RsyncV2 => "rsyncv2",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsync" => Ok(EngineKind::RsyncV1),
            "rsyncv2" => Ok(EngineKind::RsyncV2),
            other => Err(Error::config(format!("unknown engine: {}", other))),
        }
    }
}

/// Parameters a restore needs before it can read the first segment.
///
/// Written as plain JSON beside each level's segments; never compressed
/// or encrypted, since it carries the keys to both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub engine: EngineKind,
    pub compression: Compression,
    pub encrypted: bool,
    pub block_size: u32,
    pub level: u32,
    pub segment_count: u64,
}

impl RunMetadata {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::storage(format!("serializing run metadata: {}", e)))?;
        std::fs::write(path, json).map_err(|e| Error::io("writing run metadata", e))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path).map_err(|e| Error::io("reading run metadata", e))?;
        serde_json::from_slice(&contents)
            .map_err(|e| Error::storage(format!("parsing run metadata: {}", e)))
    }
}
