//! Configuration management for coldsnap

use crate::codec::Compression;
use crate::engine::EngineKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default signature block size (matches the classic rsync engine)
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default upload segment size bound (32 MiB)
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 32 * 1024 * 1024;

/// Buffer size used when streaming full file content into the stream
pub const DATA_CHUNK_SIZE: usize = 1024 * 1024;

/// Depth of the queue between the tree walker and the segment writer
pub const QUEUE_DEPTH: usize = 2;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block size used for signatures and patches
    pub block_size: u32,

    /// Upper bound for emitted segment size in bytes
    pub max_segment_size: usize,

    /// Compression algorithm for the stream and the manifest
    pub compression: Compression,

    /// Incremental engine variant
    pub engine: EngineKind,

    /// Password file for AES encryption (None = plaintext stream)
    pub encrypt_pass_file: Option<PathBuf>,

    /// Skip files whose name contains this substring
    pub exclude: Option<String>,

    /// Follow symlinks instead of recording them
    pub dereference_symlinks: bool,

    /// Compute everything but write nothing
    pub dry_run: bool,

    /// Bandwidth limit for the segment sink in KiB/s (0 = unlimited)
    pub bwlimit: u64,

    /// Verbose logging level (0-3)
    pub verbose: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            compression: Compression::Gzip,
            engine: EngineKind::RsyncV2,
            encrypt_pass_file: None,
            exclude: None,
            dereference_symlinks: false,
            dry_run: false,
            bwlimit: 0,
            verbose: 0,
        }
    }
}

impl Config {
    /// Load configuration from a specific file
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("creating config dir", e))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("serializing config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| Error::io("writing config", e))?;
        Ok(())
    }

    /// Reject option combinations that would produce a broken stream
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::config("block_size must be nonzero"));
        }
        if self.max_segment_size == 0 {
            return Err(Error::config("max_segment_size must be nonzero"));
        }
        if let Some(ref path) = self.encrypt_pass_file {
            if !path.exists() {
                return Err(Error::config(format!(
                    "encryption password file does not exist: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Whether the stream will be encrypted
    pub fn encryption_enabled(&self) -> bool {
        self.encrypt_pass_file.is_some()
    }

    /// Whether a file name is excluded from the walk
    pub fn is_excluded(&self, name: &str) -> bool {
        match &self.exclude {
            Some(pattern) => !pattern.is_empty() && name.contains(pattern.as_str()),
            None => false,
        }
    }
}
