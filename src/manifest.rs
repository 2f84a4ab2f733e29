//! Previous-run manifest: the state an incremental level diffs against
//!
//! The manifest maps every relative path captured by the last run to
//! its metadata and, for regular files, the signature table of the
//! content as uploaded. It is stored as compressed JSON beside the
//! segment levels and rewritten atomically only after a run completes,
//! so a crashed run leaves the previous manifest intact and the next
//! run re-uploads anything the crashed one touched.

use crate::codec::{one_shot_compress, one_shot_decompress, Compression};
use crate::engine::EngineKind;
use crate::error::{Error, Result};
use crate::signature::SignatureTable;
use crate::types::FileMetadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const MANIFEST_VERSION: u32 = 2;

/// Per-path record carried between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub meta: FileMetadata,

    /// Signatures of the uploaded content; None for entries without
    /// content (directories, symlinks, special files)
    pub signature: Option<SignatureTable>,
}

/// Totals of the run that wrote this manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_files: u64,
    pub total_directories: u64,
    pub backup_size_on_disk: u64,
    pub backup_size_compressed: u64,
    pub broken_links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub engine: EngineKind,
    pub block_size: u32,
    pub level: u32,
    #[serde(default)]
    pub counters: RunCounters,
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(engine: EngineKind, block_size: u32) -> Self {
        Self {
            version: MANIFEST_VERSION,
            engine,
            block_size,
            level: 0,
            counters: RunCounters::default(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the manifest if one exists. A missing file means level 0;
    /// a present but unreadable or version-mismatched file is an error
    /// rather than a silent full re-upload.
    pub fn load(path: &Path, compression: Compression) -> Result<Option<Self>> {
        let compressed = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("reading manifest", e)),
        };
        let json = one_shot_decompress(compression, &compressed)
            .map_err(|e| Error::Manifest {
                message: format!("decompressing manifest: {}", e),
            })?;
        let manifest: Self = serde_json::from_slice(&json).map_err(|e| Error::Manifest {
            message: format!("parsing manifest: {}", e),
        })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Manifest {
                message: format!(
                    "manifest version {} unsupported (expected {})",
                    manifest.version, MANIFEST_VERSION
                ),
            });
        }
        Ok(Some(manifest))
    }

    /// Persist the manifest. Written to a temp file first and renamed,
    /// so readers never observe a half-written manifest.
    pub fn save(&self, path: &Path, compression: Compression) -> Result<()> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Manifest {
            message: format!("serializing manifest: {}", e),
        })?;
        let compressed = one_shot_compress(compression, &json)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &compressed).map_err(|e| Error::io("writing manifest", e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::io("committing manifest", e))?;
        Ok(())
    }

    /// Whether the on-disk entry can be carried forward without reading
    /// its content. Timestamps and shape must agree exactly; content
    /// checksums are only consulted once this says "changed".
    pub fn is_unchanged(&self, rel_path: &str, meta: &FileMetadata) -> bool {
        match self.entries.get(rel_path) {
            Some(entry) => {
                entry.meta.kind == meta.kind
                    && entry.meta.size == meta.size
                    && entry.meta.same_times(meta)
            }
            None => false,
        }
    }

    pub fn signature_for(&self, rel_path: &str) -> Option<&SignatureTable> {
        self.entries.get(rel_path)?.signature.as_ref()
    }
}
