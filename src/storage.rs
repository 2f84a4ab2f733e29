//! Segment storage: where the backup stream's segments live
//!
//! The producer side only ever sees a [`SegmentSink`] and the restore
//! side a [`SegmentSource`], so the stream logic is independent of the
//! backing medium. The local directory store lays runs out as one
//! directory per level holding numbered segment files plus the run
//! metadata, with the manifest at the store root.

use crate::engine::RunMetadata;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Consumes the ordered segments of one backup run
pub trait SegmentSink {
    fn put_segment(&mut self, data: Bytes) -> Result<()>;
}

/// Produces the ordered segments of one stored run
pub trait SegmentSource {
    /// Next segment, or None at end of run
    fn next_segment(&mut self) -> Result<Option<Bytes>>;
}

/// Local filesystem store for levels, segments and the manifest
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest")
    }

    fn level_dir(&self, level: u32) -> PathBuf {
        self.root.join(format!("level_{}", level))
    }

    fn segment_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("segment_{:08}", index))
    }

    pub fn run_metadata_path(&self, level: u32) -> PathBuf {
        self.level_dir(level).join("run.json")
    }

    /// Highest level present in the store, if any run was written
    pub fn latest_level(&self) -> Result<Option<u32>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("listing store root", e)),
        };
        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("listing store root", e))?;
            let name = entry.file_name();
            if let Some(level) = name
                .to_str()
                .and_then(|n| n.strip_prefix("level_"))
                .and_then(|n| n.parse::<u32>().ok())
            {
                latest = latest.max(Some(level));
            }
        }
        Ok(latest)
    }

    /// Open a sink for a new level. An existing directory for the level
    /// is removed first: a re-run of a crashed level replaces it whole.
    pub fn sink_for_level(&self, level: u32) -> Result<DirSink> {
        let dir = self.level_dir(level);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| Error::io("clearing stale level directory", e))?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| Error::io("creating level directory", e))?;
        Ok(DirSink {
            dir,
            next_index: 0,
        })
    }

    /// Open a source over the segments of a stored level
    pub fn source_for_level(&self, level: u32) -> Result<DirSource> {
        let dir = self.level_dir(level);
        if !dir.is_dir() {
            return Err(Error::NotFound { path: dir });
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| Error::io("listing level", e))? {
            let entry = entry.map_err(|e| Error::io("listing level", e))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("segment_") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(DirSource { files, pos: 0 })
    }

    pub fn load_run_metadata(&self, level: u32) -> Result<RunMetadata> {
        RunMetadata::load(&self.run_metadata_path(level))
    }

    pub fn save_run_metadata(&self, meta: &RunMetadata) -> Result<()> {
        meta.save(&self.run_metadata_path(meta.level))
    }
}

/// Sink writing numbered segment files into one level directory
#[derive(Debug)]
pub struct DirSink {
    dir: PathBuf,
    next_index: u64,
}

impl DirSink {
    pub fn segments_written(&self) -> u64 {
        self.next_index
    }
}

impl SegmentSink for DirSink {
    fn put_segment(&mut self, data: Bytes) -> Result<()> {
        let path = LocalStore::segment_path(&self.dir, self.next_index);
        std::fs::write(&path, &data)
            .map_err(|e| Error::io(format!("writing segment {}", path.display()), e))?;
        self.next_index += 1;
        Ok(())
    }
}

/// Source reading the numbered segment files of one level in order
#[derive(Debug)]
pub struct DirSource {
    files: Vec<PathBuf>,
    pos: usize,
}

impl SegmentSource for DirSource {
    fn next_segment(&mut self) -> Result<Option<Bytes>> {
        let Some(path) = self.files.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        let data = std::fs::read(path)
            .map_err(|e| Error::io(format!("reading segment {}", path.display()), e))?;
        Ok(Some(Bytes::from(data)))
    }
}

/// Sink that discards segments and only counts them (dry runs)
#[derive(Debug, Default)]
pub struct NullSink {
    pub segments: u64,
    pub bytes: u64,
}

impl SegmentSink for NullSink {
    fn put_segment(&mut self, data: Bytes) -> Result<()> {
        self.segments += 1;
        self.bytes += data.len() as u64;
        Ok(())
    }
}

/// In-memory sink collecting segments, for exercising the stream
/// without a filesystem
#[derive(Debug, Default)]
pub struct MemorySink {
    pub segments: Vec<Bytes>,
}

impl SegmentSink for MemorySink {
    fn put_segment(&mut self, data: Bytes) -> Result<()> {
        self.segments.push(data);
        Ok(())
    }
}

/// Source replaying previously collected segments
#[derive(Debug)]
pub struct MemorySource {
    segments: std::vec::IntoIter<Bytes>,
}

impl MemorySource {
    pub fn new(segments: Vec<Bytes>) -> Self {
        Self {
            segments: segments.into_iter(),
        }
    }
}

impl SegmentSource for MemorySource {
    fn next_segment(&mut self) -> Result<Option<Bytes>> {
        Ok(self.segments.next())
    }
}
