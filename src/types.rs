//! Core domain types for coldsnap

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

/// File type of a backed-up entry.
///
/// Sockets are never backed up; they are detected during the walk and
/// skipped before any metadata is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    /// Anything the platform reports that does not fit the above.
    /// Treated as content-bearing, like a regular file.
    Unknown,
}

impl FileKind {
    /// Classify a file type as returned by lstat
    pub fn from_file_type(ft: &std::fs::FileType) -> Self {
        if ft.is_file() {
            FileKind::Regular
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::Unknown
        }
    }

    /// Whether file content is transferred for this kind
    pub fn has_content(&self) -> bool {
        matches!(self, FileKind::Regular | FileKind::Unknown)
    }
}

/// Per-path inode record carried in file headers and in the manifest.
///
/// Owner and group travel by name and are resolved back to numeric ids
/// at restore time, so restoring on a different host maps to the local
/// accounts where possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub kind: FileKind,
    /// POSIX mode bits (permissions only, no file-type bits)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
    pub atime: i64,
    /// Device numbers, meaningful for char/block nodes only
    pub dev_major: u64,
    pub dev_minor: u64,
    /// Target path for symlinks
    pub link_target: Option<String>,
}

impl FileMetadata {
    /// Build a metadata record from an lstat result.
    ///
    /// For symlinks the link target is read here; a dangling target is
    /// not an error, the recorded target is restored as-is.
    pub fn from_path(path: &Path, meta: &Metadata) -> Result<Self> {
        let kind = FileKind::from_file_type(&meta.file_type());

        let link_target = if kind == FileKind::Symlink {
            let target = std::fs::read_link(path)
                .map_err(|e| Error::io(format!("reading link target of {}", path.display()), e))?;
            Some(target.to_string_lossy().into_owned())
        } else {
            None
        };

        let rdev = meta.rdev();

        Ok(Self {
            kind,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            uname: resolve_user_name(meta.uid()),
            gname: resolve_group_name(meta.gid()),
            size: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            ctime: meta.ctime(),
            ctime_nsec: meta.ctime_nsec(),
            atime: meta.atime(),
            dev_major: nix::sys::stat::major(rdev),
            dev_minor: nix::sys::stat::minor(rdev),
            link_target,
        })
    }

    /// True when mtime and ctime both match the previous record, to
    /// nanosecond precision
    pub fn same_times(&self, other: &FileMetadata) -> bool {
        self.mtime == other.mtime
            && self.mtime_nsec == other.mtime_nsec
            && self.ctime == other.ctime
            && self.ctime_nsec == other.ctime_nsec
    }
}

fn resolve_user_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string())
}

fn resolve_group_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string())
}

/// Statistics for a backup run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStats {
    /// Regular files (and other content-bearing entries) backed up
    pub total_files: u64,

    /// Directories backed up
    pub total_directories: u64,

    /// Files sent as block patches against the previous run
    pub files_delta: u64,

    /// Files sent in full
    pub files_full: u64,

    /// Files carried over unchanged (no data emitted)
    pub files_unchanged: u64,

    /// Deletion markers emitted
    pub files_deleted: u64,

    /// Uncompressed bytes read from disk
    pub bytes_on_disk: u64,

    /// Encoded bytes handed to the segment sink
    pub bytes_compressed: u64,

    /// Segments flushed to the sink
    pub segments: u64,

    /// Paths skipped because their content could not be read
    pub broken_links: Vec<String>,
}

/// Statistics for a restore run
#[derive(Debug, Clone, Default)]
pub struct RestoreStats {
    pub files_restored: u64,
    pub files_patched: u64,
    pub directories_restored: u64,
    pub entries_deleted: u64,
    pub bytes_written: u64,

    /// Non-fatal per-entry problems (special file creation, chown of an
    /// unknown user). The restore continues past these.
    pub warnings: Vec<String>,
}
