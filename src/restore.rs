//! Restore: replay a stored run's token stream onto a target tree
//!
//! Configuration problems (missing key for an encrypted run, absent
//! target directory) fail before anything is touched. Once replay
//! starts, per-entry problems such as an unresolvable owner or a device
//! node the process may not create become warnings and the restore
//! continues.

use crate::cancel::CancelToken;
use crate::codec::{read_password_file, Decoder, SALT_HEADER_LEN};
use crate::engine::RunMetadata;
use crate::error::{Error, Result};
use crate::storage::{LocalStore, SegmentSource};
use crate::stream::{ContentPlan, StreamToken, TokenBuffer};
use crate::types::{FileKind, FileMetadata, RestoreStats};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Restore a single stored level onto `target`.
///
/// Levels above zero patch files the earlier levels put in place, so
/// the target must already exist.
pub fn restore_level(
    store: &LocalStore,
    level: u32,
    target: &Path,
    pass_file: Option<&Path>,
    cancel: &CancelToken,
) -> Result<RestoreStats> {
    if !target.is_dir() {
        return Err(Error::config(format!(
            "restore target is not a directory: {}",
            target.display()
        )));
    }

    let run = store.load_run_metadata(level)?;
    let password = match (run.encrypted, pass_file) {
        (true, Some(path)) => Some(read_password_file(path)?),
        (true, None) => {
            return Err(Error::config(
                "run is encrypted but no password file was given",
            ))
        }
        (false, _) => None,
    };
    info!(level, target = %target.display(), "restoring level");

    let source = store.source_for_level(level)?;
    let mut replayer = Replayer::new(target, &run);
    replay(source, &run, password.as_deref(), &mut replayer, cancel)?;
    Ok(replayer.stats)
}

/// Decode and structurally check a stored level without writing
/// anything
pub fn verify_level(
    store: &LocalStore,
    level: u32,
    pass_file: Option<&Path>,
    cancel: &CancelToken,
) -> Result<VerifyStats> {
    let run = store.load_run_metadata(level)?;
    let password = match (run.encrypted, pass_file) {
        (true, Some(path)) => Some(read_password_file(path)?),
        (true, None) => {
            return Err(Error::config(
                "run is encrypted but no password file was given",
            ))
        }
        (false, _) => None,
    };

    let source = store.source_for_level(level)?;
    let mut verifier = Verifier::default();
    replay(source, &run, password.as_deref(), &mut verifier, cancel)?;
    Ok(verifier.stats)
}

/// Restore every stored level in order, creating the target if needed
pub fn restore_latest(
    store: &LocalStore,
    target: &Path,
    pass_file: Option<&Path>,
    cancel: &CancelToken,
) -> Result<RestoreStats> {
    let latest = store
        .latest_level()?
        .ok_or_else(|| Error::storage("store contains no backup levels"))?;
    std::fs::create_dir_all(target).map_err(|e| Error::io("creating restore target", e))?;

    let mut total = RestoreStats::default();
    for level in 0..=latest {
        let stats = restore_level(store, level, target, pass_file, cancel)?;
        total.files_restored += stats.files_restored;
        total.files_patched += stats.files_patched;
        total.directories_restored += stats.directories_restored;
        total.entries_deleted += stats.entries_deleted;
        total.bytes_written += stats.bytes_written;
        total.warnings.extend(stats.warnings);
    }
    Ok(total)
}

/// Consumes the token stream of one level in arrival order
trait TokenVisitor {
    fn apply(&mut self, token: StreamToken) -> Result<()>;

    /// Called once after the last token
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

fn replay<S: SegmentSource, V: TokenVisitor>(
    mut source: S,
    run: &RunMetadata,
    password: Option<&[u8]>,
    visitor: &mut V,
    cancel: &CancelToken,
) -> Result<()> {
    let mut decoder: Option<Decoder> = None;
    let mut buffer = TokenBuffer::new();

    while let Some(segment) = source.next_segment()? {
        cancel.check()?;
        // The first segment carries the plaintext salt header when the
        // run is encrypted
        let payload = if decoder.is_none() && run.encrypted {
            let pass = password
                .ok_or_else(|| Error::config("run is encrypted but no password was given"))?;
            if segment.len() < SALT_HEADER_LEN {
                return Err(Error::stream("first segment shorter than salt header"));
            }
            decoder = Some(Decoder::encrypted(
                run.compression,
                pass,
                &segment[..SALT_HEADER_LEN],
            )?);
            &segment[SALT_HEADER_LEN..]
        } else {
            if decoder.is_none() {
                decoder = Some(Decoder::plain(run.compression));
            }
            &segment[..]
        };

        let dec = decoder
            .as_mut()
            .ok_or_else(|| Error::stream("decoder not initialized"))?;
        let decoded = dec.decode(payload)?;
        buffer.push(&decoded);
        drain(&mut buffer, visitor, cancel)?;
    }

    if let Some(mut dec) = decoder {
        let tail = dec.finish()?;
        buffer.push(&tail);
        drain(&mut buffer, visitor, cancel)?;
    }
    if !buffer.is_empty() {
        return Err(Error::stream(format!(
            "{} trailing bytes do not form a token (truncated run?)",
            buffer.remaining()
        )));
    }
    visitor.finish()?;
    Ok(())
}

fn drain<V: TokenVisitor>(
    buffer: &mut TokenBuffer,
    visitor: &mut V,
    cancel: &CancelToken,
) -> Result<()> {
    while let Some(token) = buffer.next_token()? {
        cancel.check()?;
        visitor.apply(token)?;
    }
    Ok(())
}

/// Content tokens accumulate into this until the next header closes the
/// file
struct OpenFile {
    path: PathBuf,
    meta: FileMetadata,
    file: std::fs::File,
    plan: ContentPlan,
}

/// Applies tokens to the target tree in arrival order
struct Replayer {
    target: PathBuf,
    block_size: u64,
    open: Option<OpenFile>,
    stats: RestoreStats,
}

impl Replayer {
    fn new(target: &Path, run: &RunMetadata) -> Self {
        Self {
            target: target.to_path_buf(),
            block_size: run.block_size as u64,
            open: None,
            stats: RestoreStats::default(),
        }
    }
}

impl TokenVisitor for Replayer {
    fn finish(&mut self) -> Result<()> {
        self.finalize_open_file()
    }

    fn apply(&mut self, token: StreamToken) -> Result<()> {
        match token {
            StreamToken::DirHeader { path, meta } => {
                self.finalize_open_file()?;
                let abs = self.resolve(&path)?;
                // A former file or link may hold the path from an
                // earlier level
                if let Ok(existing) = abs.symlink_metadata() {
                    if !existing.file_type().is_dir() {
                        if let Err(e) = remove_path(&abs) {
                            self.warn(format!("cannot clear {} for a directory: {}", path, e));
                        }
                    }
                }
                match std::fs::create_dir_all(&abs) {
                    Ok(()) => {
                        self.apply_metadata(&abs, &meta);
                        self.stats.directories_restored += 1;
                    }
                    Err(e) => self.warn(format!("cannot create directory {}: {}", path, e)),
                }
            }
            StreamToken::FileHeader { path, meta, plan } => {
                self.finalize_open_file()?;
                self.begin_file(&path, meta, plan)?;
            }
            StreamToken::DeleteMarker { path } => {
                self.finalize_open_file()?;
                let abs = self.resolve(&path)?;
                debug!(path = %path, "deleting");
                match remove_path(&abs) {
                    Ok(()) => self.stats.entries_deleted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => self.warn(format!("cannot delete {}: {}", path, e)),
                }
            }
            StreamToken::DataBlock { bytes } => {
                let open = self.open_content_file(ContentPlan::Full)?;
                open.file
                    .write_all(&bytes)
                    .map_err(|e| Error::io("writing restored content", e))?;
                self.stats.bytes_written += bytes.len() as u64;
            }
            StreamToken::PatchBlock { block_index, bytes } => {
                let offset = block_index * self.block_size;
                let open = self.open_content_file(ContentPlan::Patch)?;
                open.file
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| Error::io("seeking patch offset", e))?;
                open.file
                    .write_all(&bytes)
                    .map_err(|e| Error::io("writing patch block", e))?;
                self.stats.bytes_written += bytes.len() as u64;
            }
        }
        Ok(())
    }
}

impl Replayer {
    fn open_content_file(&mut self, expected: ContentPlan) -> Result<&mut OpenFile> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| Error::stream("content token without a file header"))?;
        if open.plan != expected {
            return Err(Error::stream("content token does not match announced plan"));
        }
        Ok(open)
    }

    fn begin_file(&mut self, rel: &str, meta: FileMetadata, plan: ContentPlan) -> Result<()> {
        let abs = self.resolve(rel)?;
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating parent of {}", rel), e))?;
        }

        // If an earlier level left a symlink or directory at the path,
        // opening through it would write somewhere else entirely
        if plan != ContentPlan::None {
            if let Ok(existing) = abs.symlink_metadata() {
                if !existing.file_type().is_file() {
                    remove_path(&abs)
                        .map_err(|e| Error::io(format!("clearing older entry at {}", rel), e))?;
                }
            }
        }

        match plan {
            ContentPlan::None => {
                self.create_contentless(rel, &abs, &meta);
                self.stats.files_restored += 1;
            }
            ContentPlan::Full => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&abs)
                    .map_err(|e| Error::io(format!("creating {}", rel), e))?;
                self.open = Some(OpenFile {
                    path: abs,
                    meta,
                    file,
                    plan,
                });
                self.stats.files_restored += 1;
            }
            ContentPlan::Patch => {
                // Patches land on whatever the previous levels restored
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&abs)
                    .map_err(|e| Error::io(format!("opening {} for patching", rel), e))?;
                self.open = Some(OpenFile {
                    path: abs,
                    meta,
                    file,
                    plan,
                });
                self.stats.files_restored += 1;
                self.stats.files_patched += 1;
            }
        }
        Ok(())
    }

    /// Close the file whose content tokens just ended
    fn finalize_open_file(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        // A patched file keeps stale blocks past the new end until now
        open.file
            .set_len(open.meta.size)
            .map_err(|e| Error::io("truncating restored file", e))?;
        drop(open.file);
        self.apply_metadata(&open.path, &open.meta);
        Ok(())
    }

    fn create_contentless(&mut self, rel: &str, abs: &Path, meta: &FileMetadata) {
        // Replacing an older incarnation of the path
        if let Err(e) = remove_path(abs) {
            if e.kind() != std::io::ErrorKind::NotFound {
                self.warn(format!("cannot clear older entry at {}: {}", rel, e));
                return;
            }
        }

        let result: std::io::Result<()> = match meta.kind {
            FileKind::Symlink => {
                let Some(dest) = meta.link_target.as_deref() else {
                    self.warn(format!("symlink {} has no recorded target", rel));
                    return;
                };
                std::os::unix::fs::symlink(dest, abs)
            }
            FileKind::Fifo => nix::unistd::mkfifo(
                abs,
                nix::sys::stat::Mode::from_bits_truncate(meta.mode),
            )
            .map_err(std::io::Error::from),
            FileKind::CharDevice | FileKind::BlockDevice => {
                let sflag = if meta.kind == FileKind::CharDevice {
                    nix::sys::stat::SFlag::S_IFCHR
                } else {
                    nix::sys::stat::SFlag::S_IFBLK
                };
                nix::sys::stat::mknod(
                    abs,
                    sflag,
                    nix::sys::stat::Mode::from_bits_truncate(meta.mode),
                    nix::sys::stat::makedev(meta.dev_major, meta.dev_minor),
                )
                .map_err(std::io::Error::from)
            }
            other => {
                self.warn(format!("{}: unexpected contentless kind {:?}", rel, other));
                return;
            }
        };

        match result {
            // Ownership and timestamps are never set on symlinks
            Ok(()) if meta.kind != FileKind::Symlink => self.apply_metadata(abs, meta),
            Ok(()) => {}
            Err(e) => self.warn(format!("cannot create {}: {}", rel, e)),
        }
    }

    /// Ownership, mode and timestamps. Failures are warnings: a restore
    /// by an unprivileged user still produces usable content.
    fn apply_metadata(&mut self, abs: &Path, meta: &FileMetadata) {
        let uid = resolve_uid(&meta.uname).unwrap_or(meta.uid);
        let gid = resolve_gid(&meta.gname).unwrap_or(meta.gid);
        if let Err(e) = nix::unistd::chown(
            abs,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        ) {
            self.warn(format!("chown {}: {}", abs.display(), e));
        }

        if let Err(e) =
            std::fs::set_permissions(abs, std::fs::Permissions::from_mode(meta.mode))
        {
            self.warn(format!("chmod {}: {}", abs.display(), e));
        }

        if let Err(e) = filetime::set_file_times(
            abs,
            filetime::FileTime::from_unix_time(meta.atime, 0),
            filetime::FileTime::from_unix_time(meta.mtime, meta.mtime_nsec as u32),
        ) {
            self.warn(format!("setting times on {}: {}", abs.display(), e));
        }
    }

    /// Join a stream path onto the target, rejecting escapes
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let path = Path::new(rel);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::stream(format!(
                "stream path escapes restore target: {}",
                rel
            )));
        }
        Ok(self.target.join(path))
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.stats.warnings.push(message);
    }
}

/// Totals from a verification pass
#[derive(Debug, Clone, Default)]
pub struct VerifyStats {
    pub tokens: u64,
    pub files: u64,
    pub directories: u64,
    pub deletions: u64,
    pub content_bytes: u64,
}

/// Checks token ordering and counts content without touching the
/// filesystem
#[derive(Debug, Default)]
struct Verifier {
    stats: VerifyStats,
    open_plan: Option<ContentPlan>,
}

impl TokenVisitor for Verifier {
    fn apply(&mut self, token: StreamToken) -> Result<()> {
        self.stats.tokens += 1;
        match token {
            StreamToken::FileHeader { plan, .. } => {
                self.stats.files += 1;
                self.open_plan = match plan {
                    ContentPlan::None => None,
                    other => Some(other),
                };
            }
            StreamToken::DirHeader { .. } => {
                self.stats.directories += 1;
                self.open_plan = None;
            }
            StreamToken::DeleteMarker { .. } => {
                self.stats.deletions += 1;
                self.open_plan = None;
            }
            StreamToken::DataBlock { bytes } => {
                if self.open_plan != Some(ContentPlan::Full) {
                    return Err(Error::stream("data block outside a full-content file"));
                }
                self.stats.content_bytes += bytes.len() as u64;
            }
            StreamToken::PatchBlock { bytes, .. } => {
                if self.open_plan != Some(ContentPlan::Patch) {
                    return Err(Error::stream("patch block outside a patched file"));
                }
                self.stats.content_bytes += bytes.len() as u64;
            }
        }
        Ok(())
    }
}

/// Remove whatever sits at the path without following a final symlink
fn remove_path(abs: &Path) -> std::io::Result<()> {
    let existing = abs.symlink_metadata()?;
    if existing.file_type().is_dir() {
        std::fs::remove_dir_all(abs)
    } else {
        std::fs::remove_file(abs)
    }
}

fn resolve_uid(name: &str) -> Option<u32> {
    nix::unistd::User::from_name(name)
        .ok()
        .flatten()
        .map(|u| u.uid.as_raw())
}

fn resolve_gid(name: &str) -> Option<u32> {
    nix::unistd::Group::from_name(name)
        .ok()
        .flatten()
        .map(|g| g.gid.as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::engine::EngineKind;

    fn run_meta() -> RunMetadata {
        RunMetadata {
            engine: EngineKind::RsyncV2,
            compression: Compression::Gzip,
            encrypted: false,
            block_size: 4096,
            level: 0,
            segment_count: 1,
        }
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let replayer = Replayer::new(dir.path(), &run_meta());
        assert!(replayer.resolve("ok/nested").is_ok());
        assert!(replayer.resolve("../escape").is_err());
        assert!(replayer.resolve("a/../../b").is_err());
        assert!(replayer.resolve("/etc/passwd").is_err());
    }

    #[test]
    fn test_content_token_without_header_is_stream_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut replayer = Replayer::new(dir.path(), &run_meta());
        let result = replayer.apply(StreamToken::DataBlock {
            bytes: vec![1, 2, 3],
        });
        assert!(matches!(result, Err(Error::Stream { .. })));
    }

    #[test]
    fn test_delete_marker_ignores_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut replayer = Replayer::new(dir.path(), &run_meta());
        replayer
            .apply(StreamToken::DeleteMarker {
                path: "never-existed".into(),
            })
            .unwrap();
        assert_eq!(replayer.stats.entries_deleted, 0);
        assert!(replayer.stats.warnings.is_empty());
    }

    #[test]
    fn test_verify_replay_over_memory_segments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![7u8; 6000]).unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();

        let config = crate::config::Config::default();
        let cancel = CancelToken::new();
        let mut sink = crate::storage::MemorySink::default();
        crate::backup::run_backup(&config, dir.path(), None, &mut sink, &cancel).unwrap();

        let source = crate::storage::MemorySource::new(sink.segments);
        let mut verifier = Verifier::default();
        replay(source, &run_meta(), None, &mut verifier, &cancel).unwrap();
        assert_eq!(verifier.stats.files, 1);
        assert_eq!(verifier.stats.directories, 1);
        assert_eq!(verifier.stats.content_bytes, 6000);
    }

    #[test]
    fn test_missing_target_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store"));
        let result = restore_level(
            &store,
            0,
            &dir.path().join("no-such-target"),
            None,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
