//! Backup run orchestration
//!
//! A run walks the source tree, diffs every entry against the previous
//! manifest, encodes the resulting token stream through the codec
//! pipeline and cuts it into bounded segments. Walk and encode happen
//! on a producer thread; the calling thread consumes coded bytes off a
//! small bounded queue and owns the segment sink, so a slow sink
//! back-pressures the walk instead of buffering the whole stream.

use crate::cancel::CancelToken;
use crate::codec::{read_password_file, Encoder};
use crate::config::{Config, DATA_CHUNK_SIZE, QUEUE_DEPTH};
use crate::delta::{changed_blocks, compute_delta, summarize};
use crate::engine::RunMetadata;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestEntry, RunCounters};
use crate::signature::SignatureTable;
use crate::storage::{LocalStore, NullSink, SegmentSink};
use crate::stream::{encode_token, ContentPlan, StreamToken};
use crate::throttle::ThrottledSink;
use crate::types::{BackupStats, FileKind, FileMetadata};
use crate::walk::walk_tree;
use bytes::BytesMut;
use crossbeam_channel::bounded;
use std::path::Path;
use tracing::{debug, info, warn};

/// Run one backup level of `source` into `store`
pub fn backup(
    config: &Config,
    source: &Path,
    store: &LocalStore,
    cancel: &CancelToken,
) -> Result<BackupStats> {
    config.validate()?;
    if !source.is_dir() {
        return Err(Error::config(format!(
            "backup source is not a directory: {}",
            source.display()
        )));
    }

    let previous = Manifest::load(&store.manifest_path(), config.compression)?;
    let level = previous.as_ref().map(|m| m.level + 1).unwrap_or(0);
    info!(level, source = %source.display(), "starting backup");

    if config.dry_run {
        let mut sink = NullSink::default();
        let (_, stats) = run_backup(config, source, previous, &mut sink, cancel)?;
        info!(segments = sink.segments, bytes = sink.bytes, "dry run complete");
        return Ok(stats);
    }

    let mut sink = ThrottledSink::new(store.sink_for_level(level)?, config.bwlimit);
    let (manifest, mut stats) = run_backup(config, source, previous, &mut sink, cancel)?;

    let dir_sink = sink.into_inner();
    stats.segments = dir_sink.segments_written();
    store.save_run_metadata(&RunMetadata {
        engine: config.engine,
        compression: config.compression,
        encrypted: config.encryption_enabled(),
        block_size: config.block_size,
        level,
        segment_count: stats.segments,
    })?;
    // Committed last: a crash before this point leaves the previous
    // manifest in place and the next run repeats this level
    manifest.save(&store.manifest_path(), config.compression)?;

    info!(
        files = stats.total_files,
        delta = stats.files_delta,
        unchanged = stats.files_unchanged,
        segments = stats.segments,
        "backup complete"
    );
    Ok(stats)
}

/// Walk, encode and segment against an arbitrary sink.
///
/// Returns the manifest describing the new state; the caller decides
/// whether to commit it.
pub fn run_backup<S: SegmentSink>(
    config: &Config,
    source: &Path,
    previous: Option<Manifest>,
    sink: &mut S,
    cancel: &CancelToken,
) -> Result<(Manifest, BackupStats)> {
    let password = match &config.encrypt_pass_file {
        Some(path) => Some(read_password_file(path)?),
        None => None,
    };

    // Signatures from an older engine or block size cannot be diffed
    // against; the run still sees the old entries for deletion markers
    let reuse_content = match &previous {
        Some(prev) => {
            let compatible =
                prev.engine == config.engine && prev.block_size == config.block_size;
            if !compatible {
                warn!(
                    prev_engine = %prev.engine,
                    prev_block_size = prev.block_size,
                    "previous manifest incompatible, re-uploading all content"
                );
            }
            compatible
        }
        None => true,
    };

    let (tx, rx) = bounded::<Vec<u8>>(QUEUE_DEPTH);
    let producer = {
        let config = config.clone();
        let source = source.to_path_buf();
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            produce_stream(&config, &source, previous, reuse_content, password, tx, &cancel)
        })
    };

    let mut chunker = Chunker::new(config.max_segment_size);
    let mut consume_err = None;
    for coded in rx {
        if consume_err.is_none() {
            if let Err(e) = chunker.push(&coded, sink) {
                // Keep draining so the producer is never stuck on send
                consume_err = Some(e);
            }
        }
    }

    let produced = producer
        .join()
        .map_err(|_| Error::storage("backup producer thread panicked"))?;
    let (manifest, stats) = produced?;
    if let Some(e) = consume_err {
        return Err(e);
    }
    chunker.finish(sink)?;
    Ok((manifest, stats))
}

#[allow(clippy::too_many_arguments)]
fn produce_stream(
    config: &Config,
    source: &Path,
    previous: Option<Manifest>,
    reuse_content: bool,
    password: Option<Vec<u8>>,
    tx: crossbeam_channel::Sender<Vec<u8>>,
    cancel: &CancelToken,
) -> Result<(Manifest, BackupStats)> {
    let algo = config.engine.weak_algo();
    let mut manifest = Manifest::new(config.engine, config.block_size);
    manifest.level = previous.as_ref().map(|m| m.level + 1).unwrap_or(0);
    let mut stats = BackupStats::default();

    let (mut encoder, salt_header) = Encoder::new(
        config.compression,
        password.as_deref(),
    )?;
    // The salt header rides in front of the coded stream in plaintext
    if let Some(header) = salt_header {
        send(&tx, header.to_vec(), &mut stats)?;
    }

    let emit = |encoder: &mut Encoder, token: &StreamToken, stats: &mut BackupStats| -> Result<()> {
        let coded = encoder.encode(&encode_token(token)?)?;
        if coded.is_empty() {
            return Ok(());
        }
        send(&tx, coded, stats)
    };

    for item in walk_tree(source, config.dereference_symlinks) {
        cancel.check()?;
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                stats.broken_links.push(e.to_string());
                continue;
            }
        };
        if entry.rel.split('/').any(|part| config.is_excluded(part)) {
            debug!(path = %entry.rel, "excluded");
            continue;
        }

        let meta = match FileMetadata::from_path(&entry.abs, &entry.meta) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.rel, error = %e, "skipping entry without metadata");
                stats.broken_links.push(entry.rel.clone());
                continue;
            }
        };

        match meta.kind {
            FileKind::Socket => {
                debug!(path = %entry.rel, "skipping socket");
                continue;
            }
            FileKind::Directory => {
                emit(
                    &mut encoder,
                    &StreamToken::DirHeader {
                        path: entry.rel.clone(),
                        meta: meta.clone(),
                    },
                    &mut stats,
                )?;
                stats.total_directories += 1;
                manifest.entries.insert(
                    entry.rel,
                    ManifestEntry {
                        meta,
                        signature: None,
                    },
                );
            }
            kind if !kind.has_content() => {
                // Symlinks and device/fifo nodes are metadata-only
                emit(
                    &mut encoder,
                    &StreamToken::FileHeader {
                        path: entry.rel.clone(),
                        meta: meta.clone(),
                        plan: ContentPlan::None,
                    },
                    &mut stats,
                )?;
                stats.total_files += 1;
                manifest.entries.insert(
                    entry.rel,
                    ManifestEntry {
                        meta,
                        signature: None,
                    },
                );
            }
            _ => {
                if reuse_content {
                    if let Some(prev) = previous.as_ref().filter(|m| m.is_unchanged(&entry.rel, &meta)) {
                        stats.files_unchanged += 1;
                        stats.total_files += 1;
                        manifest.entries.insert(
                            entry.rel.clone(),
                            ManifestEntry {
                                meta,
                                signature: prev.signature_for(&entry.rel).cloned(),
                            },
                        );
                        continue;
                    }
                }

                // Content is read before the header goes out, so a read
                // failure skips the entry without corrupting the stream
                let content = match std::fs::read(&entry.abs) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(path = %entry.rel, error = %e, "cannot read content, skipping");
                        stats.broken_links.push(entry.rel.clone());
                        continue;
                    }
                };
                stats.bytes_on_disk += content.len() as u64;
                stats.total_files += 1;

                let prev_signature = if reuse_content {
                    previous
                        .as_ref()
                        .and_then(|m| m.signature_for(&entry.rel))
                        .filter(|s| s.block_size == config.block_size && s.block_count() > 0)
                } else {
                    None
                };

                match prev_signature {
                    Some(table) => {
                        let tokens = compute_delta(&content, table, algo);
                        let changed = changed_blocks(&tokens, table, content.len() as u64);
                        let summary = summarize(&tokens);
                        debug!(
                            path = %entry.rel,
                            matched = summary.matched_blocks,
                            literal = summary.literal_bytes,
                            changed = changed.len(),
                            "patching"
                        );
                        emit(
                            &mut encoder,
                            &StreamToken::FileHeader {
                                path: entry.rel.clone(),
                                meta: meta.clone(),
                                plan: ContentPlan::Patch,
                            },
                            &mut stats,
                        )?;
                        let bs = config.block_size as usize;
                        for index in changed {
                            let start = index as usize * bs;
                            let end = (start + bs).min(content.len());
                            emit(
                                &mut encoder,
                                &StreamToken::PatchBlock {
                                    block_index: index,
                                    bytes: content[start..end].to_vec(),
                                },
                                &mut stats,
                            )?;
                        }
                        stats.files_delta += 1;
                    }
                    None => {
                        emit(
                            &mut encoder,
                            &StreamToken::FileHeader {
                                path: entry.rel.clone(),
                                meta: meta.clone(),
                                plan: ContentPlan::Full,
                            },
                            &mut stats,
                        )?;
                        for chunk in content.chunks(DATA_CHUNK_SIZE) {
                            emit(
                                &mut encoder,
                                &StreamToken::DataBlock {
                                    bytes: chunk.to_vec(),
                                },
                                &mut stats,
                            )?;
                        }
                        stats.files_full += 1;
                    }
                }

                let signature =
                    SignatureTable::from_bytes(&content, config.block_size, algo);
                manifest.entries.insert(
                    entry.rel,
                    ManifestEntry {
                        meta,
                        signature: Some(signature),
                    },
                );
            }
        }
    }

    // Everything the previous level had and this walk did not see is
    // marked deleted, in sorted order
    if let Some(prev) = &previous {
        for path in prev.entries.keys() {
            if !manifest.entries.contains_key(path) {
                cancel.check()?;
                emit(
                    &mut encoder,
                    &StreamToken::DeleteMarker { path: path.clone() },
                    &mut stats,
                )?;
                stats.files_deleted += 1;
            }
        }
    }

    let tail = encoder.finish()?;
    if !tail.is_empty() {
        send(&tx, tail, &mut stats)?;
    }

    manifest.counters = RunCounters {
        total_files: stats.total_files,
        total_directories: stats.total_directories,
        backup_size_on_disk: stats.bytes_on_disk,
        backup_size_compressed: stats.bytes_compressed,
        broken_links: stats.broken_links.clone(),
    };
    Ok((manifest, stats))
}

fn send(
    tx: &crossbeam_channel::Sender<Vec<u8>>,
    coded: Vec<u8>,
    stats: &mut BackupStats,
) -> Result<()> {
    stats.bytes_compressed += coded.len() as u64;
    tx.send(coded)
        .map_err(|_| Error::storage("segment consumer stopped"))
}

/// Cuts the coded byte stream into segments. Every segment except the
/// last is exactly `max` bytes.
struct Chunker {
    buf: BytesMut,
    max: usize,
}

impl Chunker {
    fn new(max: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max,
        }
    }

    fn push<S: SegmentSink>(&mut self, data: &[u8], sink: &mut S) -> Result<()> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.max {
            let segment = self.buf.split_to(self.max).freeze();
            sink.put_segment(segment)?;
        }
        Ok(())
    }

    fn finish<S: SegmentSink>(&mut self, sink: &mut S) -> Result<()> {
        if !self.buf.is_empty() {
            let segment = self.buf.split().freeze();
            sink.put_segment(segment)?;
        }
        Ok(())
    }
}
