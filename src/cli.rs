//! CLI argument parsing for coldsnap

use crate::codec::Compression;
use crate::config::Config;
use crate::engine::EngineKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// coldsnap - incremental block-level backup and restore
#[derive(Parser, Debug)]
#[command(name = "coldsnap")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up a directory tree into a segment store
    Backup(BackupArgs),

    /// Restore a stored backup onto a target directory
    Restore(RestoreArgs),

    /// Decode a stored backup and check its structure, writing nothing
    Verify(VerifyArgs),

    /// Show the levels present in a segment store
    Info(InfoArgs),
}

/// Arguments for the backup command
#[derive(Parser, Debug)]
pub struct BackupArgs {
    /// Directory tree to back up
    pub source: PathBuf,

    /// Segment store directory
    pub store: PathBuf,

    /// Block size for signatures and patches in bytes
    #[arg(long)]
    pub block_size: Option<u32>,

    /// Upper bound for segment size in bytes
    #[arg(long)]
    pub max_segment_size: Option<usize>,

    /// Compression algorithm (gzip, bzip2, xz)
    #[arg(long)]
    pub compression: Option<Compression>,

    /// Incremental engine (rsync, rsyncv2)
    #[arg(long)]
    pub engine: Option<EngineKind>,

    /// File holding the encryption passphrase (first line)
    #[arg(long)]
    pub encrypt_pass_file: Option<PathBuf>,

    /// Skip entries whose name contains this substring
    #[arg(long)]
    pub exclude: Option<String>,

    /// Follow symlinks instead of recording them
    #[arg(short = 'L', long)]
    pub dereference: bool,

    /// Compute everything but write nothing
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Bandwidth limit for segment writes in KiB/s (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub bwlimit: u64,

    /// Configuration file path
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

impl BackupArgs {
    /// Convert CLI args to Config; flags override the config file
    pub fn to_config(&self, verbose: u8) -> crate::error::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::default(),
        };

        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(max_segment_size) = self.max_segment_size {
            config.max_segment_size = max_segment_size;
        }
        if let Some(compression) = self.compression {
            config.compression = compression;
        }
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if self.encrypt_pass_file.is_some() {
            config.encrypt_pass_file = self.encrypt_pass_file.clone();
        }
        if self.exclude.is_some() {
            config.exclude = self.exclude.clone();
        }
        config.dereference_symlinks |= self.dereference;
        config.dry_run |= self.dry_run;
        if self.bwlimit > 0 {
            config.bwlimit = self.bwlimit;
        }
        config.verbose = verbose;

        config.validate()?;
        Ok(config)
    }
}

/// Arguments for the restore command
#[derive(Parser, Debug)]
pub struct RestoreArgs {
    /// Segment store directory
    pub store: PathBuf,

    /// Directory to restore into
    pub target: PathBuf,

    /// Restore only this level onto an existing tree
    /// (default: replay all levels from zero)
    #[arg(long)]
    pub level: Option<u32>,

    /// File holding the decryption passphrase (first line)
    #[arg(long)]
    pub encrypt_pass_file: Option<PathBuf>,
}

/// Arguments for the verify command
#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Segment store directory
    pub store: PathBuf,

    /// Verify only this level (default: every level)
    #[arg(long)]
    pub level: Option<u32>,

    /// File holding the decryption passphrase (first line)
    #[arg(long)]
    pub encrypt_pass_file: Option<PathBuf>,
}

/// Arguments for the info command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Segment store directory
    pub store: PathBuf,
}

impl clap::ValueEnum for Compression {
    fn value_variants<'a>() -> &'a [Self] {
        &[Compression::Gzip, Compression::Bzip2, Compression::Xz]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

impl clap::ValueEnum for EngineKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[EngineKind::RsyncV1, EngineKind::RsyncV2]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}
