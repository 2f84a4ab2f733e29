//! coldsnap - incremental block-level backup and restore
//!
//! This library backs up directory trees as a stream of compressed
//! (and optionally encrypted) segments. Repeat runs upload only the
//! blocks that changed since the previous run, using an rsync-style
//! rolling-checksum delta against the signatures kept in the manifest.

pub mod backup;
pub mod cancel;
pub mod checksum;
pub mod cli;
pub mod codec;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod restore;
pub mod signature;
pub mod storage;
pub mod stream;
pub mod throttle;
pub mod types;
pub mod walk;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
