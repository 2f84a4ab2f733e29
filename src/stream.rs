//! Serialized backup stream format
//!
//! The stream is a flat sequence of self-describing tokens, each framed
//! as a little-endian u32 length followed by its bincode encoding. The
//! framed stream is what goes through the codec pipeline; segment
//! boundaries fall anywhere, including inside a frame, so the reader
//! reassembles tokens from a byte buffer fed one decoded segment at a
//! time.
//!
//! Entry content is not length-counted up front: a file's data or patch
//! blocks simply follow its header, and the content ends when the next
//! header (or end of stream) appears.

use crate::error::{Error, Result};
use crate::types::FileMetadata;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

/// Upper bound on a single frame, to fail fast on corrupt length words
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// What follows a file header in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentPlan {
    /// No content tokens (directories use DirHeader; this covers
    /// symlinks, special files, empty files, metadata-only changes)
    None,

    /// Full content as a run of `DataBlock` tokens
    Full,

    /// Changed blocks of an incremental as `PatchBlock` tokens
    Patch,
}

/// One record of the backup stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamToken {
    /// A non-directory entry begins; its content tokens follow
    FileHeader {
        path: String,
        meta: FileMetadata,
        plan: ContentPlan,
    },

    /// A directory entry (never has content)
    DirHeader { path: String, meta: FileMetadata },

    /// The entry existed in the previous level and is gone now
    DeleteMarker { path: String },

    /// A run of full-content bytes for the current file
    DataBlock { bytes: Vec<u8> },

    /// One changed block for an in-place patch of the current file
    PatchBlock { block_index: u64, bytes: Vec<u8> },
}

/// Frame a token for the outbound stream
pub fn encode_token(token: &StreamToken) -> Result<Vec<u8>> {
    let body = bincode::serialize(token)
        .map_err(|e| Error::stream(format!("encoding token: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::stream(format!(
            "token frame too large: {} bytes",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reassembles tokens from decoded segment bytes.
///
/// Frames may span segment boundaries; whatever does not yet form a
/// complete frame stays buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct TokenBuffer {
    buf: BytesMut,
}

impl TokenBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete token, or None if more bytes are needed
    pub fn next_token(&mut self) -> Result<Option<StreamToken>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::stream(format!(
                "frame length {} exceeds limit (corrupt stream?)",
                len
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let body = self.buf.split_to(len);
        let token = bincode::deserialize(&body)
            .map_err(|e| Error::stream(format!("decoding token: {}", e)))?;
        Ok(Some(token))
    }

    /// True when no partial frame is left over.
    ///
    /// A non-empty buffer at end of stream means the final segment was
    /// truncated.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileKind, FileMetadata};

    fn sample_meta() -> FileMetadata {
        FileMetadata {
            kind: FileKind::Regular,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            uname: "user".into(),
            gname: "user".into(),
            size: 3,
            mtime: 1_700_000_000,
            mtime_nsec: 0,
            ctime: 1_700_000_000,
            ctime_nsec: 0,
            atime: 1_700_000_000,
            dev_major: 0,
            dev_minor: 0,
            link_target: None,
        }
    }

    fn sample_tokens() -> Vec<StreamToken> {
        vec![
            StreamToken::DirHeader {
                path: "sub".into(),
                meta: sample_meta(),
            },
            StreamToken::FileHeader {
                path: "sub/file".into(),
                meta: sample_meta(),
                plan: ContentPlan::Full,
            },
            StreamToken::DataBlock {
                bytes: vec![1, 2, 3],
            },
            StreamToken::FileHeader {
                path: "patched".into(),
                meta: sample_meta(),
                plan: ContentPlan::Patch,
            },
            StreamToken::PatchBlock {
                block_index: 7,
                bytes: vec![9; 16],
            },
            StreamToken::DeleteMarker {
                path: "gone".into(),
            },
        ]
    }

    #[test]
    fn test_round_trip_whole_frames() {
        let tokens = sample_tokens();
        let mut buffer = TokenBuffer::new();
        for token in &tokens {
            buffer.push(&encode_token(token).unwrap());
        }
        let mut decoded = Vec::new();
        while let Some(token) = buffer.next_token().unwrap() {
            decoded.push(token);
        }
        assert_eq!(decoded, tokens);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frames_split_across_pushes() {
        // Feed the byte stream one byte at a time; frames must
        // reassemble regardless of split points
        let tokens = sample_tokens();
        let mut wire = Vec::new();
        for token in &tokens {
            wire.extend(encode_token(token).unwrap());
        }

        let mut buffer = TokenBuffer::new();
        let mut decoded = Vec::new();
        for &byte in &wire {
            buffer.push(&[byte]);
            while let Some(token) = buffer.next_token().unwrap() {
                decoded.push(token);
            }
        }
        assert_eq!(decoded, tokens);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_truncated_frame_stays_pending() {
        let frame = encode_token(&StreamToken::DeleteMarker { path: "x".into() }).unwrap();
        let mut buffer = TokenBuffer::new();
        buffer.push(&frame[..frame.len() - 1]);
        assert!(buffer.next_token().unwrap().is_none());
        assert!(!buffer.is_empty());

        buffer.push(&frame[frame.len() - 1..]);
        assert!(buffer.next_token().unwrap().is_some());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_corrupt_length_word_rejected() {
        let mut buffer = TokenBuffer::new();
        buffer.push(&u32::MAX.to_le_bytes());
        assert!(buffer.next_token().is_err());
    }
}
