//! Segment payload codec: compression composed with optional encryption
//!
//! Backup direction compresses then encrypts; restore reverses the two.
//! Both directions are strictly streaming, so segment boundaries are
//! free to fall anywhere in the coded byte stream.

mod compress;
mod crypto;

pub use compress::{
    one_shot_compress, one_shot_decompress, Compression, Compressor, Decompressor,
};
pub use crypto::{read_password_file, StreamCipher, SALT_HEADER_LEN, SALT_MAGIC};

use crate::error::Result;

/// Outbound pipeline for the backup stream
pub struct Encoder {
    compressor: Compressor,
    cipher: Option<StreamCipher>,
}

impl Encoder {
    /// Build the pipeline. With a password, also returns the plaintext
    /// salt header the caller must place at the very start of the
    /// segment stream.
    pub fn new(
        compression: Compression,
        password: Option<&[u8]>,
    ) -> Result<(Self, Option<[u8; SALT_HEADER_LEN]>)> {
        let (cipher, header) = match password {
            Some(pass) => {
                let (cipher, header) = StreamCipher::encryptor(pass)?;
                (Some(cipher), Some(header))
            }
            None => (None, None),
        };
        Ok((
            Self {
                compressor: Compressor::new(compression),
                cipher,
            },
            header,
        ))
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compressor.compress(data)?;
        match &mut self.cipher {
            Some(cipher) if !compressed.is_empty() => cipher.update(&compressed),
            _ => Ok(compressed),
        }
    }

    /// Flush the compressor and encrypt its tail. Call exactly once.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let tail = self.compressor.flush()?;
        match &mut self.cipher {
            Some(cipher) if !tail.is_empty() => cipher.update(&tail),
            _ => Ok(tail),
        }
    }
}

/// Inbound pipeline for the restore stream
pub struct Decoder {
    cipher: Option<StreamCipher>,
    decompressor: Decompressor,
}

impl Decoder {
    /// Pipeline for an unencrypted stream
    pub fn plain(compression: Compression) -> Self {
        Self {
            cipher: None,
            decompressor: Decompressor::new(compression),
        }
    }

    /// Pipeline for an encrypted stream. `header` is the 16-byte salt
    /// header stripped off the front of the first segment.
    pub fn encrypted(compression: Compression, password: &[u8], header: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: Some(StreamCipher::decryptor(password, header)?),
            decompressor: Decompressor::new(compression),
        })
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match &mut self.cipher {
            Some(cipher) => {
                let plaintext = cipher.update(data)?;
                self.decompressor.decompress(&plaintext)
            }
            None => self.decompressor.decompress(data),
        }
    }

    /// Drain the decompressor at end-of-stream. Call exactly once.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        self.decompressor.flush()
    }
}
