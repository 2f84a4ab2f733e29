//! AES-256-CFB stream encryption compatible with `openssl enc`
//!
//! The first segment of an encrypted stream starts with a 16-byte
//! plaintext header: the magic `Salted__` followed by an 8-byte random
//! salt. Key and IV derive from the passphrase and salt via the legacy
//! EVP_BytesToKey scheme (MD5, one round), so a stream written here can
//! be decrypted with the openssl command line and vice versa. CFB mode
//! keeps ciphertext exactly as long as plaintext, which the segment
//! size accounting relies on.

use crate::error::{Error, Result};
use openssl::hash::MessageDigest;
use openssl::pkcs5::bytes_to_key;
use openssl::symm::{Cipher, Crypter, Mode};
use std::path::Path;

pub const SALT_MAGIC: &[u8; 8] = b"Salted__";

/// Byte length of the plaintext salt header on the first segment
pub const SALT_HEADER_LEN: usize = 16;

/// Incremental AES-256-CFB transform for one stream direction
pub struct StreamCipher {
    crypter: Crypter,
    block_size: usize,
}

impl StreamCipher {
    /// Create an encryptor with a fresh random salt.
    ///
    /// Returns the cipher and the 16-byte header that must be written
    /// before any ciphertext.
    pub fn encryptor(password: &[u8]) -> Result<(Self, [u8; SALT_HEADER_LEN])> {
        let mut salt = [0u8; 8];
        openssl::rand::rand_bytes(&mut salt)?;

        let cipher = Self::with_salt(password, &salt, Mode::Encrypt)?;
        let mut header = [0u8; SALT_HEADER_LEN];
        header[..8].copy_from_slice(SALT_MAGIC);
        header[8..].copy_from_slice(&salt);
        Ok((cipher, header))
    }

    /// Create a decryptor from the header read off the first segment
    pub fn decryptor(password: &[u8], header: &[u8]) -> Result<Self> {
        if header.len() < SALT_HEADER_LEN || &header[..8] != SALT_MAGIC {
            return Err(Error::codec("stream is not encrypted (salt header missing)"));
        }
        Self::with_salt(password, &header[8..SALT_HEADER_LEN], Mode::Decrypt)
    }

    fn with_salt(password: &[u8], salt: &[u8], mode: Mode) -> Result<Self> {
        let cipher = Cipher::aes_256_cfb128();
        // One MD5 round over pass+salt, the EVP_BytesToKey default
        let key_iv = bytes_to_key(cipher, MessageDigest::md5(), password, Some(salt), 1)?;
        let iv = key_iv
            .iv
            .ok_or_else(|| Error::codec("key derivation produced no IV"))?;
        let crypter = Crypter::new(cipher, mode, &key_iv.key, Some(&iv))?;
        Ok(Self {
            crypter,
            block_size: cipher.block_size(),
        })
    }

    /// Transform the next run of bytes. CFB output length equals input
    /// length, so the result can replace the input in place in the
    /// segment pipeline.
    pub fn update(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; data.len() + self.block_size];
        let n = self.crypter.update(data, &mut out)?;
        out.truncate(n);
        Ok(out)
    }
}

/// Read the passphrase from a file, taking the first line only
pub fn read_password_file(path: &Path) -> Result<Vec<u8>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("reading passphrase file {}", path.display()), e))?;
    let line = contents.lines().next().unwrap_or("");
    if line.is_empty() {
        return Err(Error::config(format!(
            "passphrase file {} is empty",
            path.display()
        )));
    }
    Ok(line.as_bytes().to_vec())
}
