//! Pluggable codecs: compressor, AEAD cipher and hash, each identified by a
//! one-byte id in the file header.
//!
//! The write pipeline is compress → encrypt; the read pipeline is
//! decrypt → decompress. Value stamps are computed over the processed
//! (on-disk) bytes.

mod compression;
mod encryption;
mod hashing;

pub use compression::Compression;
pub use encryption::{Cipher, Encryption, MIN_KEY_CHARS, SEAL_OVERHEAD};
pub use hashing::HashKind;

use crate::config::Config;
use crate::error::Result;

/// The codec bundle a store operates with, built once at open.
#[derive(Debug, Clone)]
pub struct Codecs {
    pub compression: Compression,
    pub cipher: Cipher,
    pub hash: HashKind,
}

impl Codecs {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            compression: config.compression,
            cipher: Cipher::new(config.encryption, config.encryption_key.as_deref())?,
            hash: config.hash,
        })
    }

    /// Runs a caller value through the write pipeline.
    pub fn process(&self, value: &[u8]) -> Result<Vec<u8>> {
        self.cipher.seal(&self.compression.compress(value)?)
    }

    /// Runs stored bytes through the read pipeline.
    pub fn restore(&self, stored: &[u8]) -> Result<Vec<u8>> {
        self.compression.decompress(&self.cipher.open(stored)?)
    }

    /// The 8-byte stamp recorded for processed bytes.
    pub fn stamp(&self, processed: &[u8]) -> u64 {
        self.hash.stamp64(processed)
    }

    pub fn encrypts(&self) -> bool {
        !self.cipher.is_none()
    }

    /// Per-sealed-run overhead, zero when encryption is off.
    pub fn seal_overhead(&self) -> usize {
        self.cipher.overhead()
    }
}
