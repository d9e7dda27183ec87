//! Value hashing.
//!
//! The engine stores an 8-byte stamp per value regardless of the configured
//! hash: XXH3 of the bytes themselves when the hash is XXH3, otherwise XXH3
//! of the configured hash's digest. The reduction trades the cryptographic
//! strength of the configured hash for a fixed cheap comparison; the full
//! digest is never persisted.

use sha2::Digest;
use xxhash_rust::xxh3::{xxh3_128, xxh3_64};

use crate::error::{Error, Result};

/// Hash identity stamped into the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
    Sha3_384,
    Sha384,
    Sha512,
    Blake3,
    Xxh3,
    Xxh128,
}

impl HashKind {
    /// Resolves a header id to a hash identity.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(HashKind::Md5),
            1 => Ok(HashKind::Sha1),
            2 => Ok(HashKind::Sha256),
            3 => Ok(HashKind::Sha3_384),
            4 => Ok(HashKind::Sha384),
            5 => Ok(HashKind::Sha512),
            6 => Ok(HashKind::Blake3),
            7 => Ok(HashKind::Xxh3),
            8 => Ok(HashKind::Xxh128),
            _ => Err(Error::CorruptHeader(format!("unknown hash id {id}"))),
        }
    }

    /// The id written into the file header.
    pub fn id(&self) -> u8 {
        match self {
            HashKind::Md5 => 0,
            HashKind::Sha1 => 1,
            HashKind::Sha256 => 2,
            HashKind::Sha3_384 => 3,
            HashKind::Sha384 => 4,
            HashKind::Sha512 => 5,
            HashKind::Blake3 => 6,
            HashKind::Xxh3 => 7,
            HashKind::Xxh128 => 8,
        }
    }

    /// The 8-byte stamp the engine records for a processed value.
    pub fn stamp64(&self, data: &[u8]) -> u64 {
        match self {
            HashKind::Md5 => xxh3_64(&md5::Md5::digest(data)),
            HashKind::Sha1 => xxh3_64(&sha1::Sha1::digest(data)),
            HashKind::Sha256 => xxh3_64(&sha2::Sha256::digest(data)),
            HashKind::Sha3_384 => xxh3_64(&sha3::Sha3_384::digest(data)),
            HashKind::Sha384 => xxh3_64(&sha2::Sha384::digest(data)),
            HashKind::Sha512 => xxh3_64(&sha2::Sha512::digest(data)),
            HashKind::Blake3 => xxh3_64(blake3::hash(data).as_bytes()),
            HashKind::Xxh3 => xxh3_64(data),
            HashKind::Xxh128 => xxh3_64(&xxh3_128(data).to_le_bytes()),
        }
    }
}
