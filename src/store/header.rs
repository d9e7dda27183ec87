//! The fixed 64-byte file header.
//!
//! ## Layout (little-endian)
//!
//! ```text
//! +--------+---------+----------------------------------------+
//! | offset | size    | field                                  |
//! +--------+---------+----------------------------------------+
//! |      0 | 4       | magic "FSKV"                           |
//! |      4 | 1       | version                                |
//! |      5 | 1       | compression id                         |
//! |      6 | 1       | encryption id                          |
//! |      7 | 1       | hash id                                |
//! |      8 | 8       | created epoch ms                       |
//! |     16 | 8       | last update epoch ms                   |
//! |     24 | 8       | index start (absolute offset)          |
//! |     32 | 4       | index used (bytes)                     |
//! |     36 | 4       | index space (allocated bytes)          |
//! |     40 | 4       | index count (live entries)             |
//! |     44 | 16      | reserved                               |
//! |     60 | 4       | FNV-1a checksum over bytes 0..44       |
//! +--------+---------+----------------------------------------+
//! ```
//!
//! When a cipher is configured the 64-byte plaintext is AEAD-sealed, so the
//! on-disk header occupies 64 + 28 bytes.

use std::fs::File;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::{Cipher, Codecs};
use crate::error::{Error, Result};
use crate::store::appender::{read_exact_at, write_all_at};
use crate::store::now_ms;

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 4] = b"FSKV";
const CURRENT_VERSION: u8 = 1;

/// Byte range the checksum covers: everything before the reserved tail.
const CHECKSUM_RANGE: std::ops::Range<usize> = 0..44;
const CHECKSUM_OFFSET: usize = 60;

/// Parsed file header. The codec ids are immutable after creation; the index
/// fields track the live index region and are rewritten on every flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u8,
    pub compression_id: u8,
    pub encryption_id: u8,
    pub hash_id: u8,
    pub created_ms: u64,
    pub last_update_ms: u64,
    pub index_start: u64,
    pub index_used: u32,
    pub index_space: u32,
    pub index_count: u32,
}

/// FNV-1a, 32-bit.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

impl FileHeader {
    /// Stamps a fresh header for a newly created file.
    pub fn create(codecs: &Codecs) -> Self {
        let now = now_ms();
        Self {
            version: CURRENT_VERSION,
            compression_id: codecs.compression.id(),
            encryption_id: codecs.cipher.kind().id(),
            hash_id: codecs.hash.id(),
            created_ms: now,
            last_update_ms: now,
            index_start: 0,
            index_used: 0,
            index_space: 0,
            index_count: 0,
        }
    }

    /// On-disk size of the header for the given cipher.
    pub fn disk_size(cipher: &Cipher) -> u64 {
        (HEADER_SIZE + cipher.overhead()) as u64
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version;
        buf[5] = self.compression_id;
        buf[6] = self.encryption_id;
        buf[7] = self.hash_id;
        LittleEndian::write_u64(&mut buf[8..16], self.created_ms);
        LittleEndian::write_u64(&mut buf[16..24], self.last_update_ms);
        LittleEndian::write_u64(&mut buf[24..32], self.index_start);
        LittleEndian::write_u32(&mut buf[32..36], self.index_used);
        LittleEndian::write_u32(&mut buf[36..40], self.index_space);
        LittleEndian::write_u32(&mut buf[40..44], self.index_count);
        let checksum = fnv1a(&buf[CHECKSUM_RANGE]);
        LittleEndian::write_u32(&mut buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], checksum);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[0..4] != MAGIC {
            return Err(Error::CorruptHeader("bad magic".to_string()));
        }
        let version = buf[4];
        if version > CURRENT_VERSION {
            return Err(Error::CorruptHeader(format!(
                "unsupported version {version}"
            )));
        }
        let stored = LittleEndian::read_u32(&buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
        let computed = fnv1a(&buf[CHECKSUM_RANGE]);
        if stored != computed {
            return Err(Error::CorruptHeader(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        Ok(Self {
            version,
            compression_id: buf[5],
            encryption_id: buf[6],
            hash_id: buf[7],
            created_ms: LittleEndian::read_u64(&buf[8..16]),
            last_update_ms: LittleEndian::read_u64(&buf[16..24]),
            index_start: LittleEndian::read_u64(&buf[24..32]),
            index_used: LittleEndian::read_u32(&buf[32..36]),
            index_space: LittleEndian::read_u32(&buf[36..40]),
            index_count: LittleEndian::read_u32(&buf[40..44]),
        })
    }

    /// Reads and parses the header at offset 0, unsealing it first when a
    /// cipher is configured. Short files and parse failures are
    /// [`Error::CorruptHeader`]; a rejected AEAD tag is
    /// [`Error::AuthFailure`].
    pub fn read(file: &File, cipher: &Cipher) -> Result<Self> {
        let disk_size = Self::disk_size(cipher) as usize;
        let mut sealed = vec![0u8; disk_size];
        read_exact_at(file, &mut sealed, 0)
            .map_err(|_| Error::CorruptHeader("file shorter than its header".to_string()))?;

        let plain = cipher.open(&sealed).map_err(|e| match e {
            Error::AuthFailure => Error::AuthFailure,
            _ => Error::CorruptHeader("sealed header envelope truncated".to_string()),
        })?;
        let buf: [u8; HEADER_SIZE] = plain
            .try_into()
            .map_err(|_| Error::CorruptHeader("sealed header has wrong length".to_string()))?;
        Self::decode(&buf)
    }

    /// Refreshes the update timestamp, seals if needed and writes the header
    /// at offset 0. The caller is responsible for syncing the file.
    pub fn write(&mut self, file: &File, cipher: &Cipher) -> Result<()> {
        self.last_update_ms = now_ms();
        let sealed = cipher.seal(&self.encode())?;
        write_all_at(file, &sealed, 0)?;
        Ok(())
    }

    /// Checks that the opened configuration's codecs match the ones this file
    /// was created with.
    pub fn validate_compatibility(&self, codecs: &Codecs) -> Result<()> {
        if self.compression_id != codecs.compression.id() {
            return Err(Error::ConfigMismatch(format!(
                "file uses compression id {}, config asks for {}",
                self.compression_id,
                codecs.compression.id()
            )));
        }
        if self.encryption_id != codecs.cipher.kind().id() {
            return Err(Error::ConfigMismatch(format!(
                "file uses encryption id {}, config asks for {}",
                self.encryption_id,
                codecs.cipher.kind().id()
            )));
        }
        if self.hash_id != codecs.hash.id() {
            return Err(Error::ConfigMismatch(format!(
                "file uses hash id {}, config asks for {}",
                self.hash_id,
                codecs.hash.id()
            )));
        }
        Ok(())
    }
}
