//! Index entries.
//!
//! ## Plaintext on-disk form (40 bytes + inline key)
//!
//! ```text
//! +--------+------+----------------------------------+
//! | offset | size | field                            |
//! +--------+------+----------------------------------+
//! |      0 | 4    | magic "IDXE"                     |
//! |      4 | 1    | is_deleted                       |
//! |      5 | 4    | key length                       |
//! |      9 | 8    | value position (i64, -1 = none)  |
//! |     17 | 4    | value length (stored bytes)      |
//! |     21 | 8    | value hash (8-byte stamp)        |
//! |     29 | 8    | timestamp ms                     |
//! |     37 | 3    | reserved                         |
//! |     40 | n    | key bytes                        |
//! +--------+------+----------------------------------+
//! ```
//!
//! ## Encrypted on-disk form (20-byte envelope + sealed payload)
//!
//! The envelope stays in the clear so scans and tombstone patches never
//! need the cipher: magic (4), is_deleted (1), XXH3 of the sealed payload
//! (8), payload length (4), reserved (3). The payload is the AEAD-sealed
//! plaintext form including the key. Because the key length never changes
//! for a given entry, both forms patch in place without moving neighbors.

use byteorder::{ByteOrder, LittleEndian};
use xxhash_rust::xxh3::xxh3_64;

use crate::codec::{Cipher, SEAL_OVERHEAD};
use crate::error::{Error, Result};

pub const ENTRY_MAGIC: &[u8; 4] = b"IDXE";

/// Fixed size of the plaintext form, excluding the inline key.
pub const PLAIN_FIXED: usize = 40;

/// Fixed size of the encrypted envelope.
pub const SEALED_FIXED: usize = 20;

/// In-memory index entry. Mirrors the on-disk fields and adds the dirty
/// flag and the entry's own location inside the index region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// File-absolute offset of the stored value, -1 before assignment.
    pub value_position: i64,
    /// Stored (processed) value size in bytes.
    pub value_length: u32,
    /// 8-byte stamp over the stored bytes.
    pub value_hash: u64,
    pub timestamp_ms: u64,
    pub is_deleted: bool,
    /// Dirty: the on-disk index does not reflect this entry yet.
    pub is_updated: bool,
    /// File-absolute offset of this entry in the index region, -1 until
    /// persisted.
    pub key_position: i64,
}

/// One entry recovered from the on-disk index region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub key: Vec<u8>,
    pub entry: IndexEntry,
    /// Bytes the entry occupies on disk.
    pub disk_len: usize,
}

impl IndexEntry {
    /// End offset of the stored value. Only meaningful for assigned
    /// positions.
    pub fn value_end(&self) -> u64 {
        self.value_position.max(0) as u64 + self.value_length as u64
    }

    /// On-disk size of this entry for a key of `key_len` bytes.
    pub fn disk_size(key_len: usize, cipher: &Cipher) -> usize {
        if cipher.is_none() {
            PLAIN_FIXED + key_len
        } else {
            SEALED_FIXED + PLAIN_FIXED + key_len + SEAL_OVERHEAD
        }
    }

    /// Serializes the fixed plaintext header. `encode` appends the key; an
    /// in-place patch rewrites just these bytes since the key is unchanged.
    pub fn encode_plain_fixed(&self, key_len: usize) -> [u8; PLAIN_FIXED] {
        let mut buf = [0u8; PLAIN_FIXED];
        buf[0..4].copy_from_slice(ENTRY_MAGIC);
        buf[4] = self.is_deleted as u8;
        LittleEndian::write_u32(&mut buf[5..9], key_len as u32);
        LittleEndian::write_i64(&mut buf[9..17], self.value_position);
        LittleEndian::write_u32(&mut buf[17..21], self.value_length);
        LittleEndian::write_u64(&mut buf[21..29], self.value_hash);
        LittleEndian::write_u64(&mut buf[29..37], self.timestamp_ms);
        buf
    }

    /// Serializes the full on-disk form for the configured cipher.
    pub fn encode(&self, key: &[u8], cipher: &Cipher) -> Result<Vec<u8>> {
        let fixed = self.encode_plain_fixed(key.len());
        if cipher.is_none() {
            let mut out = Vec::with_capacity(PLAIN_FIXED + key.len());
            out.extend_from_slice(&fixed);
            out.extend_from_slice(key);
            return Ok(out);
        }

        let mut payload = Vec::with_capacity(PLAIN_FIXED + key.len());
        payload.extend_from_slice(&fixed);
        payload.extend_from_slice(key);
        let sealed = cipher.seal(&payload)?;

        let mut out = Vec::with_capacity(SEALED_FIXED + sealed.len());
        out.extend_from_slice(&encode_envelope(
            self.is_deleted,
            xxh3_64(&sealed),
            sealed.len() as u32,
        ));
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Parses one entry starting at `buf[0]`. `buf` may extend past the
    /// entry; `disk_len` reports how much was consumed.
    pub fn decode(buf: &[u8], cipher: &Cipher, max_key_len: usize) -> Result<ParsedEntry> {
        if cipher.is_none() {
            decode_plain(buf, max_key_len)
        } else {
            decode_sealed(buf, cipher, max_key_len)
        }
    }
}

/// Serializes the 20-byte envelope of the encrypted form. Tombstone patches
/// rewrite only this, leaving the sealed payload intact.
pub fn encode_envelope(is_deleted: bool, payload_hash: u64, payload_len: u32) -> [u8; SEALED_FIXED] {
    let mut buf = [0u8; SEALED_FIXED];
    buf[0..4].copy_from_slice(ENTRY_MAGIC);
    buf[4] = is_deleted as u8;
    LittleEndian::write_u64(&mut buf[5..13], payload_hash);
    LittleEndian::write_u32(&mut buf[13..17], payload_len);
    buf
}

fn decode_plain(buf: &[u8], max_key_len: usize) -> Result<ParsedEntry> {
    if buf.len() < PLAIN_FIXED {
        return Err(Error::CorruptEntry("truncated entry header".to_string()));
    }
    if &buf[0..4] != ENTRY_MAGIC {
        return Err(Error::CorruptEntry("bad entry magic".to_string()));
    }
    let key_len = LittleEndian::read_u32(&buf[5..9]) as usize;
    if key_len == 0 || key_len > max_key_len {
        return Err(Error::CorruptEntry(format!(
            "implausible key length {key_len}"
        )));
    }
    if buf.len() < PLAIN_FIXED + key_len {
        return Err(Error::CorruptEntry("entry key runs past region".to_string()));
    }
    let entry = IndexEntry {
        value_position: LittleEndian::read_i64(&buf[9..17]),
        value_length: LittleEndian::read_u32(&buf[17..21]),
        value_hash: LittleEndian::read_u64(&buf[21..29]),
        timestamp_ms: LittleEndian::read_u64(&buf[29..37]),
        is_deleted: buf[4] != 0,
        is_updated: false,
        key_position: -1,
    };
    Ok(ParsedEntry {
        key: buf[PLAIN_FIXED..PLAIN_FIXED + key_len].to_vec(),
        entry,
        disk_len: PLAIN_FIXED + key_len,
    })
}

fn decode_sealed(buf: &[u8], cipher: &Cipher, max_key_len: usize) -> Result<ParsedEntry> {
    if buf.len() < SEALED_FIXED {
        return Err(Error::CorruptEntry("truncated entry envelope".to_string()));
    }
    if &buf[0..4] != ENTRY_MAGIC {
        return Err(Error::CorruptEntry("bad entry magic".to_string()));
    }
    let is_deleted = buf[4] != 0;
    let payload_hash = LittleEndian::read_u64(&buf[5..13]);
    let payload_len = LittleEndian::read_u32(&buf[13..17]) as usize;

    let max_payload = PLAIN_FIXED + max_key_len + SEAL_OVERHEAD;
    if payload_len < PLAIN_FIXED + SEAL_OVERHEAD || payload_len > max_payload {
        return Err(Error::CorruptEntry(format!(
            "implausible sealed payload length {payload_len}"
        )));
    }
    if buf.len() < SEALED_FIXED + payload_len {
        return Err(Error::CorruptEntry(
            "sealed payload runs past region".to_string(),
        ));
    }
    let sealed = &buf[SEALED_FIXED..SEALED_FIXED + payload_len];
    if xxh3_64(sealed) != payload_hash {
        return Err(Error::CorruptEntry("envelope hash mismatch".to_string()));
    }

    let payload = cipher.open(sealed)?;
    let mut parsed = decode_plain(&payload, max_key_len)?;
    if parsed.disk_len != payload.len() {
        return Err(Error::CorruptEntry(
            "sealed payload has trailing bytes".to_string(),
        ));
    }
    // The envelope flag wins: tombstone patches only touch the envelope.
    parsed.entry.is_deleted = is_deleted;
    parsed.disk_len = SEALED_FIXED + payload_len;
    Ok(parsed)
}
