//! Index persistence.
//!
//! The on-disk index region trails the value region and is updated at flush
//! time by one of three strategies:
//!
//! 1. **Full rebuild** — serialize every live entry to a new region at
//!    end-of-file with a growth pad, and repoint the header. Chosen when the
//!    store is small, the rebuild threshold is disabled, tombstone waste
//!    crossed the threshold, or the pad cannot absorb the new entries.
//! 2. **Tail append** — write never-persisted entries into the growth pad
//!    and advance `index_used`.
//! 3. **In-place patch** — rewrite the fixed part of dirty, already
//!    persisted entries at their recorded position. Entry sizes never change
//!    for a given key, so neighbors stay put.
//!
//! Removed entries get a **tombstone patch**: their on-disk deleted flag is
//! flipped where they sit. Within one flush the order is appends, then
//! patches, then tombstones; the caller writes the header last.

use std::collections::HashMap;

use dashmap::DashMap;

use super::appender::Appender;
use super::entry::{IndexEntry, ENTRY_MAGIC};
use super::header::FileHeader;
use crate::codec::Codecs;
use crate::error::{Error, Result};

/// Entry count below which a flush always rewrites the whole region.
const REBUILD_FLOOR: usize = 10;

/// Offset of the deleted flag inside an entry, shared by both on-disk forms.
const DELETED_FLAG_OFFSET: u64 = 4;

/// Reads the index region and recovers the live entries, scanning for the
/// entry magic so one corrupt record never hides the rest. Unparseable
/// candidates are logged and skipped; on duplicate keys the last valid
/// occurrence wins.
pub(super) fn load(
    appender: &Appender,
    header: &FileHeader,
    codecs: &Codecs,
    max_key_len: usize,
) -> Result<HashMap<Vec<u8>, IndexEntry>> {
    let mut entries = HashMap::new();
    if header.index_start == 0 || header.index_used == 0 {
        return Ok(entries);
    }
    let file_len = appender.durable_len();
    if header.index_start + header.index_space as u64 > file_len {
        return Err(Error::CorruptHeader(format!(
            "index region [{}, +{}] runs past the {file_len}-byte file",
            header.index_start, header.index_space
        )));
    }

    let mut region = vec![0u8; header.index_used as usize];
    appender.read_at(header.index_start, &mut region)?;

    let mut pos = 0usize;
    let mut skipped = 0usize;
    while pos + ENTRY_MAGIC.len() <= region.len() {
        if &region[pos..pos + 4] != ENTRY_MAGIC {
            pos += 1;
            continue;
        }
        match IndexEntry::decode(&region[pos..], &codecs.cipher, max_key_len) {
            Ok(mut parsed) => {
                let disk_len = parsed.disk_len;
                if !parsed.entry.is_deleted && parsed.entry.value_position > 0 {
                    if parsed.entry.value_end() <= file_len {
                        parsed.entry.key_position = (header.index_start + pos as u64) as i64;
                        entries.insert(parsed.key, parsed.entry);
                    } else {
                        skipped += 1;
                        tracing::warn!(
                            offset = header.index_start + pos as u64,
                            value_position = parsed.entry.value_position,
                            "index entry points past end of file, skipping"
                        );
                    }
                }
                pos += disk_len;
            }
            Err(e) => {
                skipped += 1;
                tracing::warn!(
                    offset = header.index_start + pos as u64,
                    error = %e,
                    "unparseable index entry, skipping"
                );
                pos += 1;
            }
        }
    }

    if skipped > 0 || entries.len() != header.index_count as usize {
        tracing::warn!(
            loaded = entries.len(),
            expected = header.index_count,
            skipped = skipped,
            "index scan differs from header count"
        );
    }
    Ok(entries)
}

/// Persists the in-memory index, picking a strategy per the rules above and
/// updating the header's index fields in memory. The caller writes the
/// header and syncs.
pub(super) fn persist(
    index: &DashMap<Vec<u8>, IndexEntry>,
    tombstones: &HashMap<Vec<u8>, IndexEntry>,
    header: &mut FileHeader,
    appender: &Appender,
    codecs: &Codecs,
    rebuild_threshold: u8,
) -> Result<()> {
    let cipher = &codecs.cipher;
    let live = index.len();

    // Bytes of the current region still owned by live entries; the rest is
    // tombstone waste left by deletes and overwrites.
    let live_bytes: usize = index
        .iter()
        .filter(|e| e.value().key_position >= 0)
        .map(|e| IndexEntry::disk_size(e.key().len(), cipher))
        .sum();
    let dead_bytes = (header.index_used as usize).saturating_sub(live_bytes);

    let new_bytes: usize = index
        .iter()
        .filter(|e| e.value().is_updated && e.value().key_position < 0)
        .map(|e| IndexEntry::disk_size(e.key().len(), cipher))
        .sum();
    let pad_room = header.index_space.saturating_sub(header.index_used) as usize;

    // A rebuild is forced by a missing or disabled region and by tombstone
    // waste; fresh entries force one only when the pad cannot take them or
    // the store is too small for incremental maintenance to pay off.
    let rebuild = header.index_start == 0
        || rebuild_threshold == 0
        || dead_bytes * 100 > rebuild_threshold as usize * header.index_used as usize
        || (new_bytes > 0 && (live < REBUILD_FLOOR || new_bytes > pad_room));

    if rebuild {
        return rebuild_region(index, header, appender, codecs, rebuild_threshold);
    }

    // Strategy 2: tail-append fresh entries into the growth pad.
    let mut cursor = header.index_start + header.index_used as u64;
    let mut appended = 0usize;
    for mut item in index.iter_mut() {
        if !item.value().is_updated || item.value().key_position >= 0 {
            continue;
        }
        let bytes = item.value().encode(item.key(), cipher)?;
        appender.write_at(cursor, &bytes)?;
        let entry = item.value_mut();
        entry.key_position = cursor as i64;
        entry.is_updated = false;
        cursor += bytes.len() as u64;
        appended += 1;
    }
    header.index_used = (cursor - header.index_start) as u32;

    // Strategy 3: patch dirty entries where they sit.
    let mut patched = 0usize;
    for mut item in index.iter_mut() {
        if !item.value().is_updated || item.value().key_position < 0 {
            continue;
        }
        let position = item.value().key_position as u64;
        if cipher.is_none() {
            let fixed = item.value().encode_plain_fixed(item.key().len());
            appender.write_at(position, &fixed)?;
        } else {
            // The sealed form re-encodes whole; the size is unchanged since
            // the key length is.
            let bytes = item.value().encode(item.key(), cipher)?;
            appender.write_at(position, &bytes)?;
        }
        item.value_mut().is_updated = false;
        patched += 1;
    }

    // Strategy 4: flip the deleted flag of removed entries.
    let mut tombstoned = 0usize;
    for entry in tombstones.values() {
        if entry.key_position < 0 {
            continue;
        }
        appender.write_at(entry.key_position as u64 + DELETED_FLAG_OFFSET, &[1])?;
        tombstoned += 1;
    }

    tracing::debug!(
        appended = appended,
        patched = patched,
        tombstoned = tombstoned,
        index_used = header.index_used,
        "index persisted incrementally"
    );
    Ok(())
}

/// Strategy 1: serialize every live entry to a fresh region at end-of-file,
/// reserve a growth pad and repoint the header.
fn rebuild_region(
    index: &DashMap<Vec<u8>, IndexEntry>,
    header: &mut FileHeader,
    appender: &Appender,
    codecs: &Codecs,
    rebuild_threshold: u8,
) -> Result<()> {
    let cipher = &codecs.cipher;
    let start = appender.end_position()?;

    let mut payload = Vec::new();
    let mut placed: Vec<(Vec<u8>, i64)> = Vec::with_capacity(index.len());
    for item in index.iter() {
        let position = start + payload.len() as u64;
        payload.extend_from_slice(&item.value().encode(item.key(), cipher)?);
        placed.push((item.key().clone(), position as i64));
    }
    appender.append(&payload)?;

    let pad = growth_pad(payload.len(), placed.len(), rebuild_threshold);
    if pad > 0 {
        appender.skip(pad as u64)?;
    }

    for (key, position) in placed {
        if let Some(mut entry) = index.get_mut(&key) {
            entry.key_position = position;
            entry.is_updated = false;
        }
    }

    header.index_start = start;
    header.index_used = payload.len() as u32;
    header.index_space = (payload.len() + pad) as u32;
    tracing::debug!(
        entries = index.len(),
        index_start = start,
        index_used = header.index_used,
        pad = pad,
        "index region rebuilt"
    );
    Ok(())
}

/// Pad reserved after a rebuilt region: `threshold`% of the payload, only
/// once the store is big enough for tail appends to pay off.
pub(super) fn growth_pad(payload_len: usize, entries: usize, threshold: u8) -> usize {
    if entries < REBUILD_FLOOR || threshold == 0 {
        return 0;
    }
    payload_len * threshold as usize / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encryption;
    use crate::config::Config;
    use crate::store::now_ms;
    use std::fs::File;

    fn scratch() -> (tempfile::TempDir, Appender) {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("data"))
            .unwrap();
        (dir, Appender::open(file, 64 * 1024).unwrap())
    }

    fn entry(position: i64, length: u32) -> IndexEntry {
        IndexEntry {
            value_position: position,
            value_length: length,
            value_hash: 7,
            timestamp_ms: now_ms(),
            is_deleted: false,
            is_updated: true,
            key_position: -1,
        }
    }

    fn plain_codecs() -> Codecs {
        Codecs::from_config(&Config::default()).unwrap()
    }

    fn sealed_codecs() -> Codecs {
        Codecs::from_config(
            &Config::new().encryption(Encryption::Aes256Gcm, "MySecure32ByteEncryptionKey12345"),
        )
        .unwrap()
    }

    /// Writes `count` one-byte values so entry positions are in bounds.
    fn seed_values(appender: &Appender, count: usize) {
        appender.append(&vec![0xaa; count]).unwrap();
        appender.flush().unwrap();
    }

    #[test]
    fn test_persist_then_load_round_trip() {
        for codecs in [plain_codecs(), sealed_codecs()] {
            let (_dir, appender) = scratch();
            seed_values(&appender, 64);

            let index = DashMap::new();
            for i in 0..20u8 {
                index.insert(format!("key-{i:02}").into_bytes(), entry(i as i64 + 1, 1));
            }
            let mut header = FileHeader::create(&codecs);
            persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 20).unwrap();
            appender.flush().unwrap();

            assert!(header.index_start >= 64);
            assert!(header.index_used > 0);
            // A 20-entry rebuild earns a growth pad.
            assert!(header.index_space > header.index_used);

            let loaded = load(&appender, &header, &codecs, 4096).unwrap();
            assert_eq!(loaded.len(), 20);
            let e = &loaded[b"key-07".as_slice()];
            assert_eq!(e.value_position, 8);
            assert!(e.key_position >= header.index_start as i64);

            // Everything marked clean.
            assert!(index.iter().all(|e| !e.value().is_updated));
        }
    }

    #[test]
    fn test_tail_append_uses_the_pad() {
        let (_dir, appender) = scratch();
        seed_values(&appender, 64);
        let codecs = plain_codecs();

        let index = DashMap::new();
        for i in 0..15u8 {
            index.insert(vec![b'a' + i; 4], entry(i as i64 + 1, 1));
        }
        let mut header = FileHeader::create(&codecs);
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 20).unwrap();
        let (start, used) = (header.index_start, header.index_used);

        // One fresh entry fits the pad: the region must not move.
        index.insert(b"fresh".to_vec(), entry(3, 1));
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 20).unwrap();
        appender.flush().unwrap();

        assert_eq!(header.index_start, start);
        assert!(header.index_used > used);
        assert!(header.index_used <= header.index_space);

        let loaded = load(&appender, &header, &codecs, 4096).unwrap();
        assert_eq!(loaded.len(), 16);
        assert!(loaded.contains_key(b"fresh".as_slice()));
    }

    #[test]
    fn test_pad_overflow_falls_back_to_rebuild() {
        let (_dir, appender) = scratch();
        seed_values(&appender, 512);
        let codecs = plain_codecs();

        let index = DashMap::new();
        for i in 0..12u8 {
            index.insert(vec![b'k', i], entry(i as i64 + 1, 1));
        }
        let mut header = FileHeader::create(&codecs);
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 10).unwrap();
        let start = header.index_start;

        // Far more new entries than a 10% pad can hold.
        for i in 0..40u8 {
            index.insert(vec![b'n', i], entry(i as i64 + 100, 1));
        }
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 10).unwrap();
        appender.flush().unwrap();

        assert!(header.index_start > start, "expected a relocated region");
        let loaded = load(&appender, &header, &codecs, 4096).unwrap();
        assert_eq!(loaded.len(), 52);
    }

    #[test]
    fn test_patch_rewrites_in_place() {
        let (_dir, appender) = scratch();
        seed_values(&appender, 512);
        let codecs = plain_codecs();

        let index = DashMap::new();
        for i in 0..15u8 {
            index.insert(vec![b'p', i], entry(i as i64 + 1, 1));
        }
        let mut header = FileHeader::create(&codecs);
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 50).unwrap();
        let (start, used) = (header.index_start, header.index_used);

        // Move one value: dirty, already persisted, same key length.
        {
            let mut e = index.get_mut(b"p\x03".as_slice()).unwrap();
            e.value_position = 400;
            e.value_hash = 99;
            e.is_updated = true;
        }
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 50).unwrap();
        appender.flush().unwrap();

        assert_eq!((header.index_start, header.index_used), (start, used));
        let loaded = load(&appender, &header, &codecs, 4096).unwrap();
        assert_eq!(loaded[b"p\x03".as_slice()].value_position, 400);
        assert_eq!(loaded[b"p\x03".as_slice()].value_hash, 99);
    }

    #[test]
    fn test_tombstone_patch_hides_entry() {
        for codecs in [plain_codecs(), sealed_codecs()] {
            let (_dir, appender) = scratch();
            seed_values(&appender, 64);

            let index = DashMap::new();
            for i in 0..15u8 {
                index.insert(vec![b't', i], entry(i as i64 + 1, 1));
            }
            let mut header = FileHeader::create(&codecs);
            persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 50).unwrap();

            let (key, removed) = index.remove(b"t\x05".as_slice()).unwrap();
            let mut tombstones = HashMap::new();
            tombstones.insert(key, removed);
            persist(&index, &tombstones, &mut header, &appender, &codecs, 50).unwrap();
            appender.flush().unwrap();

            let loaded = load(&appender, &header, &codecs, 4096).unwrap();
            assert_eq!(loaded.len(), 14);
            assert!(!loaded.contains_key(b"t\x05".as_slice()));
        }
    }

    #[test]
    fn test_small_store_always_rebuilds() {
        let (_dir, appender) = scratch();
        seed_values(&appender, 64);
        let codecs = plain_codecs();

        let index = DashMap::new();
        index.insert(b"only".to_vec(), entry(1, 1));
        let mut header = FileHeader::create(&codecs);
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 20).unwrap();
        let start = header.index_start;
        // Below the floor there is no pad either.
        assert_eq!(header.index_space, header.index_used);

        index.insert(b"two!".to_vec(), entry(2, 1));
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 20).unwrap();
        assert!(header.index_start > start);
    }

    #[test]
    fn test_load_skips_corrupt_entry() {
        let (_dir, appender) = scratch();
        seed_values(&appender, 64);
        let codecs = plain_codecs();

        let index = DashMap::new();
        for i in 0..12u8 {
            index.insert(vec![b'c', i], entry(i as i64 + 1, 1));
        }
        let mut header = FileHeader::create(&codecs);
        persist(&index, &HashMap::new(), &mut header, &appender, &codecs, 20).unwrap();
        appender.flush().unwrap();

        // Smash one entry's magic in the middle of the region.
        let victim = index.get(b"c\x06".as_slice()).unwrap().key_position as u64;
        appender.write_at(victim, b"XXXX").unwrap();

        let loaded = load(&appender, &header, &codecs, 4096).unwrap();
        assert_eq!(loaded.len(), 11);
        assert!(!loaded.contains_key(b"c\x06".as_slice()));
    }

    #[test]
    fn test_growth_pad_arithmetic() {
        assert_eq!(growth_pad(1000, 20, 20), 200);
        assert_eq!(growth_pad(1000, 9, 20), 0); // below floor
        assert_eq!(growth_pad(1000, 20, 0), 0); // disabled
    }
}
