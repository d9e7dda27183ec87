//! Compaction: an atomic rewrite of the store file that keeps only live
//! values and a fresh contiguous index region.
//!
//! The compactor streams values into `<path>.compact.tmp` sorted by their
//! current position, writes the rebuilt index and header, verifies the
//! header round-trips, and then swaps the temp file in under the exclusive
//! side of the appender lock: the live file is renamed to `<path>.backup`,
//! the temp file takes its place, and the engine's handle, header and index
//! are replaced together. The backup is kept until the swap has fully
//! succeeded.

use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::appender::{write_all_at, Appender};
use super::engine::Store;
use super::entry::IndexEntry;
use super::header::FileHeader;
use super::{index, suffixed};
use crate::error::{Error, Result};

/// Clears the compacting bit however compaction exits.
struct CompactingGuard<'a> {
    store: &'a Store,
}

impl Drop for CompactingGuard<'_> {
    fn drop(&mut self) {
        self.store.compacting.store(false, Ordering::Release);
    }
}

/// Whether the reclaimable share of the file crossed the auto-compaction
/// threshold.
pub(super) fn should_compact(store: &Store) -> Result<bool> {
    let appender = store.appender.read()?;
    let header = store.header.lock()?;
    let file_length = appender.end_position()?;
    let free = free_bytes(store, &header, file_length);
    Ok(free * 100 > store.config.auto_compact_threshold as u64 * file_length)
}

/// Bytes a compaction would reclaim: everything that is neither the header,
/// a live value, nor the index region with its pad.
pub(super) fn free_bytes(store: &Store, header: &FileHeader, file_length: u64) -> u64 {
    let kept = FileHeader::disk_size(&store.codecs.cipher)
        + store.live_value_bytes()
        + header.index_space as u64;
    file_length.saturating_sub(kept)
}

/// Rewrites the store file, keeping only live entries. Callers hold the
/// engine write lock. With `all_compact` the rebuilt index gets no growth
/// pad.
pub(super) fn perform_compact(store: &Store, all_compact: bool) -> Result<()> {
    store.compacting.store(true, Ordering::Release);
    let _guard = CompactingGuard { store };

    let appender = store.appender.read()?.clone();
    appender.flush()?;
    let before = appender.end_position()?;

    let tmp_path = suffixed(&store.path, ".compact.tmp");
    let backup_path = suffixed(&store.path, ".backup");

    let (new_header, survivors) = match build_compacted(store, &appender, &tmp_path, all_compact) {
        Ok(built) => built,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    // Swap under the exclusive side of the read-protection lock: no reader
    // holds the old handle Arc-clone mid-swap, and lookups resume against
    // the new index.
    {
        let mut guard = store.appender.write()?;
        let _ = fs::remove_file(&backup_path); // stale artifact of a crashed run

        fs::rename(&store.path, &backup_path)?;
        if let Err(e) = fs::rename(&tmp_path, &store.path) {
            if let Err(restore) = fs::rename(&backup_path, &store.path) {
                tracing::error!(
                    path = %store.path.display(),
                    error = %restore,
                    "failed to restore the store file from backup"
                );
            }
            return Err(e.into());
        }

        let file = File::options().read(true).write(true).open(&store.path)?;
        let capacity = if store.config.write_buffer_enabled {
            store.config.write_buffer_bytes()
        } else {
            0
        };
        *guard = Arc::new(Appender::open(file, capacity)?);

        store.index.clear();
        for (key, entry) in survivors {
            store.index.insert(key, entry);
        }
        store.tombstones.lock()?.clear();
        *store.header.lock()? = new_header;
        store.dirty.store(false, Ordering::Release);
    }

    if let Err(e) = fs::remove_file(&backup_path) {
        tracing::warn!(path = %backup_path.display(), error = %e, "failed to remove compaction backup");
    }

    let after = store.appender.read()?.end_position()?;
    tracing::info!(
        entries = store.index.len(),
        before = before,
        after = after,
        "compaction finished"
    );
    Ok(())
}

/// Writes the compacted image of the store into `tmp_path` and verifies its
/// header round-trips. Unreadable records are logged and dropped, never
/// fatal.
fn build_compacted(
    store: &Store,
    appender: &Appender,
    tmp_path: &Path,
    all_compact: bool,
) -> Result<(FileHeader, Vec<(Vec<u8>, IndexEntry)>)> {
    let cipher = &store.codecs.cipher;
    let header_size = FileHeader::disk_size(cipher);

    let tmp = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)?;

    // Placeholder header holds the slot while values stream in.
    let mut new_header = *store.header.lock()?;
    new_header.index_start = 0;
    new_header.index_used = 0;
    new_header.index_space = 0;
    new_header.index_count = 0;
    new_header.write(&tmp, cipher)?;

    // Copy in ascending position order so reads of the old file are
    // sequential.
    let mut live: Vec<(Vec<u8>, IndexEntry)> = store
        .index
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();
    live.sort_by_key(|(_, entry)| entry.value_position);

    let stream_capacity = store.config.stream_buffer_bytes();
    let mut pending: Vec<u8> = Vec::with_capacity(stream_capacity);
    let mut pending_at = header_size;
    let mut cursor = header_size;
    let mut survivors: Vec<(Vec<u8>, IndexEntry)> = Vec::with_capacity(live.len());
    let mut dropped = 0usize;

    for (key, mut entry) in live {
        if entry.value_position < 0 {
            dropped += 1;
            tracing::warn!("entry without an assigned value, dropping");
            continue;
        }
        let mut stored = vec![0u8; entry.value_length as usize];
        if let Err(e) = appender.read_at(entry.value_position as u64, &mut stored) {
            dropped += 1;
            tracing::warn!(position = entry.value_position, error = %e, "unreadable value, dropping");
            continue;
        }
        if store.config.integrity_verification_enabled
            && store.codecs.stamp(&stored) != entry.value_hash
        {
            dropped += 1;
            tracing::warn!(position = entry.value_position, "value stamp mismatch, dropping");
            continue;
        }

        if !pending.is_empty() && pending.len() + stored.len() > stream_capacity {
            write_all_at(&tmp, &pending, pending_at)?;
            pending_at = cursor;
            pending.clear();
        }
        entry.value_position = cursor as i64;
        entry.is_updated = false;
        cursor += stored.len() as u64;
        pending.extend_from_slice(&stored);
        survivors.push((key, entry));
    }
    if !pending.is_empty() {
        write_all_at(&tmp, &pending, pending_at)?;
    }

    // Fresh contiguous index region right after the values.
    let index_start = cursor;
    let mut payload = Vec::new();
    for (key, entry) in survivors.iter_mut() {
        entry.key_position = (index_start + payload.len() as u64) as i64;
        payload.extend_from_slice(&entry.encode(key, cipher)?);
    }
    write_all_at(&tmp, &payload, index_start)?;

    let pad = if all_compact {
        0
    } else {
        index::growth_pad(
            payload.len(),
            survivors.len(),
            store.config.index_rebuild_threshold,
        )
    };
    if pad > 0 {
        tmp.set_len(index_start + payload.len() as u64 + pad as u64)?;
    }

    new_header.index_start = index_start;
    new_header.index_used = payload.len() as u32;
    new_header.index_space = (payload.len() + pad) as u32;
    new_header.index_count = survivors.len() as u32;
    new_header.write(&tmp, cipher)?;
    tmp.sync_all()?;

    // The new file must parse before it replaces the live one.
    let verify = File::open(tmp_path)?;
    let read_back =
        FileHeader::read(&verify, cipher).map_err(|e| Error::CompactVerify(e.to_string()))?;
    if read_back != new_header {
        return Err(Error::CompactVerify(
            "header did not round-trip through the new file".to_string(),
        ));
    }

    if dropped > 0 {
        tracing::warn!(dropped = dropped, "compaction dropped unreadable records");
    }
    Ok((new_header, survivors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encryption;
    use crate::config::Config;

    fn open(dir: &tempfile::TempDir, config: Config) -> Store {
        Store::open(dir.path().join("db.fskv"), config).unwrap()
    }

    fn fill(store: &Store, count: usize) {
        for i in 0..count {
            store
                .set(format!("k{i:05}").as_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        store.flush().unwrap();
    }

    #[test]
    fn test_compact_reclaims_deleted_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Config::default());
        fill(&store, 200);
        for i in (0..200).step_by(2) {
            store.delete(format!("k{i:05}").as_bytes()).unwrap();
        }
        store.flush().unwrap();

        let before = store.stats().unwrap().file_length;
        store.compact(false).unwrap();
        let after = store.stats().unwrap().file_length;

        assert!(after < before, "compaction must shrink the file");
        assert_eq!(store.len(), 100);
        assert_eq!(store.get(b"k00001").unwrap(), Some(b"value-1".to_vec()));
        assert_eq!(store.get(b"k00000").unwrap(), None);

        // Every survivor stays readable from the rewritten file.
        for i in (1..200).step_by(2) {
            assert_eq!(
                store.get(format!("k{i:05}").as_bytes()).unwrap(),
                Some(format!("value-{i}").into_bytes())
            );
        }
    }

    #[test]
    fn test_reopen_after_compact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.fskv");
        {
            let store = Store::open(&path, Config::default()).unwrap();
            fill(&store, 50);
            let doomed = [&b"k00010"[..], &b"k00020"[..], &b"k00030"[..]];
            store.delete_batch(&doomed).unwrap();
            store.compact(false).unwrap();
        }
        let store = Store::open(&path, Config::default()).unwrap();
        assert_eq!(store.len(), 47);
        assert_eq!(store.get(b"k00010").unwrap(), None);
        assert_eq!(store.get(b"k00011").unwrap(), Some(b"value-11".to_vec()));

        // No artifacts survive a clean compaction.
        assert!(!suffixed(&path, ".backup").exists());
        assert!(!suffixed(&path, ".compact.tmp").exists());
    }

    #[test]
    fn test_compact_encrypted_store() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            Config::new().encryption(Encryption::ChaCha20Poly1305, "MySecure32ByteEncryptionKey12345");
        let store = open(&dir, config);
        fill(&store, 30);
        for i in 0..15 {
            store.delete(format!("k{i:05}").as_bytes()).unwrap();
        }
        store.flush().unwrap();
        store.compact(false).unwrap();

        assert_eq!(store.len(), 15);
        assert_eq!(store.get(b"k00020").unwrap(), Some(b"value-20".to_vec()));
    }

    #[test]
    fn test_full_compact_leaves_no_pad() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Config::default());
        fill(&store, 40);

        store.compact(true).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.index_space, stats.index_used);
        assert_eq!(stats.reclaimable_bytes, 0);

        store.compact(false).unwrap();
        let stats = store.stats().unwrap();
        assert!(stats.index_space > stats.index_used);
    }

    #[test]
    fn test_compact_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Config::default());
        fill(&store, 60);
        store.compact(true).unwrap();
        let first = store.stats().unwrap().file_length;
        store.compact(true).unwrap();
        assert_eq!(store.stats().unwrap().file_length, first);
        assert_eq!(store.len(), 60);
    }

    #[test]
    fn test_timestamps_survive_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Config::default());
        fill(&store, 20);
        let before = *store.index.get(b"k00007".as_slice()).unwrap();
        store.compact(false).unwrap();
        let after = *store.index.get(b"k00007".as_slice()).unwrap();
        assert_eq!(after.timestamp_ms, before.timestamp_ms);
        assert_eq!(after.value_hash, before.value_hash);
    }

    #[test]
    fn test_corrupt_value_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Config::default());
        fill(&store, 20);

        // Smash one stored value on disk.
        let victim = *store.index.get(b"k00004".as_slice()).unwrap();
        let appender = store.appender.read().unwrap().clone();
        appender
            .write_at(victim.value_position as u64, &vec![0xff; victim.value_length as usize])
            .unwrap();

        store.compact(false).unwrap();
        assert_eq!(store.len(), 19);
        assert_eq!(store.get(b"k00004").unwrap(), None);
        assert_eq!(store.get(b"k00005").unwrap(), Some(b"value-5".to_vec()));
    }

    #[test]
    fn test_auto_compact_triggers_on_waste() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new().auto_compact(true, 40);
        let store = open(&dir, config);
        fill(&store, 100);
        let before = store.stats().unwrap().file_length;

        // Deleting most of the store pushes reclaimable space past 40%.
        for i in 0..90 {
            store.delete(format!("k{i:05}").as_bytes()).unwrap();
        }
        store.flush().unwrap();

        let stats = store.stats().unwrap();
        assert!(stats.file_length < before, "flush should have compacted");
        assert_eq!(store.len(), 10);
        assert!(!stats.compacting);
    }
}
