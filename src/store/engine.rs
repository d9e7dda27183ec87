//! The engine core: orchestrates the write path, lock-free reads, index
//! persistence and compaction over a single file.
//!
//! Mutating operations serialize on a per-store write lock. Reads resolve
//! through the concurrent index and positioned reads; the only coordination
//! they take is the shared side of the appender swap lock, which the
//! compactor holds exclusively while it replaces the file handle.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use itertools::{Either, Itertools};

use super::appender::Appender;
use super::compaction;
use super::entry::IndexEntry;
use super::header::FileHeader;
use super::{index, now_ms};
use crate::cache::ValueCache;
use crate::codec::{Cipher, Codecs};
use crate::config::{Config, FileUpdateMode};
use crate::error::{Error, Result};
use crate::flock::FileLock;

/// An embedded, single-file, persistent key-value store.
///
/// Keys and values are opaque byte slices. All mutating operations go
/// through one writer at a time; `get` and `contains` run concurrently with
/// the writer. Durability is flush-based: a returned [`Store::flush`] is a
/// barrier for every earlier successful write.
pub struct Store {
    pub(super) path: PathBuf,
    pub(super) config: Config,
    pub(super) codecs: Codecs,

    /// Primary index: key bytes to live entry.
    pub(super) index: DashMap<Vec<u8>, IndexEntry>,
    /// Removed entries whose on-disk slot still needs its deleted flag
    /// flipped at the next flush.
    pub(super) tombstones: Mutex<HashMap<Vec<u8>, IndexEntry>>,
    pub(super) header: Mutex<FileHeader>,
    /// The file handle and its append buffer. Readers share this lock; the
    /// compactor takes it exclusively for the atomic swap.
    pub(super) appender: RwLock<Arc<Appender>>,

    pub(super) write_lock: Mutex<()>,
    pub(super) dirty: AtomicBool,
    pub(super) compacting: AtomicBool,

    pub(super) cache: Option<ValueCache>,
    _lock: FileLock,
}

impl Store {
    /// Opens or creates the store at `path`.
    ///
    /// An existing file must carry the same codec identities as `config`
    /// ([`Error::ConfigMismatch`] otherwise) and, when encrypted, unseal
    /// under the configured key ([`Error::AuthFailure`]).
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let codecs = Codecs::from_config(&config)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let lock = FileLock::acquire(&path)?;
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let created = file.metadata()?.len() == 0;
        let header = if created {
            let mut header = FileHeader::create(&codecs);
            header.write(&file, &codecs.cipher)?;
            file.sync_all()?;
            header
        } else {
            let header = match FileHeader::read(&file, &codecs.cipher) {
                Ok(header) => header,
                Err(err) if !codecs.cipher.is_none() => {
                    // An unsealed parse tells "this file was never
                    // encrypted" apart from a wrong key.
                    if let Ok(plain) = FileHeader::read(&file, &Cipher::None) {
                        plain.validate_compatibility(&codecs)?;
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            header.validate_compatibility(&codecs)?;
            header
        };

        let capacity = if config.write_buffer_enabled {
            config.write_buffer_bytes()
        } else {
            0
        };
        let appender = Appender::open(file, capacity)?;

        let index = DashMap::new();
        if !created {
            for (key, entry) in index::load(&appender, &header, &codecs, config.max_key_length)? {
                index.insert(key, entry);
            }
        }
        tracing::info!(
            path = %path.display(),
            entries = index.len(),
            created = created,
            "store opened"
        );

        let cache = config
            .memory_mode_enabled
            .then(|| ValueCache::new(config.cache_capacity, config.cache_ttl));

        Ok(Self {
            path,
            config,
            codecs,
            index,
            tombstones: Mutex::new(HashMap::new()),
            header: Mutex::new(header),
            appender: RwLock::new(Arc::new(appender)),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            cache,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Index-only membership test.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.get(key).map(|e| !e.is_deleted).unwrap_or(false)
    }

    /// Snapshot of the live keys.
    pub fn keys(&self) -> impl Iterator<Item = Vec<u8>> {
        self.index
            .iter()
            .map(|e| e.key().clone())
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Stores `value` under `key`.
    ///
    /// Storing bytes whose processed form already stamps equal to the
    /// current entry is a no-op. In replace mode an update that fits the
    /// existing slot is rewritten in place; otherwise the value is appended.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let processed = self.codecs.process(value)?;
        if processed.len() > u32::MAX as usize {
            return Err(Error::InvalidInput(
                "processed value exceeds 4 GiB".to_string(),
            ));
        }
        let hash = self.codecs.stamp(&processed);

        let _write = self.write_lock.lock()?;
        let appender = self.appender.read()?.clone();

        let previous = self.index.get(key).map(|e| *e);
        if let Some(prev) = previous {
            if prev.value_hash == hash {
                if let Some(cache) = &self.cache {
                    cache.insert(key, value);
                }
                return Ok(());
            }
        }

        let position = match previous {
            Some(prev)
                if self.config.file_update_mode == FileUpdateMode::Replace
                    && prev.value_position >= 0
                    && prev.value_length as usize >= processed.len() =>
            {
                appender.write_at(prev.value_position as u64, &processed)?;
                prev.value_position
            }
            _ => appender.append(&processed)? as i64,
        };

        let (key_position, resurrected) = self.slot_for(key, previous.as_ref())?;
        let entry = IndexEntry {
            value_position: position,
            value_length: processed.len() as u32,
            value_hash: hash,
            timestamp_ms: now_ms(),
            is_deleted: false,
            is_updated: true,
            key_position,
        };
        self.index.insert(key.to_vec(), entry);
        self.dirty.store(true, Ordering::Release);

        if self.config.update_validation_enabled {
            if let Err(err) = self.validate_write(&appender, &entry, value) {
                self.revert_set(key, previous, resurrected);
                return Err(err);
            }
        }
        if let Some(cache) = &self.cache {
            cache.insert(key, value);
        }
        Ok(())
    }

    /// Retrieves the value stored under `key`.
    ///
    /// A value whose bytes fail to read, verify or restore is reported
    /// missing; the failure is logged, never raised.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(key) {
                return Ok(Some(value));
            }
        }

        let appender = self.appender.read()?;
        let entry = match self.index.get(key) {
            Some(e) if !e.is_deleted && e.value_position >= 0 => *e,
            _ => return Ok(None),
        };

        // Bytes past the durable length still sit in the append buffer.
        if entry.value_end() > appender.durable_len() {
            appender.flush()?;
        }

        let mut stored = vec![0u8; entry.value_length as usize];
        if let Err(e) = appender.read_at(entry.value_position as u64, &mut stored) {
            tracing::warn!(position = entry.value_position, error = %e, "stored value unreadable");
            return Ok(None);
        }
        if self.config.integrity_verification_enabled && self.codecs.stamp(&stored) != entry.value_hash
        {
            tracing::warn!(position = entry.value_position, "stored value stamp mismatch");
            return Ok(None);
        }
        match self.codecs.restore(&stored) {
            Ok(value) => {
                if let Some(cache) = &self.cache {
                    cache.insert(key, &value);
                }
                Ok(Some(value))
            }
            Err(e) => {
                tracing::warn!(position = entry.value_position, error = %e, "stored value failed to restore");
                Ok(None)
            }
        }
    }

    /// Removes `key`, returning whether it existed. The on-disk entry stays
    /// until the next flush tombstones it and compaction reclaims it.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let _write = self.write_lock.lock()?;
        self.delete_locked(key)
    }

    /// Removes every key in `keys` under one write lock, returning how many
    /// existed.
    pub fn delete_batch<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<usize> {
        let _write = self.write_lock.lock()?;
        let mut removed = 0;
        for key in keys {
            if self.delete_locked(key.as_ref())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stores a batch under one write lock and returns how many entries were
    /// written. With `skip_duplicates`, items whose processed form already
    /// stamps equal to the stored entry are skipped.
    ///
    /// Values that fit their existing slot (replace mode) are rewritten in
    /// place; the rest are composed into one contiguous append.
    pub fn set_batch<K, V>(&self, items: &[(K, V)], skip_duplicates: bool) -> Result<usize>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        struct Planned<'a> {
            key: &'a [u8],
            value: &'a [u8],
            processed: Vec<u8>,
            hash: u64,
            previous: Option<IndexEntry>,
        }

        if items.is_empty() {
            return Ok(0);
        }
        let _write = self.write_lock.lock()?;
        let appender = self.appender.read()?.clone();

        let mut planned: Vec<Planned> = Vec::with_capacity(items.len());
        let mut slots: HashMap<&[u8], usize> = HashMap::new();
        for (key, value) in items {
            let (key, value) = (key.as_ref(), value.as_ref());
            self.check_key(key)?;
            let processed = self.codecs.process(value)?;
            let hash = self.codecs.stamp(&processed);
            let previous = self.index.get(key).map(|e| *e);
            if skip_duplicates && previous.is_some_and(|prev| prev.value_hash == hash) {
                continue;
            }
            let plan = Planned {
                key,
                value,
                processed,
                hash,
                previous,
            };
            // Last occurrence of a key wins within one batch.
            match slots.get(key) {
                Some(&at) => planned[at] = plan,
                None => {
                    slots.insert(key, planned.len());
                    planned.push(plan);
                }
            }
        }

        let replace = self.config.file_update_mode == FileUpdateMode::Replace;
        let (reuse, append): (Vec<_>, Vec<_>) = planned.into_iter().partition_map(|p| {
            match p.previous {
                Some(prev)
                    if replace
                        && prev.value_position >= 0
                        && prev.value_length as usize >= p.processed.len() =>
                {
                    Either::Left((prev.value_position as u64, p))
                }
                _ => Either::Right(p),
            }
        });

        for (position, p) in &reuse {
            appender.write_at(*position, &p.processed)?;
        }

        let mut to_install: Vec<(&Planned, i64)> = Vec::with_capacity(reuse.len() + append.len());
        for (position, p) in &reuse {
            to_install.push((p, *position as i64));
        }

        let total: usize = append.iter().map(|p| p.processed.len()).sum();
        if !append.is_empty() {
            appender.preallocate(total as u64)?;
            let base = appender.end_position()?;
            let mut blob = Vec::with_capacity(total);
            for p in &append {
                to_install.push((p, (base + blob.len() as u64) as i64));
                blob.extend_from_slice(&p.processed);
            }
            appender.append(&blob)?;
        }

        let mut installed: Vec<(IndexEntry, &[u8])> = Vec::with_capacity(to_install.len());
        for (p, position) in &to_install {
            let (key_position, _) = self.slot_for(p.key, p.previous.as_ref())?;
            let entry = IndexEntry {
                value_position: *position,
                value_length: p.processed.len() as u32,
                value_hash: p.hash,
                timestamp_ms: now_ms(),
                is_deleted: false,
                is_updated: true,
                key_position,
            };
            self.index.insert(p.key.to_vec(), entry);
            if let Some(cache) = &self.cache {
                cache.insert(p.key, p.value);
            }
            installed.push((entry, p.value));
        }
        if !installed.is_empty() {
            self.dirty.store(true, Ordering::Release);
        }

        if self.config.update_validation_enabled && !installed.is_empty() {
            let step = (installed.len() / 10).max(1);
            let sample: Vec<&(IndexEntry, &[u8])> = installed.iter().step_by(step).take(10).collect();
            let appender = &*appender;
            let results: Vec<Result<()>> = std::thread::scope(|scope| {
                let handles: Vec<_> = sample
                    .into_iter()
                    .map(|(entry, value)| {
                        scope.spawn(move || self.validate_write(appender, entry, value))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err(Error::IO("validation thread panicked".to_string())))
                    })
                    .collect()
            });
            for result in results {
                result?;
            }
        }

        Ok(installed.len())
    }

    /// Drops every entry and truncates the file back to its header.
    pub fn clear(&self) -> Result<()> {
        let _write = self.write_lock.lock()?;
        let appender = self.appender.read()?.clone();

        self.index.clear();
        self.tombstones.lock()?.clear();
        if let Some(cache) = &self.cache {
            cache.clear();
        }

        appender.clear_buffer()?;
        appender.truncate(FileHeader::disk_size(&self.codecs.cipher))?;
        let mut header = self.header.lock()?;
        header.index_start = 0;
        header.index_used = 0;
        header.index_space = 0;
        header.index_count = 0;
        header.write(appender.file(), &self.codecs.cipher)?;
        appender.sync()?;
        self.dirty.store(false, Ordering::Release);
        tracing::info!(path = %self.path.display(), "store cleared");
        Ok(())
    }

    /// Durability barrier: persists the index, the header and every earlier
    /// successful write, then fsyncs. May trigger automatic compaction.
    pub fn flush(&self) -> Result<()> {
        let _write = self.write_lock.lock()?;
        self.flush_locked()?;
        if self.config.auto_compact_enabled && compaction::should_compact(self)? {
            compaction::perform_compact(self, false)?;
        }
        Ok(())
    }

    /// Rewrites the file keeping only live entries. With `all_compact` the
    /// rebuilt index region gets no growth pad.
    pub fn compact(&self, all_compact: bool) -> Result<()> {
        let _write = self.write_lock.lock()?;
        self.flush_locked()?;
        compaction::perform_compact(self, all_compact)
    }

    /// Flushes and releases the store. Equivalent to dropping it, but
    /// surfaces errors.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    pub(super) fn flush_locked(&self) -> Result<()> {
        let appender = self.appender.read()?.clone();
        appender.flush()?;
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut header = self.header.lock()?;
        let mut tombstones = self.tombstones.lock()?;
        index::persist(
            &self.index,
            &tombstones,
            &mut header,
            &appender,
            &self.codecs,
            self.config.index_rebuild_threshold,
        )?;
        header.index_count = self.index.len() as u32;
        header.write(appender.file(), &self.codecs.cipher)?;
        appender.sync()?;

        tombstones.clear();
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Flushes only the append buffer. Driven by the background buffer
    /// timer.
    pub(crate) fn flush_write_buffer(&self) -> Result<()> {
        self.appender.read()?.flush()
    }

    /// Total bytes of live stored values.
    pub(super) fn live_value_bytes(&self) -> u64 {
        self.index.iter().map(|e| e.value_length as u64).sum()
    }

    fn delete_locked(&self, key: &[u8]) -> Result<bool> {
        match self.index.remove(key) {
            Some((key, mut entry)) => {
                entry.is_deleted = true;
                entry.is_updated = true;
                if let Some(cache) = &self.cache {
                    cache.remove(&key);
                }
                // Entries that never reached disk have no slot to flip.
                if entry.key_position >= 0 {
                    self.tombstones.lock()?.insert(key, entry);
                }
                self.dirty.store(true, Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The on-disk index slot the new incarnation of `key` inherits: its
    /// previous entry's, or a tombstoned slot when the key was deleted since
    /// the last flush. Returns the reclaimed tombstone for revert purposes.
    fn slot_for(
        &self,
        key: &[u8],
        previous: Option<&IndexEntry>,
    ) -> Result<(i64, Option<IndexEntry>)> {
        if let Some(prev) = previous {
            return Ok((prev.key_position, None));
        }
        let mut tombstones = self.tombstones.lock()?;
        match tombstones.remove(key) {
            Some(tombstone) => Ok((tombstone.key_position, Some(tombstone))),
            None => Ok((-1, None)),
        }
    }

    /// Reads `entry` back from the file and compares the restored bytes to
    /// the caller's value.
    fn validate_write(&self, appender: &Appender, entry: &IndexEntry, expected: &[u8]) -> Result<()> {
        appender.flush()?;
        let mut stored = vec![0u8; entry.value_length as usize];
        appender.read_at(entry.value_position as u64, &mut stored)?;
        let restored = self
            .codecs
            .restore(&stored)
            .map_err(|e| Error::Validation(format!("stored value does not restore: {e}")))?;
        if restored != expected {
            return Err(Error::Validation(
                "read-back differs from the written value".to_string(),
            ));
        }
        Ok(())
    }

    /// Rolls the in-memory state for `key` back to what it was before a set
    /// whose validation failed, before the dirty entry can reach a flush.
    fn revert_set(
        &self,
        key: &[u8],
        previous: Option<IndexEntry>,
        resurrected: Option<IndexEntry>,
    ) {
        match previous {
            Some(prev) => {
                self.index.insert(key.to_vec(), prev);
            }
            None => {
                self.index.remove(key);
            }
        }
        if let Some(tombstone) = resurrected {
            if let Ok(mut tombstones) = self.tombstones.lock() {
                tombstones.insert(key.to_vec(), tombstone);
            }
        }
        if let Some(cache) = &self.cache {
            cache.remove(key);
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("key must not be empty".to_string()));
        }
        if key.len() > self.config.max_key_length {
            return Err(Error::InvalidInput(format!(
                "key of {} bytes exceeds the {}-byte maximum",
                key.len(),
                self.config.max_key_length
            )));
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.dirty.load(Ordering::Acquire) {
            if let Err(e) = self.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "flush on close failed");
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .finish()
    }
}
