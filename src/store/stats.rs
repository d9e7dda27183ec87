use std::sync::atomic::Ordering;

use super::compaction;
use super::engine::Store;
use crate::error::Result;

/// Point-in-time snapshot of a store's shape.
#[derive(Debug, Clone)]
pub struct Stats {
    /// Live keys in the index.
    pub live_entries: usize,
    /// Removed entries waiting for their on-disk tombstone flip.
    pub pending_tombstones: usize,
    /// Logical file length including staged appends.
    pub file_length: u64,
    /// Bytes staged in the append buffer.
    pub buffered_bytes: usize,
    /// Total stored size of live values.
    pub live_value_bytes: u64,
    pub index_start: u64,
    pub index_used: u32,
    pub index_space: u32,
    /// Bytes a compaction would reclaim.
    pub reclaimable_bytes: u64,
    /// Mutations since the last flush.
    pub dirty: bool,
    pub compacting: bool,
}

impl Store {
    pub fn stats(&self) -> Result<Stats> {
        let appender = self.appender.read()?;
        let header = self.header.lock()?;
        let file_length = appender.end_position()?;
        Ok(Stats {
            live_entries: self.index.len(),
            pending_tombstones: self.tombstones.lock()?.len(),
            file_length,
            buffered_bytes: appender.buffered()?,
            live_value_bytes: self.live_value_bytes(),
            index_start: header.index_start,
            index_used: header.index_used,
            index_space: header.index_space,
            reclaimable_bytes: compaction::free_bytes(self, &header, file_length),
            dirty: self.dirty.load(Ordering::Acquire),
            compacting: self.compacting.load(Ordering::Acquire),
        })
    }

    /// Logs a status line. Driven by the background stats task.
    pub(crate) fn status(&self) -> Result<Stats> {
        let stats = self.stats()?;
        tracing::info!(
            entries = stats.live_entries,
            file_length = stats.file_length,
            index_used = stats.index_used,
            reclaimable = stats.reclaimable_bytes,
            dirty = stats.dirty,
            "store status"
        );
        Ok(stats)
    }
}
