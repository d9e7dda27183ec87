//! A store plus its background drivers.
//!
//! [`Database`] wires the flush, write-buffer and status tasks to a
//! [`Store`] and shuts them down cleanly on close. It dereferences to the
//! store, so the full engine API is available on it directly.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::store::tasks::{FlushTask, StatsTask, WriteBufferTask};
use crate::store::Store;

pub struct Database {
    store: Arc<Store>,
    scheduler: Option<Scheduler>,
}

impl Database {
    /// Opens the store at `path` and starts its background drivers. A zero
    /// `flush_interval` disables the flush driver; the buffer timer runs
    /// whenever the write buffer is enabled.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let store = Arc::new(Store::open(path, config)?);
        let config = store.config();

        let drive_flush = config.flush_interval > Duration::ZERO;
        let drive_buffer = config.write_buffer_enabled;
        let drive_stats = config.stats_interval > Duration::ZERO;

        let scheduler = (drive_flush || drive_buffer || drive_stats).then(Scheduler::new);
        if let Some(scheduler) = &scheduler {
            if drive_flush {
                scheduler.register(Arc::new(FlushTask::new(store.clone())));
            }
            if drive_buffer {
                scheduler.register(Arc::new(WriteBufferTask::new(store.clone())));
            }
            if drive_stats {
                scheduler.register(Arc::new(StatsTask::new(store.clone())));
            }
        }

        Ok(Self { store, scheduler })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Stops the background drivers, flushes and releases the store.
    pub fn close(mut self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown()?;
        }
        self.store.flush()
    }
}

impl Deref for Database {
    type Target = Store;

    fn deref(&self) -> &Store {
        &self.store
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.shutdown() {
                tracing::warn!(error = %e, "scheduler shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_derefs_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            dir.path().join("db.fskv"),
            Config::new().flush_interval(Duration::ZERO),
        )
        .unwrap();

        db.set(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.len(), 1);
        db.close().unwrap();
    }

    #[test]
    fn test_background_flush_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.fskv");
        {
            let db = Database::open(
                &path,
                Config::new().flush_interval(Duration::from_millis(30)),
            )
            .unwrap();
            db.set(b"driven", b"by-timer").unwrap();

            // The flush driver picks the write up without an explicit flush.
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while db.stats().unwrap().dirty {
                assert!(std::time::Instant::now() < deadline, "flush driver never ran");
                std::thread::sleep(Duration::from_millis(10));
            }
            db.close().unwrap();
        }
        let db = Database::open(&path, Config::default()).unwrap();
        assert_eq!(db.get(b"driven").unwrap(), Some(b"by-timer".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_flush_driver_disabled_by_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            dir.path().join("db.fskv"),
            Config::new()
                .flush_interval(Duration::ZERO)
                .stats_interval(Duration::ZERO)
                .write_buffer_enabled(false),
        )
        .unwrap();
        assert!(db.scheduler.is_none());
        db.close().unwrap();
    }
}
