//! Background tasks driving a store: periodic flush, append-buffer drain
//! and status logging.

use std::sync::Arc;
use std::time::Duration;

use super::Store;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

/// Runs a full flush every `flush_interval`; automatic compaction piggybacks
/// on it when enabled.
pub struct FlushTask {
    store: Arc<Store>,
}

impl FlushTask {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.store.config().flush_interval
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        self.store.flush()
    }
}

/// Drains the append buffer so staged bytes never sit longer than the
/// configured time threshold.
pub struct WriteBufferTask {
    store: Arc<Store>,
}

impl WriteBufferTask {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl BackgroundTask for WriteBufferTask {
    fn name(&self) -> &'static str {
        "write-buffer"
    }

    fn interval(&self) -> Duration {
        self.store.config().write_buffer_interval()
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        self.store.flush_write_buffer()
    }
}

/// Periodically logs the store's shape.
pub struct StatsTask {
    store: Arc<Store>,
}

impl StatsTask {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl BackgroundTask for StatsTask {
    fn name(&self) -> &'static str {
        "status"
    }

    fn interval(&self) -> Duration {
        self.store.config().stats_interval
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        self.store.status().map(|_| ())
    }
}
