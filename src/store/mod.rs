//! The storage engine: single-file layout, in-memory primary index, buffered
//! write path, index persistence and compaction.
//!
//! ## File layout
//!
//! ```text
//! +----------------------------+
//! | Header (64 B, + AEAD pad)  |
//! +----------------------------+
//! | Value region               |
//! |   processed value blobs    |
//! +----------------------------+
//! | Index region               |
//! |   index entries            |
//! |   growth pad (free)        |
//! +----------------------------+
//! ```
//!
//! This is the canonical shape at creation and after compaction. Between
//! compactions the file grows strictly by appends, so newer value blobs and
//! rebuilt index regions land after older ones; the header always points at
//! the live index region and positions are file-absolute throughout.

mod appender;
mod compaction;
mod engine;
mod entry;
mod header;
mod index;
mod stats;
pub(crate) mod tasks;

pub use engine::Store;
pub use stats::Stats;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `path` with `suffix` appended to its file name, e.g. `db` ->
/// `db.compact.tmp`.
pub(crate) fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
