//! # FSKV
//!
//! An embedded, single-file, persistent key-value store with:
//! - Durable point operations: set, get, contains, delete, batches, clear
//! - Pluggable compression, AEAD encryption and hash stamping per file
//! - A buffered append-mostly write path with flush-based durability
//! - Atomic compaction that rewrites the file and reclaims space
//!
//! ## Architecture Overview
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Registry / Database                     |
//! |        (named engines, background flush + buffer timers)     |
//! +------------------------------+-------------------------------+
//!                                |
//! +------------------------------v-------------------------------+
//! |                          Store core                          |
//! |     write lock | primary index (concurrent map) | codecs     |
//! +------+------------------------+-------------------+----------+
//!        |                        |                   |
//! +------v------+        +--------v--------+   +------v------+
//! |  Buffered   |        |      Index      |   |  Compactor  |
//! |  appender   |        |   persistence   |   | (file swap) |
//! +------+------+        +--------+--------+   +------+------+
//!        |                        |                   |
//! +------v------------------------v-------------------v----------+
//! |               single file: header | values | index           |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use fskv::{Config, Store};
//!
//! # fn main() -> fskv::Result<()> {
//! let store = Store::open("app.fskv", Config::default())?;
//! store.set(b"alpha", b"one")?;
//! store.flush()?;
//! assert_eq!(store.get(b"alpha")?, Some(b"one".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! The store is single-process, single-writer: mutating calls serialize on a
//! per-store write lock while reads run concurrently, and an advisory file
//! lock rejects a second process up front.

pub mod cache;
pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod flock;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use codec::{Compression, Encryption, HashKind};
pub use config::{Config, FileUpdateMode};
pub use database::Database;
pub use error::{Error, Result};
pub use registry::Registry;
pub use store::{Stats, Store};

/// Current version of FSKV.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
