use std::time::Duration;

use crate::codec::{Compression, Encryption, HashKind};

/// Update policy for values that already exist in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileUpdateMode {
    /// Always write the new value at the end of the file.
    Append,
    /// Overwrite the value in place when the new processed size fits the
    /// existing slot, otherwise append.
    Replace,
}

/// Configuration for a store.
///
/// The three codec identities and the encryption key are fixed at file
/// creation time; reopening an existing file with different codecs fails
/// with [`crate::Error::ConfigMismatch`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Value compressor applied before encryption (default: none).
    pub compression: Compression,

    /// AEAD cipher sealing values, index entries and the header
    /// (default: none).
    pub encryption: Encryption,

    /// Hash whose digest stamps every stored value (default: XXH3).
    pub hash: HashKind,

    /// Encryption key, required and at least 16 characters when a cipher is
    /// configured. Stretched to 32 bytes with SHA-256.
    pub encryption_key: Option<String>,

    /// Maximum accepted key length in bytes (default: 4096).
    pub max_key_length: usize,

    /// Buffer size in KiB for streamed region writes such as index rebuilds
    /// and compaction copies (default: 64, clamped to at least 4).
    pub file_stream_buffer_kb: usize,

    /// Enable the write-through append buffer (default: true).
    pub write_buffer_enabled: bool,

    /// Append buffer capacity in KiB (default: 1024, floor 4).
    pub write_buffer_kb: usize,

    /// How long appended bytes may sit in the buffer before the background
    /// timer flushes them (default: 5s, floor 100ms).
    pub write_buffer_time_threshold: Duration,

    /// Interval of the background flush driver (default: 5s, zero disables).
    pub flush_interval: Duration,

    /// Interval of the background status logger (default: 60s, zero
    /// disables).
    pub stats_interval: Duration,

    /// Update policy for existing keys (default: append).
    pub file_update_mode: FileUpdateMode,

    /// Run compaction automatically from `flush` when the reclaimable space
    /// crosses the threshold (default: false).
    pub auto_compact_enabled: bool,

    /// Reclaimable percentage of the file length that triggers automatic
    /// compaction, 0-255 (default: 50).
    pub auto_compact_threshold: u8,

    /// Percentage of tombstone waste in the index region that forces a full
    /// index rebuild, and the growth-pad percentage added to rebuilt
    /// regions, 0-100 (default: 20, zero disables padding and always
    /// rebuilds).
    pub index_rebuild_threshold: u8,

    /// Read every `set` back from disk and compare it to the caller value
    /// (default: false).
    pub update_validation_enabled: bool,

    /// Verify the stored 8-byte stamp on reads and compaction copies
    /// (default: true).
    pub integrity_verification_enabled: bool,

    /// Keep a read-through in-memory value cache in front of the file
    /// (default: false).
    pub memory_mode_enabled: bool,

    /// Capacity of the value cache in entries (default: 4096).
    pub cache_capacity: usize,

    /// Optional time-to-live for cached values (default: none).
    pub cache_ttl: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            encryption: Encryption::None,
            hash: HashKind::Xxh3,
            encryption_key: None,
            max_key_length: 4096,
            file_stream_buffer_kb: 64,
            write_buffer_enabled: true,
            write_buffer_kb: 1024,
            write_buffer_time_threshold: Duration::from_secs(5),
            flush_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
            file_update_mode: FileUpdateMode::Append,
            auto_compact_enabled: false,
            auto_compact_threshold: 50,
            index_rebuild_threshold: 20,
            update_validation_enabled: false,
            integrity_verification_enabled: true,
            memory_mode_enabled: false,
            cache_capacity: 4096,
            cache_ttl: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value compressor.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the AEAD cipher and its key.
    pub fn encryption(mut self, encryption: Encryption, key: impl Into<String>) -> Self {
        self.encryption = encryption;
        self.encryption_key = Some(key.into());
        self
    }

    /// Set the value hash.
    pub fn hash(mut self, hash: HashKind) -> Self {
        self.hash = hash;
        self
    }

    /// Set the maximum key length in bytes.
    pub fn max_key_length(mut self, len: usize) -> Self {
        self.max_key_length = len;
        self
    }

    /// Set the streamed-write buffer size in KiB.
    pub fn file_stream_buffer_kb(mut self, kb: usize) -> Self {
        self.file_stream_buffer_kb = kb;
        self
    }

    /// Enable or disable the append buffer.
    pub fn write_buffer_enabled(mut self, enabled: bool) -> Self {
        self.write_buffer_enabled = enabled;
        self
    }

    /// Set the append buffer capacity in KiB.
    pub fn write_buffer_kb(mut self, kb: usize) -> Self {
        self.write_buffer_kb = kb;
        self
    }

    /// Set the append buffer flush timer interval.
    pub fn write_buffer_time_threshold(mut self, threshold: Duration) -> Self {
        self.write_buffer_time_threshold = threshold;
        self
    }

    /// Set the background flush interval (zero disables the driver).
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the background status-logging interval (zero disables it).
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the update policy for existing keys.
    pub fn file_update_mode(mut self, mode: FileUpdateMode) -> Self {
        self.file_update_mode = mode;
        self
    }

    /// Enable automatic compaction at the given reclaimable-space threshold.
    pub fn auto_compact(mut self, enabled: bool, threshold: u8) -> Self {
        self.auto_compact_enabled = enabled;
        self.auto_compact_threshold = threshold;
        self
    }

    /// Set the index rebuild / growth-pad threshold percentage.
    pub fn index_rebuild_threshold(mut self, threshold: u8) -> Self {
        self.index_rebuild_threshold = threshold.min(100);
        self
    }

    /// Enable read-back validation of every `set`.
    pub fn update_validation(mut self, enabled: bool) -> Self {
        self.update_validation_enabled = enabled;
        self
    }

    /// Enable or disable stamp verification on reads and compaction.
    pub fn integrity_verification(mut self, enabled: bool) -> Self {
        self.integrity_verification_enabled = enabled;
        self
    }

    /// Enable the in-memory value cache with the given capacity and TTL.
    pub fn memory_mode(mut self, capacity: usize, ttl: Option<Duration>) -> Self {
        self.memory_mode_enabled = true;
        self.cache_capacity = capacity;
        self.cache_ttl = ttl;
        self
    }

    /// Append buffer capacity in bytes after clamping.
    pub(crate) fn write_buffer_bytes(&self) -> usize {
        self.write_buffer_kb.max(4) * 1024
    }

    /// Streamed-write buffer size in bytes after clamping.
    pub(crate) fn stream_buffer_bytes(&self) -> usize {
        self.file_stream_buffer_kb.max(4) * 1024
    }

    /// Buffer flush timer interval after clamping.
    pub(crate) fn write_buffer_interval(&self) -> Duration {
        self.write_buffer_time_threshold.max(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.encryption, Encryption::None);
        assert_eq!(config.hash, HashKind::Xxh3);
        assert_eq!(config.max_key_length, 4096);
        assert_eq!(config.write_buffer_kb, 1024);
        assert_eq!(config.file_update_mode, FileUpdateMode::Append);
        assert!(!config.auto_compact_enabled);
        assert_eq!(config.auto_compact_threshold, 50);
        assert_eq!(config.index_rebuild_threshold, 20);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .compression(Compression::Lz4)
            .encryption(Encryption::Aes256Gcm, "MySecure32ByteEncryptionKey12345")
            .file_update_mode(FileUpdateMode::Replace)
            .write_buffer_kb(16)
            .auto_compact(true, 30);

        assert_eq!(config.compression, Compression::Lz4);
        assert_eq!(config.encryption, Encryption::Aes256Gcm);
        assert!(config.encryption_key.is_some());
        assert_eq!(config.file_update_mode, FileUpdateMode::Replace);
        assert!(config.auto_compact_enabled);
        assert_eq!(config.auto_compact_threshold, 30);
    }

    #[test]
    fn test_clamps() {
        let config = Config::new().write_buffer_kb(1).file_stream_buffer_kb(0);
        assert_eq!(config.write_buffer_bytes(), 4 * 1024);
        assert_eq!(config.stream_buffer_bytes(), 4 * 1024);

        let config = Config::new().write_buffer_time_threshold(Duration::from_millis(10));
        assert_eq!(config.write_buffer_interval(), Duration::from_millis(100));
    }
}
