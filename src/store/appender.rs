//! Buffered appender over the store's file handle.
//!
//! All file I/O goes through positioned reads and writes at absolute
//! offsets, so the handle carries no cursor state and concurrent readers
//! never interfere with the writer. Appends are staged in an in-memory
//! buffer; the position an append returns is the file-absolute offset the
//! bytes occupy once the buffer is flushed. The engine flushes the buffer
//! before any positioned read whose range extends past the durable length.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;

/// Reads exactly `buf.len()` bytes at `offset` without touching any cursor.
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of file",
                ));
            }
            read += n;
        }
        Ok(())
    }
}

/// Writes all of `buf` at `offset` without touching any cursor.
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = file.seek_write(&buf[written..], offset + written as u64)?;
            written += n;
        }
        Ok(())
    }
}

/// Write-through append buffer bound to one file handle.
///
/// Mutating operations serialize on the interior buffer lock, so the type is
/// shared behind `&self`. The durable length counts bytes actually in the
/// file; the end position additionally counts staged bytes.
pub struct Appender {
    file: File,
    /// Buffer capacity in bytes; zero disables staging entirely.
    capacity: usize,
    /// Bytes physically written to the file (the physical file may be longer
    /// after a preallocation hint).
    durable_len: AtomicU64,
    buf: Mutex<Vec<u8>>,
}

impl Appender {
    /// Binds an appender to `file`, treating the current physical length as
    /// the logical end.
    pub fn open(file: File, capacity: usize) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            capacity,
            durable_len: AtomicU64::new(len),
            buf: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Bytes physically in the file.
    pub fn durable_len(&self) -> u64 {
        self.durable_len.load(Ordering::Acquire)
    }

    /// Logical end of the file: durable bytes plus staged bytes. This is the
    /// position the next append returns.
    pub fn end_position(&self) -> Result<u64> {
        let buf = self.buf.lock()?;
        Ok(self.durable_len() + buf.len() as u64)
    }

    /// Bytes currently staged in the buffer.
    pub fn buffered(&self) -> Result<usize> {
        Ok(self.buf.lock()?.len())
    }

    /// Stages `bytes` at the end of the file and returns the file-absolute
    /// position they will occupy. Oversized or overflowing appends flush the
    /// buffer and write directly; a buffer at 80% occupancy is flushed
    /// eagerly.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut buf = self.buf.lock()?;
        let position = self.durable_len() + buf.len() as u64;

        if self.capacity == 0 || bytes.len() >= self.capacity {
            self.flush_locked(&mut buf)?;
            let at = self.durable_len();
            write_all_at(&self.file, bytes, at)?;
            self.durable_len
                .store(at + bytes.len() as u64, Ordering::Release);
            return Ok(position);
        }

        if buf.len() + bytes.len() > self.capacity {
            self.flush_locked(&mut buf)?;
        }
        buf.extend_from_slice(bytes);
        if buf.len() * 5 >= self.capacity * 4 {
            self.flush_locked(&mut buf)?;
        }
        Ok(position)
    }

    /// Flushes the buffer and rewrites bytes at an absolute position. Used by
    /// replace-mode updates and index patches.
    pub fn write_at(&self, position: u64, bytes: &[u8]) -> Result<()> {
        let mut buf = self.buf.lock()?;
        self.flush_locked(&mut buf)?;
        write_all_at(&self.file, bytes, position)?;
        Ok(())
    }

    /// Positioned read. The caller must ensure the range is durable, flushing
    /// first when it extends past [`Appender::durable_len`].
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, buf, position)?;
        Ok(())
    }

    /// Extends the physical file so upcoming appends of `n` total bytes do
    /// not grow it incrementally. The logical end is unchanged.
    pub fn preallocate(&self, n: u64) -> Result<()> {
        let buf = self.buf.lock()?;
        let target = self.durable_len() + buf.len() as u64 + n;
        if target > self.file.metadata()?.len() {
            self.file.set_len(target)?;
        }
        Ok(())
    }

    /// Flushes, then advances the logical end past `n` zero bytes, extending
    /// the physical file as needed. Returns the position where the skipped
    /// run starts. Used to reserve index growth pads.
    pub fn skip(&self, n: u64) -> Result<u64> {
        let mut buf = self.buf.lock()?;
        self.flush_locked(&mut buf)?;
        let start = self.durable_len();
        let target = start + n;
        if target > self.file.metadata()?.len() {
            self.file.set_len(target)?;
        }
        self.durable_len.store(target, Ordering::Release);
        Ok(start)
    }

    /// Writes staged bytes to the file and empties the buffer.
    pub fn flush(&self) -> Result<()> {
        let mut buf = self.buf.lock()?;
        self.flush_locked(&mut buf)
    }

    /// Flush plus fsync: everything staged is durable when this returns.
    pub fn sync(&self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Discards staged bytes without writing them.
    pub fn clear_buffer(&self) -> Result<()> {
        self.buf.lock()?.clear();
        Ok(())
    }

    /// Drops staged bytes and truncates the physical file to `len`.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut buf = self.buf.lock()?;
        buf.clear();
        self.file.set_len(len)?;
        self.durable_len.store(len, Ordering::Release);
        Ok(())
    }

    fn flush_locked(&self, buf: &mut Vec<u8>) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let at = self.durable_len();
        write_all_at(&self.file, buf, at)?;
        self.durable_len
            .store(at + buf.len() as u64, Ordering::Release);
        buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(capacity: usize) -> (tempfile::TempDir, Appender) {
        let dir = tempfile::tempdir().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("data"))
            .unwrap();
        (dir, Appender::open(file, capacity).unwrap())
    }

    #[test]
    fn test_append_positions_are_contiguous() {
        let (_dir, appender) = scratch(1024);
        assert_eq!(appender.append(b"abc").unwrap(), 0);
        assert_eq!(appender.append(b"defgh").unwrap(), 3);
        assert_eq!(appender.end_position().unwrap(), 8);
        // Still staged, nothing durable yet.
        assert_eq!(appender.durable_len(), 0);

        appender.flush().unwrap();
        assert_eq!(appender.durable_len(), 8);

        let mut buf = [0u8; 8];
        appender.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn test_oversized_append_bypasses_buffer() {
        let (_dir, appender) = scratch(16);
        appender.append(b"head").unwrap();
        let big = vec![0xabu8; 64];
        let position = appender.append(&big).unwrap();
        assert_eq!(position, 4);
        // The staged head was flushed ahead of the direct write.
        assert_eq!(appender.durable_len(), 4 + 64);
    }

    #[test]
    fn test_overflow_flushes_first() {
        let (_dir, appender) = scratch(10);
        appender.append(b"12345").unwrap();
        assert_eq!(appender.durable_len(), 0);
        // 5 + 6 > 10 forces a flush of the staged run before buffering.
        let position = appender.append(b"abcdef").unwrap();
        assert_eq!(position, 5);
        assert!(appender.durable_len() >= 5);
        appender.flush().unwrap();

        let mut buf = [0u8; 11];
        appender.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"12345abcdef");
    }

    #[test]
    fn test_nearly_full_buffer_auto_flushes() {
        let (_dir, appender) = scratch(10);
        appender.append(b"12345678").unwrap(); // 8/10 >= 80%
        assert_eq!(appender.durable_len(), 8);
        assert_eq!(appender.buffered().unwrap(), 0);
    }

    #[test]
    fn test_write_at_rewrites_in_place() {
        let (_dir, appender) = scratch(1024);
        appender.append(b"aaaabbbb").unwrap();
        appender.write_at(4, b"XXXX").unwrap();
        let mut buf = [0u8; 8];
        appender.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaaXXXX");
        // write_at flushed the staged bytes first.
        assert_eq!(appender.durable_len(), 8);
    }

    #[test]
    fn test_unbuffered_mode() {
        let (_dir, appender) = scratch(0);
        assert_eq!(appender.append(b"direct").unwrap(), 0);
        assert_eq!(appender.durable_len(), 6);
    }

    #[test]
    fn test_skip_reserves_a_zero_run() {
        let (_dir, appender) = scratch(1024);
        appender.append(b"data").unwrap();
        let pad_start = appender.skip(16).unwrap();
        assert_eq!(pad_start, 4);
        assert_eq!(appender.durable_len(), 20);
        // Appends land after the reserved run.
        assert_eq!(appender.append(b"tail").unwrap(), 20);
    }

    #[test]
    fn test_preallocate_extends_physical_only() {
        let (_dir, appender) = scratch(1024);
        appender.append(b"x").unwrap();
        appender.preallocate(100).unwrap();
        assert_eq!(appender.file().metadata().unwrap().len(), 101);
        // Logical end is unchanged, so the next append overwrites the hint.
        assert_eq!(appender.append(b"y").unwrap(), 1);
    }

    #[test]
    fn test_truncate_discards_staged_bytes() {
        let (_dir, appender) = scratch(1024);
        appender.append(b"keep").unwrap();
        appender.flush().unwrap();
        appender.append(b"drop").unwrap();
        appender.truncate(4).unwrap();
        assert_eq!(appender.end_position().unwrap(), 4);
        assert_eq!(appender.file().metadata().unwrap().len(), 4);
    }
}
