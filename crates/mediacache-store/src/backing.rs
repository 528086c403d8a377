//! Backing store: a byte-addressable container over a file or a memory
//! buffer, with independent read and write cursors.
//!
//! Switching the active direction (a write right after a read at a
//! different offset, or vice versa) costs a repositioning of the
//! underlying medium; callers should batch same-direction work. The
//! `LastOp` state machine tracks the active direction so that sequential
//! same-direction operations never pay a redundant seek.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use mediacache_common::{CacheError, Result};
use tracing::debug;

/// Last operation performed on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastOp {
    None,
    Read,
    Write,
    Seek,
}

/// In-memory medium: a growable buffer with a logical length high-water
/// mark, pre-sized for the bounded case.
struct MemBuffer {
    data: Vec<u8>,
    len: usize,
}

impl MemBuffer {
    fn with_capacity(capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| CacheError::OutOfMemory {
                requested: capacity,
            })?;
        Ok(Self { data, len: 0 })
    }

    fn ensure_len(&mut self, len: usize) -> Result<()> {
        if len > self.data.len() {
            let grow = len - self.data.len();
            if len > self.data.capacity() {
                self.data
                    .try_reserve(grow)
                    .map_err(|_| CacheError::OutOfMemory { requested: grow })?;
            }
            self.data.resize(len, 0);
        }
        Ok(())
    }
}

/// The storage medium behind a backing store.
enum Medium {
    File(File),
    Memory(MemBuffer),
}

/// Byte-addressable container with independent read and write cursors and
/// fixed-width little-endian integer access.
pub struct BackingStore {
    medium: Option<Medium>,
    read_pos: u64,
    write_pos: u64,
    /// Physical position of the single underlying cursor (file medium).
    physical_pos: u64,
    last_op: LastOp,
}

impl BackingStore {
    /// Opens or creates a file-backed container.
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        debug!(path = %path.display(), "opened file-backed container");

        Ok(Self {
            medium: Some(Medium::File(file)),
            read_pos: 0,
            write_pos: 0,
            physical_pos: 0,
            last_op: LastOp::None,
        })
    }

    /// Creates a memory-backed container pre-sized to `capacity` bytes.
    pub fn open_memory(capacity: usize) -> Result<Self> {
        let buffer = MemBuffer::with_capacity(capacity)?;

        debug!(capacity, "opened memory-backed container");

        Ok(Self {
            medium: Some(Medium::Memory(buffer)),
            read_pos: 0,
            write_pos: 0,
            physical_pos: 0,
            last_op: LastOp::None,
        })
    }

    fn medium(&mut self) -> Result<&mut Medium> {
        self.medium
            .as_mut()
            .ok_or_else(|| CacheError::Unsupported("container is closed".to_string()))
    }

    /// Returns true if the container has not been closed.
    pub fn is_open(&self) -> bool {
        self.medium.is_some()
    }

    /// Returns true if the container already holds any bytes.
    pub fn exists(&mut self) -> Result<bool> {
        Ok(self.len()? > 0)
    }

    /// Returns the current length of the container.
    pub fn len(&mut self) -> Result<u64> {
        match self.medium()? {
            Medium::File(file) => Ok(file.metadata()?.len()),
            Medium::Memory(buffer) => Ok(buffer.len as u64),
        }
    }

    /// Truncates the container to zero length and resets both cursors.
    pub fn truncate(&mut self) -> Result<()> {
        match self.medium()? {
            Medium::File(file) => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
            }
            Medium::Memory(buffer) => {
                buffer.data.clear();
                buffer.len = 0;
            }
        }
        self.read_pos = 0;
        self.write_pos = 0;
        self.physical_pos = 0;
        self.last_op = LastOp::Seek;
        Ok(())
    }

    /// Returns the read cursor position.
    pub fn read_position(&self) -> u64 {
        self.read_pos
    }

    /// Sets the read cursor position.
    pub fn set_read_position(&mut self, pos: u64) {
        if self.last_op == LastOp::Read && pos == self.read_pos {
            return;
        }
        self.read_pos = pos;
        self.last_op = LastOp::Seek;
    }

    /// Returns the write cursor position.
    pub fn write_position(&self) -> u64 {
        self.write_pos
    }

    /// Sets the write cursor position.
    pub fn set_write_position(&mut self, pos: u64) {
        if self.last_op == LastOp::Write && pos == self.write_pos {
            return;
        }
        self.write_pos = pos;
        self.last_op = LastOp::Seek;
    }

    /// Repositions the physical cursor for a read, if needed.
    fn prepare_read(&mut self) -> Result<()> {
        let pos = self.read_pos;
        if self.last_op != LastOp::Read || self.physical_pos != pos {
            if let Medium::File(file) = self.medium()? {
                file.seek(SeekFrom::Start(pos))?;
            }
            self.physical_pos = pos;
        }
        self.last_op = LastOp::Read;
        Ok(())
    }

    /// Repositions the physical cursor for a write, if needed.
    fn prepare_write(&mut self) -> Result<()> {
        let pos = self.write_pos;
        if self.last_op != LastOp::Write || self.physical_pos != pos {
            if let Medium::File(file) = self.medium()? {
                file.seek(SeekFrom::Start(pos))?;
            }
            self.physical_pos = pos;
        }
        self.last_op = LastOp::Write;
        Ok(())
    }

    /// Reads exactly `dest.len()` bytes at the read cursor.
    pub fn read_buf(&mut self, dest: &mut [u8]) -> Result<()> {
        self.prepare_read()?;
        let pos = self.read_pos;
        match self.medium()? {
            Medium::File(file) => {
                file.read_exact(dest)?;
            }
            Medium::Memory(buffer) => {
                let end = pos as usize + dest.len();
                if end > buffer.len {
                    return Err(CacheError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "read past end of memory container",
                    )));
                }
                dest.copy_from_slice(&buffer.data[pos as usize..end]);
            }
        }
        self.read_pos += dest.len() as u64;
        self.physical_pos = self.read_pos;
        Ok(())
    }

    /// Writes all of `src` at the write cursor, extending the container if
    /// needed.
    pub fn write_buf(&mut self, src: &[u8]) -> Result<()> {
        self.prepare_write()?;
        let pos = self.write_pos;
        match self.medium()? {
            Medium::File(file) => {
                file.write_all(src)?;
            }
            Medium::Memory(buffer) => {
                let end = pos as usize + src.len();
                buffer.ensure_len(end)?;
                buffer.data[pos as usize..end].copy_from_slice(src);
                if end > buffer.len {
                    buffer.len = end;
                }
            }
        }
        self.write_pos += src.len() as u64;
        self.physical_pos = self.write_pos;
        Ok(())
    }

    /// Reads an 8-bit integer.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_buf(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a 16-bit little-endian integer.
    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_buf(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a 32-bit little-endian integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_buf(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a 64-bit little-endian integer.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_buf(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes an 8-bit integer.
    pub fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write_buf(&[val])
    }

    /// Writes a 16-bit little-endian integer.
    pub fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write_buf(&val.to_le_bytes())
    }

    /// Writes a 32-bit little-endian integer.
    pub fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_buf(&val.to_le_bytes())
    }

    /// Writes a 64-bit little-endian integer.
    pub fn write_u64(&mut self, val: u64) -> Result<()> {
        self.write_buf(&val.to_le_bytes())
    }

    /// Flushes pending bytes to the medium.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(Medium::File(file)) = self.medium.as_mut() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Flushes and closes the container. Further operations fail.
    pub fn close(&mut self) -> Result<()> {
        if let Some(Medium::File(file)) = self.medium.take() {
            file.sync_all()?;
        }
        self.medium = None;
        self.last_op = LastOp::None;
        Ok(())
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp_file() -> (BackingStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = BackingStore::open_file(&dir.path().join("container.dat")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_file_backing_roundtrip() {
        let (mut store, _dir) = open_temp_file();

        store.set_write_position(0);
        store.write_u8(0xAB).unwrap();
        store.write_u16(0x1234).unwrap();
        store.write_u32(0xDEAD_BEEF).unwrap();
        store.write_u64(0x0102_0304_0506_0708).unwrap();

        store.set_read_position(0);
        assert_eq!(store.read_u8().unwrap(), 0xAB);
        assert_eq!(store.read_u16().unwrap(), 0x1234);
        assert_eq!(store.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(store.read_u64().unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_memory_backing_roundtrip() {
        let mut store = BackingStore::open_memory(1024).unwrap();

        store.set_write_position(0);
        store.write_buf(b"hello world").unwrap();

        let mut buf = [0u8; 11];
        store.set_read_position(0);
        store.read_buf(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_independent_cursors() {
        let mut store = BackingStore::open_memory(1024).unwrap();

        store.set_write_position(0);
        store.write_buf(b"aaaabbbb").unwrap();

        // Read from the front while the write cursor sits at the end.
        store.set_read_position(0);
        let mut buf = [0u8; 4];
        store.read_buf(&mut buf).unwrap();
        assert_eq!(&buf, b"aaaa");

        // Writing resumes at the previous write position.
        assert_eq!(store.write_position(), 8);
        store.write_buf(b"cccc").unwrap();

        store.set_read_position(8);
        store.read_buf(&mut buf).unwrap();
        assert_eq!(&buf, b"cccc");
    }

    #[test]
    fn test_sequential_reads_advance() {
        let mut store = BackingStore::open_memory(64).unwrap();
        store.set_write_position(0);
        store.write_buf(&[1, 2, 3, 4]).unwrap();

        store.set_read_position(0);
        assert_eq!(store.read_u8().unwrap(), 1);
        assert_eq!(store.read_u8().unwrap(), 2);
        assert_eq!(store.read_position(), 2);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut store = BackingStore::open_memory(64).unwrap();
        store.set_write_position(0);
        store.write_buf(&[1, 2]).unwrap();

        store.set_read_position(0);
        let mut buf = [0u8; 4];
        assert!(store.read_buf(&mut buf).is_err());
    }

    #[test]
    fn test_truncate_resets() {
        let mut store = BackingStore::open_memory(64).unwrap();
        store.set_write_position(0);
        store.write_buf(b"content").unwrap();
        assert_eq!(store.len().unwrap(), 7);

        store.truncate().unwrap();
        assert_eq!(store.len().unwrap(), 0);
        assert_eq!(store.read_position(), 0);
        assert_eq!(store.write_position(), 0);
    }

    #[test]
    fn test_exists() {
        let (mut store, _dir) = open_temp_file();
        assert!(!store.exists().unwrap());

        store.set_write_position(0);
        store.write_u8(1).unwrap();
        assert!(store.exists().unwrap());
    }

    #[test]
    fn test_close_rejects_further_operations() {
        let mut store = BackingStore::open_memory(64).unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(store.len().is_err());
        assert!(store.write_u8(0).is_err());
    }

    #[test]
    fn test_file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.dat");

        {
            let mut store = BackingStore::open_file(&path).unwrap();
            store.set_write_position(0);
            store.write_u32(0xCAFE_F00D).unwrap();
            store.close().unwrap();
        }

        {
            let mut store = BackingStore::open_file(&path).unwrap();
            assert_eq!(store.len().unwrap(), 4);
            store.set_read_position(0);
            assert_eq!(store.read_u32().unwrap(), 0xCAFE_F00D);
        }
    }

    #[test]
    fn test_write_extends_sparse_region() {
        let mut store = BackingStore::open_memory(64).unwrap();
        store.set_write_position(10);
        store.write_buf(b"xy").unwrap();
        assert_eq!(store.len().unwrap(), 12);

        store.set_read_position(0);
        let mut buf = [0u8; 10];
        store.read_buf(&mut buf).unwrap();
        assert_eq!(buf, [0u8; 10]);
    }
}
