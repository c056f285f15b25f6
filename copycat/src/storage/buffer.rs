//! Byte buffers backing log segments and entry serialization.
//!
//! A [`Buffer`] is a fixed-capacity contiguous byte region with independent read & write
//! cursors, backed either by pooled heap memory or by a memory-mapped segment file. All
//! multi-byte integers are big-endian so the on-disk layout is identical across platforms.

use std::fs::File;
use std::sync::Arc;

use bytes::BytesMut;
use memmap2::MmapMut;
use parking_lot::Mutex;

use super::StorageError;
use super::StorageResult;

/// A thread-safe free-list of heap buffers of a fixed capacity class.
///
/// `acquire` pops a buffer from the free-list or allocates a fresh one; dropping a pooled
/// [`Buffer`] returns its memory here. The free-list is bounded, so bursts simply allocate.
pub struct BufferPool {
    capacity: usize,
    max_pooled: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Create a new pool handing out buffers of `capacity` bytes, retaining at most
    /// `max_pooled` free buffers.
    pub fn new(capacity: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            max_pooled,
            free: Mutex::new(Vec::new()),
        })
    }

    /// The capacity class of buffers handed out by this pool.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// The number of buffers currently sitting in the free-list.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Acquire a zeroed heap buffer, reusing pooled memory when available.
    pub fn acquire(self: &Arc<Self>) -> Buffer {
        let bytes = {
            let mut free = self.free.lock();
            free.pop()
        };
        let mut bytes = bytes.unwrap_or_else(|| BytesMut::with_capacity(self.capacity));
        bytes.clear();
        bytes.resize(self.capacity, 0);
        Buffer {
            backing: Backing::Heap {
                bytes: Some(bytes),
                pool: Some(self.clone()),
            },
            read_pos: 0,
            write_pos: 0,
        }
    }

    fn release(&self, bytes: BytesMut) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(bytes);
        }
    }
}

enum Backing {
    Heap {
        bytes: Option<BytesMut>,
        pool: Option<Arc<BufferPool>>,
    },
    Mapped(MmapMut),
}

/// A fixed-capacity byte region with independent read & write cursors.
pub struct Buffer {
    backing: Backing,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Create an unpooled, zeroed heap buffer of the given capacity.
    pub fn heap(capacity: usize) -> Self {
        let mut bytes = BytesMut::with_capacity(capacity);
        bytes.resize(capacity, 0);
        Self {
            backing: Backing::Heap { bytes: Some(bytes), pool: None },
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Map the given file as a writable buffer of `len` bytes.
    ///
    /// The file is grown to `len` if shorter; mapping a file that another process truncates
    /// underneath us is undefined behavior, so segment files are owned exclusively by the log.
    pub fn map_file(file: &File, len: u64) -> StorageResult<Self> {
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        let mmap = unsafe { MmapMut::map_mut(file)? };
        Ok(Self {
            backing: Backing::Mapped(mmap),
            read_pos: 0,
            write_pos: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Heap { bytes, .. } => bytes.as_ref().map(|b| b.len()).unwrap_or(0),
            Backing::Mapped(mmap) => mmap.len(),
        }
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    pub fn set_read_pos(&mut self, pos: usize) {
        self.read_pos = pos;
    }

    pub fn set_write_pos(&mut self, pos: usize) {
        self.write_pos = pos;
    }

    fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Heap { bytes, .. } => bytes.as_ref().map(|b| &b[..]).unwrap_or(&[]),
            Backing::Mapped(mmap) => &mmap[..],
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Heap { bytes, .. } => bytes.as_mut().map(|b| &mut b[..]).unwrap_or(&mut []),
            Backing::Mapped(mmap) => &mut mmap[..],
        }
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> StorageResult<&[u8]> {
        let end = offset.checked_add(len).ok_or_else(|| StorageError::Corrupt("slice overflow".into()))?;
        if end > self.capacity() {
            return Err(StorageError::Corrupt(format!(
                "slice of {} bytes at {} exceeds buffer capacity {}",
                len,
                offset,
                self.capacity()
            )));
        }
        Ok(&self.as_slice()[offset..end])
    }

    /// Borrow `len` bytes starting at `offset`, mutably.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> StorageResult<&mut [u8]> {
        let end = offset.checked_add(len).ok_or_else(|| StorageError::Corrupt("slice overflow".into()))?;
        if end > self.capacity() {
            return Err(StorageError::Corrupt(format!(
                "slice of {} bytes at {} exceeds buffer capacity {}",
                len,
                offset,
                self.capacity()
            )));
        }
        Ok(&mut self.as_mut_slice()[offset..end])
    }

    /// Copy `src` into the buffer at `offset`.
    pub fn put_slice_at(&mut self, offset: usize, src: &[u8]) -> StorageResult<()> {
        let end = offset.checked_add(src.len()).ok_or_else(|| StorageError::Corrupt("write overflow".into()))?;
        if end > self.capacity() {
            return Err(StorageError::Corrupt(format!(
                "write of {} bytes at {} exceeds buffer capacity {}",
                src.len(),
                offset,
                self.capacity()
            )));
        }
        self.as_mut_slice()[offset..end].copy_from_slice(src);
        Ok(())
    }

    pub fn u8_at(&self, offset: usize) -> StorageResult<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn u32_at(&self, offset: usize) -> StorageResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.slice(offset, 4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub fn u64_at(&self, offset: usize) -> StorageResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.slice(offset, 8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn i64_at(&self, offset: usize) -> StorageResult<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.slice(offset, 8)?);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn put_u8_at(&mut self, offset: usize, val: u8) -> StorageResult<()> {
        self.put_slice_at(offset, &[val])
    }

    pub fn put_u32_at(&mut self, offset: usize, val: u32) -> StorageResult<()> {
        self.put_slice_at(offset, &val.to_be_bytes())
    }

    pub fn put_u64_at(&mut self, offset: usize, val: u64) -> StorageResult<()> {
        self.put_slice_at(offset, &val.to_be_bytes())
    }

    pub fn put_i64_at(&mut self, offset: usize, val: i64) -> StorageResult<()> {
        self.put_slice_at(offset, &val.to_be_bytes())
    }

    /// Write bytes at the write cursor, advancing it.
    pub fn write_bytes(&mut self, src: &[u8]) -> StorageResult<()> {
        self.put_slice_at(self.write_pos, src)?;
        self.write_pos += src.len();
        Ok(())
    }

    pub fn write_u8(&mut self, val: u8) -> StorageResult<()> {
        self.write_bytes(&[val])
    }

    pub fn write_u32(&mut self, val: u32) -> StorageResult<()> {
        self.write_bytes(&val.to_be_bytes())
    }

    pub fn write_u64(&mut self, val: u64) -> StorageResult<()> {
        self.write_bytes(&val.to_be_bytes())
    }

    pub fn write_i64(&mut self, val: i64) -> StorageResult<()> {
        self.write_bytes(&val.to_be_bytes())
    }

    /// Read bytes at the read cursor, advancing it.
    pub fn read_bytes(&mut self, len: usize) -> StorageResult<&[u8]> {
        let pos = self.read_pos;
        let end = pos.checked_add(len).ok_or_else(|| StorageError::Corrupt("read overflow".into()))?;
        if end > self.capacity() {
            return Err(StorageError::Corrupt(format!(
                "read of {} bytes at {} exceeds buffer capacity {}",
                len,
                pos,
                self.capacity()
            )));
        }
        self.read_pos = end;
        Ok(&self.as_slice()[pos..end])
    }

    pub fn read_u8(&mut self) -> StorageResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> StorageResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub fn read_u64(&mut self) -> StorageResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_i64(&mut self) -> StorageResult<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    /// Flush a byte range to durable storage.
    ///
    /// A no-op for heap buffers.
    pub fn flush(&self, offset: usize, len: usize) -> StorageResult<()> {
        match &self.backing {
            Backing::Heap { .. } => Ok(()),
            Backing::Mapped(mmap) => {
                mmap.flush_range(offset, len)?;
                Ok(())
            }
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Backing::Heap { bytes, pool } = &mut self.backing {
            if let (Some(bytes), Some(pool)) = (bytes.take(), pool.take()) {
                pool.release(bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let mut buf = Buffer::heap(64);
        buf.write_u32(7).unwrap();
        buf.write_u8(3).unwrap();
        buf.write_u64(u64::MAX).unwrap();
        buf.write_i64(-12345).unwrap();
        assert_eq!(buf.write_pos(), 4 + 1 + 8 + 8);

        assert_eq!(buf.read_u32().unwrap(), 7);
        assert_eq!(buf.read_u8().unwrap(), 3);
        assert_eq!(buf.read_u64().unwrap(), u64::MAX);
        assert_eq!(buf.read_i64().unwrap(), -12345);
        assert_eq!(buf.read_pos(), buf.write_pos());
    }

    #[test]
    fn test_absolute_access_is_bounds_checked() {
        let mut buf = Buffer::heap(8);
        assert!(buf.put_u64_at(0, 42).is_ok());
        assert_eq!(buf.u64_at(0).unwrap(), 42);
        assert!(buf.put_u32_at(6, 1).is_err());
        assert!(buf.u32_at(6).is_err());
    }

    #[test]
    fn test_pool_returns_buffers_on_drop() {
        let pool = BufferPool::new(32, 2);
        assert_eq!(pool.free_count(), 0);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            let _c = pool.acquire();
        }
        // max_pooled bounds the free-list.
        assert_eq!(pool.free_count(), 2);

        let reused = pool.acquire();
        assert_eq!(reused.capacity(), 32);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_mapped_buffer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.bin");
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();

        let mut buf = Buffer::map_file(&file, 128).unwrap();
        buf.put_u64_at(16, 99).unwrap();
        buf.flush(16, 8).unwrap();
        drop(buf);

        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let buf = Buffer::map_file(&file, 128).unwrap();
        assert_eq!(buf.u64_at(16).unwrap(), 99);
    }
}
