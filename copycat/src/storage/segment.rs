//! A single append-only log segment file.

use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use super::buffer::Buffer;
use super::buffer::BufferPool;
use super::codec;
use super::descriptor::ms_since_epoch;
use super::descriptor::Descriptor;
use super::index::OffsetIndex;
use super::StorageError;
use super::StorageResult;
use crate::raft::Entry;
use crate::AppData;

/// A contiguous range of log entries backed by a single memory-mapped file.
///
/// The file is laid out as a fixed-size [`Descriptor`] followed by a data region of framed
/// entries. The file is pre-sized to `Descriptor::LEN + max_segment_size` at creation; the valid
/// prefix of the data region is delimited by entry framing, with a zero length word terminating
/// it.
pub struct Segment {
    descriptor: Descriptor,
    path: PathBuf,
    buffer: Buffer,
    index: OffsetIndex,
    /// The byte position at which the next entry frame will be written.
    position: u32,
    /// Pooled scratch buffers for entry encoding, shared across the log's segments.
    pool: Arc<BufferPool>,
}

impl Segment {
    /// The file name of a segment: `<log-name>-<segmentId>-<version>.log`.
    pub fn file_name(name: &str, id: u64, version: u64) -> String {
        format!("{}-{}-{}.log", name, id, version)
    }

    /// Parse `(id, version)` out of a segment file name, returning `None` for foreign files.
    pub fn parse_file_name(name: &str, file_name: &str) -> Option<(u64, u64)> {
        let rest = file_name.strip_prefix(name)?.strip_prefix('-')?.strip_suffix(".log")?;
        let mut parts = rest.splitn(2, '-');
        let id = parts.next()?.parse().ok()?;
        let version = parts.next()?.parse().ok()?;
        Some((id, version))
    }

    /// Create a new, empty segment file.
    ///
    /// The descriptor is written and flushed before the locked bit is set; an unlocked
    /// descriptor found during recovery marks a segment whose creation was torn, and it is
    /// discarded.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        dir: &Path,
        name: &str,
        id: u64,
        version: u64,
        first_index: u64,
        max_entry_size: u32,
        max_segment_size: u32,
        max_entries: u32,
        pool: Arc<BufferPool>,
    ) -> StorageResult<Self> {
        let path = dir.join(Self::file_name(name, id, version));
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        let capacity = Descriptor::LEN as u64 + max_segment_size as u64;
        let mut buffer = Buffer::map_file(&file, capacity)?;

        let mut descriptor = Descriptor {
            id,
            version,
            first_index,
            updated: 0,
            max_entry_size,
            max_segment_size,
            max_entries,
            locked: false,
        };
        descriptor.write(&mut buffer)?;
        buffer.flush(0, Descriptor::LEN)?;

        descriptor.locked = true;
        descriptor.write(&mut buffer)?;
        buffer.flush(0, Descriptor::LEN)?;

        Ok(Self {
            descriptor,
            path,
            buffer,
            index: OffsetIndex::new(),
            position: Descriptor::LEN as u32,
            pool,
        })
    }

    /// Open an existing segment file, scanning its valid prefix to rebuild the offset index.
    ///
    /// The scan stops at the first zero length word, short frame, or CRC mismatch; everything
    /// beyond it is discarded.
    pub fn open<D: AppData>(path: &Path, pool: Arc<BufferPool>) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if (len as usize) < Descriptor::LEN {
            return Err(StorageError::Corrupt(format!("segment file {} is shorter than a descriptor", path.display())));
        }
        let buffer = Buffer::map_file(&file, len)?;
        let descriptor = Descriptor::read(&buffer)?;

        let mut segment = Self {
            descriptor,
            path: path.to_path_buf(),
            buffer,
            index: OffsetIndex::new(),
            position: Descriptor::LEN as u32,
            pool,
        };
        if segment.descriptor.locked {
            segment.scan::<D>()?;
        }
        Ok(segment)
    }

    fn scan<D: AppData>(&mut self) -> StorageResult<()> {
        let capacity = self.buffer.capacity();
        let mut pos = Descriptor::LEN;
        loop {
            if pos + codec::FRAME_OVERHEAD > capacity {
                break;
            }
            let len = self.buffer.u32_at(pos)? as usize;
            if len == 0 || len > self.descriptor.max_entry_size as usize {
                break;
            }
            let (entry, frame_len) = match codec::decode_entry::<D>(&self.buffer, pos) {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::warn!(segment=%self.path.display(), position=pos, error=%err, "torn frame terminates segment scan");
                    break;
                }
            };
            if entry.log_id.index < self.descriptor.first_index {
                break;
            }
            let offset = entry.log_id.index - self.descriptor.first_index;
            if (offset as usize) < self.index.len() {
                // Entries must be strictly increasing within a segment.
                break;
            }
            self.index.put(offset, pos as u32);
            pos += frame_len;
        }
        self.position = pos as u32;
        Ok(())
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn version(&self) -> u64 {
        self.descriptor.version
    }

    pub fn is_locked(&self) -> bool {
        self.descriptor.locked
    }

    pub fn first_index(&self) -> u64 {
        self.descriptor.first_index
    }

    /// The logical number of entries covered by this segment, compaction holes included.
    pub fn len(&self) -> u64 {
        self.index.len() as u64
    }

    /// The number of entries physically present, compaction holes excluded.
    pub fn present(&self) -> u64 {
        self.index.present() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The index of the last entry covered by this segment, or `None` when empty.
    pub fn last_index(&self) -> Option<u64> {
        if self.index.is_empty() {
            None
        } else {
            Some(self.descriptor.first_index + self.index.len() as u64 - 1)
        }
    }

    /// Bytes of entry data written to the segment.
    pub fn size(&self) -> u32 {
        self.position - Descriptor::LEN as u32
    }

    /// Whether an additional frame of `frame_len` bytes would overflow the segment.
    pub fn is_full(&self, frame_len: usize) -> bool {
        self.index.len() as u32 >= self.descriptor.max_entries
            || self.size() as u64 + frame_len as u64 > self.descriptor.max_segment_size as u64
    }

    /// Append the given entry, returning `false` without writing if the segment is full.
    ///
    /// The entry's index must be the immediate successor of the segment's last index.
    pub fn append<D: AppData>(&mut self, entry: &Entry<D>) -> StorageResult<bool> {
        let frame_len = codec::encoded_len(entry)?;
        if frame_len - codec::FRAME_OVERHEAD > self.descriptor.max_entry_size as usize {
            return Err(StorageError::EntryTooLarge {
                size: frame_len - codec::FRAME_OVERHEAD,
                max: self.descriptor.max_entry_size,
            });
        }
        if self.is_full(frame_len) {
            return Ok(false);
        }

        let offset = entry
            .log_id
            .index
            .checked_sub(self.descriptor.first_index)
            .ok_or(StorageError::OutOfBounds { index: entry.log_id.index })?;
        if offset != self.index.len() as u64 {
            return Err(StorageError::OutOfBounds { index: entry.log_id.index });
        }

        // Frame the entry in pooled scratch, then copy it into the mapped file in one shot.
        let mut scratch = self.pool.acquire();
        let written = codec::encode_entry_into(entry, &mut scratch)?;

        let pos = self.position;
        self.buffer.put_slice_at(pos as usize, scratch.slice(0, written)?)?;
        self.index.put(offset, pos);
        self.position = pos + written as u32;
        Ok(true)
    }

    /// Record an entry frame copied verbatim during compaction, at an arbitrary offset at or
    /// beyond the current tail.
    pub(super) fn append_compacted(&mut self, offset: u64, frame: &[u8]) -> StorageResult<()> {
        let pos = self.position;
        self.buffer.put_slice_at(pos as usize, frame)?;
        self.index.put(offset, pos);
        self.position = pos + frame.len() as u32;
        Ok(())
    }

    /// Read the entry at the given log index.
    ///
    /// Returns `None` for indexes outside the segment's range and for compaction holes.
    pub fn get<D: AppData>(&self, index: u64) -> StorageResult<Option<Entry<D>>> {
        let offset = match index.checked_sub(self.descriptor.first_index) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let pos = match self.index.position(offset) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let (entry, _) = codec::decode_entry::<D>(&self.buffer, pos as usize)?;
        if entry.log_id.index != index {
            return Err(StorageError::Corrupt(format!(
                "entry at position {} has index {}, expected {}",
                pos, entry.log_id.index, index
            )));
        }
        Ok(Some(entry))
    }

    /// The raw frame of the entry at the given log index, if present.
    pub(super) fn frame_at(&self, index: u64) -> StorageResult<Option<&[u8]>> {
        let offset = match index.checked_sub(self.descriptor.first_index) {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let pos = match self.index.position(offset) {
            Some(pos) => pos as usize,
            None => return Ok(None),
        };
        let len = self.buffer.u32_at(pos)? as usize;
        Ok(Some(self.buffer.slice(pos, codec::FRAME_OVERHEAD + len)?))
    }

    /// Drop all entries with an index strictly greater than `index`.
    ///
    /// The frame at the cut point has its length word zeroed so recovery stops there.
    pub fn truncate(&mut self, index: u64) -> StorageResult<()> {
        let keep = index.saturating_sub(self.descriptor.first_index.saturating_sub(1));
        if keep >= self.index.len() as u64 {
            return Ok(());
        }
        let cut = self.index.first_present_at_or_after(keep);
        self.index.truncate(keep);
        if let Some(pos) = cut {
            self.buffer.put_u32_at(pos as usize, 0)?;
            self.buffer.flush(pos as usize, 4)?;
            self.position = pos;
        }
        Ok(())
    }

    /// Seal the segment: stamp the descriptor and flush everything written so far.
    pub fn seal(&mut self) -> StorageResult<()> {
        self.descriptor.updated = ms_since_epoch();
        self.descriptor.write(&mut self.buffer)?;
        self.buffer.flush(0, self.position as usize)?;
        Ok(())
    }

    /// Flush the data region to durable storage.
    pub fn flush(&self) -> StorageResult<()> {
        self.buffer.flush(0, self.position as usize)
    }

    /// Delete the segment's backing file.
    pub fn delete(self) -> StorageResult<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryPayload;
    use crate::raft::KeepAliveEntry;
    use crate::LogId;

    fn entry(index: u64, session: u64) -> Entry<u64> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::KeepAlive(KeepAliveEntry {
                session,
                timestamp: index as i64,
            }),
        }
    }

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(1024 + codec::FRAME_OVERHEAD, 4)
    }

    fn create(dir: &Path, first_index: u64) -> Segment {
        Segment::create(dir, "test", 1, 1, first_index, 1024, 64 * 1024, 1024, pool()).unwrap()
    }

    #[test]
    fn test_append_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = create(dir.path(), 1);

        for i in 1..=10 {
            assert!(seg.append(&entry(i, i * 7)).unwrap());
        }
        assert_eq!(seg.len(), 10);
        assert_eq!(seg.last_index(), Some(10));

        for i in 1..=10 {
            let got = seg.get::<u64>(i).unwrap().unwrap();
            assert_eq!(got, entry(i, i * 7));
        }
        assert!(seg.get::<u64>(11).unwrap().is_none());
    }

    #[test]
    fn test_reopen_recovers_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut seg = create(dir.path(), 1);
            for i in 1..=5 {
                seg.append(&entry(i, i)).unwrap();
            }
            seg.seal().unwrap();
            seg.path().to_path_buf()
        };

        let seg = Segment::open::<u64>(&path, pool()).unwrap();
        assert_eq!(seg.len(), 5);
        assert_eq!(seg.get::<u64>(3).unwrap().unwrap(), entry(3, 3));
    }

    #[test]
    fn test_torn_write_terminates_valid_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut seg = create(dir.path(), 1);
            for i in 1..=5 {
                seg.append(&entry(i, i)).unwrap();
            }
            seg.seal().unwrap();
            seg.path().to_path_buf()
        };

        // Corrupt a byte inside the 4th entry's frame.
        {
            let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let seg = Segment::open::<u64>(&path, pool()).unwrap();
            let pos = seg.index.position(3).unwrap() as usize;
            drop(seg);
            let mut buffer = Buffer::map_file(&file, 0).unwrap();
            let byte = buffer.u8_at(pos + 6).unwrap();
            buffer.put_u8_at(pos + 6, byte ^ 0xff).unwrap();
            buffer.flush(pos + 6, 1).unwrap();
        }

        let seg = Segment::open::<u64>(&path, pool()).unwrap();
        assert_eq!(seg.len(), 3);
        assert_eq!(seg.last_index(), Some(3));
        assert_eq!(seg.get::<u64>(3).unwrap().unwrap(), entry(3, 3));
    }

    #[test]
    fn test_truncate_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut seg = create(dir.path(), 1);
            for i in 1..=8 {
                seg.append(&entry(i, i)).unwrap();
            }
            seg.truncate(5).unwrap();
            assert_eq!(seg.last_index(), Some(5));

            // Appending after a truncation reuses the reclaimed space.
            seg.append(&entry(6, 60)).unwrap();
            seg.seal().unwrap();
            seg.path().to_path_buf()
        };

        let seg = Segment::open::<u64>(&path, pool()).unwrap();
        assert_eq!(seg.last_index(), Some(6));
        assert_eq!(seg.get::<u64>(6).unwrap().unwrap(), entry(6, 60));
    }

    #[test]
    fn test_full_by_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), "test", 1, 1, 1, 1024, 64 * 1024, 3, pool()).unwrap();
        assert!(seg.append(&entry(1, 1)).unwrap());
        assert!(seg.append(&entry(2, 2)).unwrap());
        assert!(seg.append(&entry(3, 3)).unwrap());
        assert!(!seg.append(&entry(4, 4)).unwrap());
        assert_eq!(seg.len(), 3);
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), "test", 1, 1, 1, 16, 64 * 1024, 128, pool()).unwrap();
        let res = seg.append(&entry(1, 1));
        assert!(matches!(res, Err(StorageError::EntryTooLarge { .. })));
    }

    #[test]
    fn test_file_name_round_trip() {
        let name = Segment::file_name("cluster0", 7, 2);
        assert_eq!(name, "cluster0-7-2.log");
        assert_eq!(Segment::parse_file_name("cluster0", &name), Some((7, 2)));
        assert_eq!(Segment::parse_file_name("cluster0", "other-1-1.log"), None);
        assert_eq!(Segment::parse_file_name("cluster0", "cluster0-x-1.log"), None);
    }
}
