//! The fixed-size segment descriptor header.

use super::buffer::Buffer;
use super::StorageError;
use super::StorageResult;

/// The magic bytes identifying a segment file.
pub const MAGIC: [u8; 4] = *b"CCLG";
/// The layout version of the descriptor and entry framing.
pub const LAYOUT_VERSION: u16 = 1;

/// A bit-exact, 64-byte segment file header.
///
/// Layout: magic (4) | layout version (2) | reserved (2) | id (8) | version (8) |
/// first_index (8) | updated (8) | max_entry_size (4) | max_segment_size (4) |
/// max_entries (4) | locked (1) | zero padding to 64.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// The monotonically increasing segment id.
    pub id: u64,
    /// The version of this segment, incremented each time compaction rewrites it.
    pub version: u64,
    /// The index of the first entry in the segment. Immutable after creation.
    pub first_index: u64,
    /// The ms-epoch timestamp at which the descriptor was last updated (sealed).
    pub updated: i64,
    /// The maximum size of a single serialized entry.
    pub max_entry_size: u32,
    /// The maximum size of the segment's data region.
    pub max_segment_size: u32,
    /// The maximum number of entries in the segment.
    pub max_entries: u32,
    /// Whether the descriptor has been durably written; unlocked segments are discarded on
    /// recovery.
    pub locked: bool,
}

impl Descriptor {
    /// The encoded size of a descriptor.
    pub const LEN: usize = 64;

    const OFFSET_ID: usize = 8;
    const OFFSET_VERSION: usize = 16;
    const OFFSET_FIRST_INDEX: usize = 24;
    const OFFSET_UPDATED: usize = 32;
    const OFFSET_MAX_ENTRY_SIZE: usize = 40;
    const OFFSET_MAX_SEGMENT_SIZE: usize = 44;
    const OFFSET_MAX_ENTRIES: usize = 48;
    const OFFSET_LOCKED: usize = 52;

    /// Write the descriptor at the head of the given buffer.
    pub fn write(&self, buf: &mut Buffer) -> StorageResult<()> {
        buf.put_slice_at(0, &MAGIC)?;
        buf.put_slice_at(4, &LAYOUT_VERSION.to_be_bytes())?;
        buf.put_slice_at(6, &[0, 0])?;
        buf.put_u64_at(Self::OFFSET_ID, self.id)?;
        buf.put_u64_at(Self::OFFSET_VERSION, self.version)?;
        buf.put_u64_at(Self::OFFSET_FIRST_INDEX, self.first_index)?;
        buf.put_i64_at(Self::OFFSET_UPDATED, self.updated)?;
        buf.put_u32_at(Self::OFFSET_MAX_ENTRY_SIZE, self.max_entry_size)?;
        buf.put_u32_at(Self::OFFSET_MAX_SEGMENT_SIZE, self.max_segment_size)?;
        buf.put_u32_at(Self::OFFSET_MAX_ENTRIES, self.max_entries)?;
        buf.put_u8_at(Self::OFFSET_LOCKED, self.locked as u8)?;
        buf.put_slice_at(Self::OFFSET_LOCKED + 1, &[0u8; Self::LEN - Self::OFFSET_LOCKED - 1])?;
        Ok(())
    }

    /// Read a descriptor from the head of the given buffer.
    pub fn read(buf: &Buffer) -> StorageResult<Self> {
        let magic = buf.slice(0, 4)?;
        if magic != MAGIC {
            return Err(StorageError::Corrupt("segment header does not start with magic".into()));
        }
        let mut raw = [0u8; 2];
        raw.copy_from_slice(buf.slice(4, 2)?);
        let layout = u16::from_be_bytes(raw);
        if layout != LAYOUT_VERSION {
            return Err(StorageError::Corrupt(format!("unsupported segment layout version {}", layout)));
        }
        Ok(Self {
            id: buf.u64_at(Self::OFFSET_ID)?,
            version: buf.u64_at(Self::OFFSET_VERSION)?,
            first_index: buf.u64_at(Self::OFFSET_FIRST_INDEX)?,
            updated: buf.i64_at(Self::OFFSET_UPDATED)?,
            max_entry_size: buf.u32_at(Self::OFFSET_MAX_ENTRY_SIZE)?,
            max_segment_size: buf.u32_at(Self::OFFSET_MAX_SEGMENT_SIZE)?,
            max_entries: buf.u32_at(Self::OFFSET_MAX_ENTRIES)?,
            locked: buf.u8_at(Self::OFFSET_LOCKED)? != 0,
        })
    }
}

/// The ms-epoch wall clock, used only to stamp descriptors; protocol time never reads it.
pub(crate) fn ms_since_epoch() -> i64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_round_trip_is_bit_exact() {
        let desc = Descriptor {
            id: 3,
            version: 2,
            first_index: 1001,
            updated: 1_600_000_000_000,
            max_entry_size: 1024 * 1024,
            max_segment_size: 1024 * 1024 * 32,
            max_entries: 4096,
            locked: true,
        };

        let mut buf = Buffer::heap(Descriptor::LEN);
        desc.write(&mut buf).unwrap();
        assert_eq!(Descriptor::read(&buf).unwrap(), desc);

        // Padding bytes beyond `locked` are zero.
        for offset in 53..Descriptor::LEN {
            assert_eq!(buf.u8_at(offset).unwrap(), 0);
        }
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut buf = Buffer::heap(Descriptor::LEN);
        buf.put_slice_at(0, b"XXXX").unwrap();
        assert!(matches!(Descriptor::read(&buf), Err(StorageError::Corrupt(_))));
    }
}
