//! The deterministic binary entry codec.
//!
//! Entries are framed on disk as `length: u32 | type: u8 | body | crc32(type + body)`, with the
//! body produced by bincode over the entry's serde model. Type tags are stable numeric ids so
//! readers can reject frames of unknown provenance before deserializing.

use crc32fast::Hasher;

use super::buffer::Buffer;
use super::StorageError;
use super::StorageResult;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;

/// Stable numeric entry type ids.
pub const TYPE_NO_OP: u8 = 1;
pub const TYPE_CONFIGURATION: u8 = 2;
pub const TYPE_REGISTER: u8 = 3;
pub const TYPE_KEEP_ALIVE: u8 = 4;
pub const TYPE_COMMAND: u8 = 5;
pub const TYPE_QUERY: u8 = 6;
pub const TYPE_JOIN: u8 = 7;
pub const TYPE_LEAVE: u8 = 8;
pub const TYPE_PROMOTE: u8 = 9;
pub const TYPE_DEMOTE: u8 = 10;

/// Bytes of framing surrounding an entry body: length (4) + type (1) + crc (4).
pub const FRAME_OVERHEAD: usize = 9;

/// The stable numeric type id of an entry.
pub fn entry_type<D: AppData>(entry: &Entry<D>) -> u8 {
    match &entry.payload {
        EntryPayload::NoOp => TYPE_NO_OP,
        EntryPayload::Configuration(_) => TYPE_CONFIGURATION,
        EntryPayload::Register(_) => TYPE_REGISTER,
        EntryPayload::KeepAlive(_) => TYPE_KEEP_ALIVE,
        EntryPayload::Command(_) => TYPE_COMMAND,
        EntryPayload::Query(_) => TYPE_QUERY,
        EntryPayload::Join(_) => TYPE_JOIN,
        EntryPayload::Leave(_) => TYPE_LEAVE,
        EntryPayload::Promote(_) => TYPE_PROMOTE,
        EntryPayload::Demote(_) => TYPE_DEMOTE,
    }
}

/// The on-disk frame length of an entry.
pub fn encoded_len<D: AppData>(entry: &Entry<D>) -> StorageResult<usize> {
    Ok(FRAME_OVERHEAD + bincode::serialized_size(entry)? as usize)
}

/// Encode an entry's frame into the head of the given buffer, without allocating.
///
/// Returns the frame length. The buffer is typically pooled scratch owned by the segment's
/// write path.
pub fn encode_entry_into<D: AppData>(entry: &Entry<D>, buf: &mut Buffer) -> StorageResult<usize> {
    let body_len = bincode::serialized_size(entry)? as usize;
    let ty = entry_type(entry);

    buf.put_u32_at(0, body_len as u32)?;
    buf.put_u8_at(4, ty)?;
    {
        let mut region = buf.slice_mut(5, body_len)?;
        bincode::serialize_into(&mut region, entry)?;
    }

    let mut hasher = Hasher::new();
    hasher.update(buf.slice(4, 1 + body_len)?);
    let crc = hasher.finalize();
    buf.put_u32_at(5 + body_len, crc)?;

    Ok(FRAME_OVERHEAD + body_len)
}

/// Encode an entry into its on-disk frame.
pub fn encode_entry<D: AppData>(entry: &Entry<D>) -> StorageResult<Vec<u8>> {
    let body = bincode::serialize(entry)?;
    let ty = entry_type(entry);

    let mut hasher = Hasher::new();
    hasher.update(&[ty]);
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.push(ty);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

/// Decode the entry framed at `offset`, returning the entry and the total frame length.
///
/// A short frame, a CRC mismatch, or a type tag that disagrees with the decoded payload is
/// reported as `Corrupt`; during recovery this terminates the segment's valid prefix.
pub fn decode_entry<D: AppData>(buf: &Buffer, offset: usize) -> StorageResult<(Entry<D>, usize)> {
    let len = buf.u32_at(offset)? as usize;
    let ty = buf.u8_at(offset + 4)?;
    let body = buf.slice(offset + 5, len)?;
    let stored_crc = buf.u32_at(offset + 5 + len)?;

    let mut hasher = Hasher::new();
    hasher.update(&[ty]);
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(StorageError::Corrupt(format!("crc mismatch for frame at offset {}", offset)));
    }

    let entry: Entry<D> = bincode::deserialize(body)?;
    if entry_type(&entry) != ty {
        return Err(StorageError::Corrupt(format!(
            "type tag {} disagrees with payload at offset {}",
            ty, offset
        )));
    }
    Ok((entry, FRAME_OVERHEAD + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::KeepAliveEntry;
    use crate::LogId;

    fn entry(index: u64) -> Entry<u64> {
        Entry {
            log_id: LogId::new(3, index),
            payload: EntryPayload::KeepAlive(KeepAliveEntry {
                session: 7,
                timestamp: 1000,
            }),
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let e = entry(42);
        let frame = encode_entry(&e).unwrap();
        assert_eq!(frame.len(), encoded_len(&e).unwrap());

        let mut buf = Buffer::heap(frame.len() + 16);
        buf.put_slice_at(0, &frame).unwrap();

        let (decoded, consumed) = decode_entry::<u64>(&buf, 0).unwrap();
        assert_eq!(decoded, e);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_in_place_encode_matches_allocating_encode() {
        let e = entry(7);
        let frame = encode_entry(&e).unwrap();

        let mut buf = Buffer::heap(frame.len() + 32);
        let written = encode_entry_into(&e, &mut buf).unwrap();
        assert_eq!(written, frame.len());
        assert_eq!(buf.slice(0, written).unwrap(), &frame[..]);

        let (decoded, _) = decode_entry::<u64>(&buf, 0).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn test_flipped_bit_is_detected() {
        let frame = encode_entry(&entry(42)).unwrap();
        let mut buf = Buffer::heap(frame.len());
        buf.put_slice_at(0, &frame).unwrap();

        // Flip one bit inside the body.
        let corrupted = buf.u8_at(8).unwrap() ^ 0x01;
        buf.put_u8_at(8, corrupted).unwrap();

        assert!(matches!(decode_entry::<u64>(&buf, 0), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_short_frame_is_detected() {
        let frame = encode_entry(&entry(42)).unwrap();
        let mut buf = Buffer::heap(frame.len() - 2);
        buf.put_slice_at(0, &frame[..frame.len() - 2]).unwrap();

        assert!(decode_entry::<u64>(&buf, 0).is_err());
    }

    #[test]
    fn test_type_ids_are_stable() {
        assert_eq!(entry_type(&entry(1)), TYPE_KEEP_ALIVE);
        let noop = Entry::<u64> {
            log_id: LogId::new(1, 1),
            payload: EntryPayload::NoOp,
        };
        assert_eq!(entry_type(&noop), TYPE_NO_OP);
    }
}
