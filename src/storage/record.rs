//! On-Disk Record Layout
//!
//! This module defines the fixed-size record formats used by the shard
//! files and the size-bucket math that decides where a value lives.
//!
//! ## Key file
//!
//! The key file is an array of fixed 1051-byte records. A record's index
//! in the file is its `key_id`; there is no header, no magic and no
//! tombstones - every record in the file belongs to a live (or
//! not-yet-reclaimed expired) entry.
//!
//! ```text
//! offset  size  field
//! 0       2     key_len   (u16, 0..=1024)
//! 2       1024  key       (left-aligned, zero-padded)
//! 1026    8     cas       (u64)
//! 1034    8     expiry    (i64 Unix milliseconds, 0 = no expiry)
//! 1042    1     bucket    (0..=15)
//! 1043    8     slot_idx  (u64)
//! ```
//!
//! All integers are little-endian.
//!
//! ## Data files
//!
//! Each of the 16 bucket files is an array of fixed-size slots of
//! `4 + capacity` bytes: a u32 length prefix followed by the payload,
//! zero-padded to the bucket capacity. Bucket capacities double from
//! 1 KiB (bucket 0) to 64 MiB (bucket 15).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Number of size buckets per shard.
pub const NUM_BUCKETS: usize = 16;

/// Capacity of the smallest bucket (bucket 0).
pub const MIN_BUCKET_SIZE: usize = 1024;

/// Capacity of the largest bucket (bucket 15); also the value size limit.
pub const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 1024;

/// Size of one key file record.
pub const KEY_RECORD_SIZE: u64 = 1051;

/// Size of the length prefix in a data slot.
pub const DATA_HEADER_SIZE: usize = 4;

/// Returns the payload capacity of a bucket.
#[inline]
pub fn bucket_capacity(bucket: u8) -> usize {
    MIN_BUCKET_SIZE << bucket
}

/// Returns the total on-disk size of one slot of a bucket.
#[inline]
pub fn slot_size(bucket: u8) -> u64 {
    (DATA_HEADER_SIZE + bucket_capacity(bucket)) as u64
}

/// Picks the smallest bucket whose capacity can hold `size` bytes.
///
/// Returns `None` when the value exceeds the largest bucket (64 MiB);
/// callers surface that as `ValueTooLarge`.
pub fn bucket_for_size(size: usize) -> Option<u8> {
    (0..NUM_BUCKETS as u8).find(|&b| size <= bucket_capacity(b))
}

/// A decoded key file record.
///
/// This is a plain value type: records are identified by their position in
/// the key file, never by pointers stored inside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// The key bytes (at most [`MAX_KEY_SIZE`]).
    pub key: Bytes,
    /// CAS token issued by the last mutation.
    pub cas: u64,
    /// Expiry in Unix milliseconds; 0 means no expiry.
    pub expiry: i64,
    /// Bucket holding the value.
    pub bucket: u8,
    /// Slot index within the bucket's data file.
    pub slot_idx: u64,
}

impl KeyRecord {
    /// Serializes the record into its fixed 1051-byte wire form.
    pub fn encode(&self) -> BytesMut {
        debug_assert!(self.key.len() <= MAX_KEY_SIZE);
        let mut buf = BytesMut::with_capacity(KEY_RECORD_SIZE as usize);
        buf.put_u16_le(self.key.len() as u16);
        buf.put_slice(&self.key);
        buf.put_bytes(0, MAX_KEY_SIZE - self.key.len());
        buf.put_u64_le(self.cas);
        buf.put_i64_le(self.expiry);
        buf.put_u8(self.bucket);
        buf.put_u64_le(self.slot_idx);
        buf
    }

    /// Decodes a record from a 1051-byte buffer.
    ///
    /// Rejects records whose key length or bucket index is out of range;
    /// recovery skips those instead of trusting them.
    pub fn decode(mut buf: &[u8]) -> io::Result<KeyRecord> {
        if buf.len() != KEY_RECORD_SIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short key record",
            ));
        }
        let key_len = buf.get_u16_le() as usize;
        if key_len > MAX_KEY_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "key length out of range",
            ));
        }
        let key = Bytes::copy_from_slice(&buf[..key_len]);
        buf.advance(MAX_KEY_SIZE);
        let cas = buf.get_u64_le();
        let expiry = buf.get_i64_le();
        let bucket = buf.get_u8();
        if bucket as usize >= NUM_BUCKETS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bucket index out of range",
            ));
        }
        let slot_idx = buf.get_u64_le();
        Ok(KeyRecord {
            key,
            cas,
            expiry,
            bucket,
            slot_idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_capacities_double() {
        assert_eq!(bucket_capacity(0), 1024);
        assert_eq!(bucket_capacity(1), 2048);
        assert_eq!(bucket_capacity(10), 1024 * 1024);
        assert_eq!(bucket_capacity(15), MAX_VALUE_SIZE);
    }

    #[test]
    fn test_bucket_for_size_boundaries() {
        assert_eq!(bucket_for_size(0), Some(0));
        assert_eq!(bucket_for_size(1024), Some(0));
        assert_eq!(bucket_for_size(1025), Some(1));
        assert_eq!(bucket_for_size(2048), Some(1));
        assert_eq!(bucket_for_size(2049), Some(2));
        assert_eq!(bucket_for_size(MAX_VALUE_SIZE), Some(15));
        assert_eq!(bucket_for_size(MAX_VALUE_SIZE + 1), None);
    }

    #[test]
    fn test_slot_size_includes_header() {
        assert_eq!(slot_size(0), 4 + 1024);
        assert_eq!(slot_size(15), 4 + 64 * 1024 * 1024);
    }

    #[test]
    fn test_record_roundtrip() {
        let rec = KeyRecord {
            key: Bytes::from("session:user:42"),
            cas: 0xDEAD_BEEF_CAFE_F00D,
            expiry: 1_700_000_000_123,
            bucket: 3,
            slot_idx: 99,
        };
        let encoded = rec.encode();
        assert_eq!(encoded.len(), KEY_RECORD_SIZE as usize);
        let decoded = KeyRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_record_field_offsets() {
        let rec = KeyRecord {
            key: Bytes::from_static(b"k"),
            cas: 0x0102030405060708,
            expiry: 0x1112131415161718,
            bucket: 7,
            slot_idx: 0x2122232425262728,
        };
        let buf = rec.encode();
        assert_eq!(&buf[0..2], &[1, 0]);
        assert_eq!(buf[2], b'k');
        assert!(buf[3..1026].iter().all(|&b| b == 0));
        assert_eq!(&buf[1026..1034], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&buf[1034..1042], &0x1112131415161718i64.to_le_bytes());
        assert_eq!(buf[1042], 7);
        assert_eq!(&buf[1043..1051], &0x2122232425262728u64.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_bad_key_len() {
        let rec = KeyRecord {
            key: Bytes::from_static(b"k"),
            cas: 1,
            expiry: 0,
            bucket: 0,
            slot_idx: 0,
        };
        let mut buf = rec.encode();
        buf[0] = 0xFF;
        buf[1] = 0xFF;
        assert!(KeyRecord::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_bucket() {
        let rec = KeyRecord {
            key: Bytes::from_static(b"k"),
            cas: 1,
            expiry: 0,
            bucket: 0,
            slot_idx: 0,
        };
        let mut buf = rec.encode();
        buf[1042] = 16;
        assert!(KeyRecord::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(KeyRecord::decode(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_empty_key_roundtrip() {
        let rec = KeyRecord {
            key: Bytes::new(),
            cas: 0,
            expiry: 0,
            bucket: 0,
            slot_idx: 0,
        };
        let decoded = KeyRecord::decode(&rec.encode()).unwrap();
        assert!(decoded.key.is_empty());
    }
}
