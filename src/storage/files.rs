//! Shard Storage Files
//!
//! A [`StorageSet`] owns the on-disk files of one shard: the key file
//! (`keys`) and the 16 data-bucket files (`data_00` .. `data_15`). Files
//! are opened once when the shard starts and held open for its lifetime.
//!
//! All I/O is positional (`read_exact_at`/`write_all_at`); there is no
//! cursor state, so the sync scheduler can fsync a file while the owning
//! worker keeps writing to it. Errors are returned to the caller - a
//! failed read or write never panics the shard.

use crate::storage::record::{
    bucket_capacity, slot_size, KeyRecord, DATA_HEADER_SIZE, KEY_RECORD_SIZE, NUM_BUCKETS,
};
use bytes::{Buf, Bytes};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Byte offset of the `slot_idx` field inside a key record.
const SLOT_IDX_OFFSET: u64 = 1043;

/// Byte offset of the `expiry` field inside a key record.
const EXPIRY_OFFSET: u64 = 1034;

/// The open file set of a single shard.
pub struct StorageSet {
    keys_file: File,
    data_files: Vec<File>,
    sync_always: bool,
}

impl StorageSet {
    /// Opens (creating if needed) the shard directory and its files.
    ///
    /// With `sync_always` set, every successful write is followed by an
    /// fsync of the affected file.
    pub fn open(dir: &Path, sync_always: bool) -> io::Result<StorageSet> {
        std::fs::create_dir_all(dir)?;

        let open = |name: &str| -> io::Result<File> {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(dir.join(name))
        };

        let keys_file = open("keys")?;
        let mut data_files = Vec::with_capacity(NUM_BUCKETS);
        for bucket in 0..NUM_BUCKETS {
            data_files.push(open(&format!("data_{:02}", bucket))?);
        }

        Ok(StorageSet {
            keys_file,
            data_files,
            sync_always,
        })
    }

    /// Number of key records in the key file (derived from its size).
    pub fn key_count(&self) -> io::Result<u64> {
        Ok(self.keys_file.metadata()?.len() / KEY_RECORD_SIZE)
    }

    /// Number of slots in a bucket's data file (derived from its size).
    pub fn slot_count(&self, bucket: u8) -> io::Result<u64> {
        Ok(self.data_files[bucket as usize].metadata()?.len() / slot_size(bucket))
    }

    /// Reads and decodes the key record at `key_id`.
    pub fn read_key_record(&self, key_id: u64) -> io::Result<KeyRecord> {
        let mut buf = vec![0u8; KEY_RECORD_SIZE as usize];
        self.keys_file
            .read_exact_at(&mut buf, key_id * KEY_RECORD_SIZE)?;
        KeyRecord::decode(&buf)
    }

    /// Writes a key record at `key_id`.
    pub fn write_key_record(&self, key_id: u64, rec: &KeyRecord) -> io::Result<()> {
        self.keys_file
            .write_all_at(&rec.encode(), key_id * KEY_RECORD_SIZE)?;
        if self.sync_always {
            self.keys_file.sync_all()?;
        }
        Ok(())
    }

    /// Overwrites only the `slot_idx` field of a key record.
    ///
    /// Used by the compactor when a data slot moves: the record's other
    /// fields are untouched.
    pub fn update_slot_idx(&self, key_id: u64, slot_idx: u64) -> io::Result<()> {
        self.keys_file.write_all_at(
            &slot_idx.to_le_bytes(),
            key_id * KEY_RECORD_SIZE + SLOT_IDX_OFFSET,
        )?;
        if self.sync_always {
            self.keys_file.sync_all()?;
        }
        Ok(())
    }

    /// Overwrites only the `expiry` field of a key record (TOUCH).
    pub fn update_expiry(&self, key_id: u64, expiry: i64) -> io::Result<()> {
        self.keys_file.write_all_at(
            &expiry.to_le_bytes(),
            key_id * KEY_RECORD_SIZE + EXPIRY_OFFSET,
        )?;
        if self.sync_always {
            self.keys_file.sync_all()?;
        }
        Ok(())
    }

    /// Reads the payload of a data slot.
    ///
    /// Returns only the first `length` bytes of the slot; the padding
    /// beyond the stored length is never read.
    pub fn read_data_slot(&self, bucket: u8, slot_idx: u64) -> io::Result<Bytes> {
        let file = &self.data_files[bucket as usize];
        let offset = slot_idx * slot_size(bucket);

        let mut header = [0u8; DATA_HEADER_SIZE];
        file.read_exact_at(&mut header, offset)?;
        let length = (&header[..]).get_u32_le() as usize;
        if length > bucket_capacity(bucket) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "slot length exceeds bucket capacity",
            ));
        }

        let mut data = vec![0u8; length];
        file.read_exact_at(&mut data, offset + DATA_HEADER_SIZE as u64)?;
        Ok(Bytes::from(data))
    }

    /// Reads only the length prefix of a data slot.
    pub fn read_slot_len(&self, bucket: u8, slot_idx: u64) -> io::Result<u32> {
        let mut header = [0u8; DATA_HEADER_SIZE];
        self.data_files[bucket as usize]
            .read_exact_at(&mut header, slot_idx * slot_size(bucket))?;
        Ok((&header[..]).get_u32_le())
    }

    /// Writes a payload into a data slot.
    ///
    /// Only the length prefix and the payload bytes are written; slot
    /// padding is left as-is. The file is extended to a whole number of
    /// slots so that its size always equals `slot_count * slot_size`.
    pub fn write_data_slot(&self, bucket: u8, slot_idx: u64, data: &[u8]) -> io::Result<()> {
        debug_assert!(data.len() <= bucket_capacity(bucket));
        let file = &self.data_files[bucket as usize];
        let offset = slot_idx * slot_size(bucket);

        let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + data.len());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
        file.write_all_at(&buf, offset)?;

        let needed = (slot_idx + 1) * slot_size(bucket);
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }

        if self.sync_always {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Truncates the key file to `key_count` records.
    pub fn truncate_keys_file(&self, key_count: u64) -> io::Result<()> {
        self.keys_file.set_len(key_count * KEY_RECORD_SIZE)
    }

    /// Truncates a bucket's data file to `slot_count` slots.
    pub fn truncate_data_file(&self, bucket: u8, slot_count: u64) -> io::Result<()> {
        self.data_files[bucket as usize].set_len(slot_count * slot_size(bucket))
    }

    /// Fsyncs the key file and every data file, in that order.
    pub fn sync_all(&self) -> io::Result<()> {
        self.keys_file.sync_all()?;
        for file in &self.data_files {
            file.sync_all()?;
        }
        Ok(())
    }
}
