//! In-Memory Shard Index
//!
//! One [`Index`] per shard, owned exclusively by the shard's worker. It
//! holds:
//!
//! - the forward map: key bytes → [`IndexEntry`], ordered by key
//! - a `key_id` → key reverse map (key file compaction)
//! - a per-bucket `slot_idx` → key reverse map (data file compaction)
//! - the expiry min-heap (TTL cleanup)
//!
//! The reverse maps and the heap are maintained together with the forward
//! map on every insert, remove and compaction move, so a tail-move during
//! defragmentation can always find the entry that owns the moved record.
//! Disk records hold no pointers; all cross-referencing lives here.

use crate::storage::heap::ExpiryHeap;
use crate::storage::record::NUM_BUCKETS;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

/// One live key.
///
/// Mirrors the fields of the on-disk key record plus the value length,
/// which is tracked for the `bytes` statistic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Bytes,
    pub key_id: u64,
    pub bucket: u8,
    pub slot_idx: u64,
    pub length: u32,
    /// Unix milliseconds; 0 means no expiry.
    pub expiry: i64,
    pub cas: u64,
}

/// The in-memory lookup structures of one shard.
#[derive(Debug, Default)]
pub struct Index {
    by_key: BTreeMap<Bytes, IndexEntry>,
    by_key_id: HashMap<u64, Bytes>,
    by_slot: [HashMap<u64, Bytes>; NUM_BUCKETS],
    expiry_heap: ExpiryHeap,
    live_bytes: u64,
}

impl Index {
    pub fn new() -> Index {
        Index::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Sum of live value lengths across all entries.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Point lookup by key.
    pub fn get(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.by_key.get(key)
    }

    /// Reverse lookup: key owning a `key_id`.
    pub fn key_for_id(&self, key_id: u64) -> Option<&Bytes> {
        self.by_key_id.get(&key_id)
    }

    /// Reverse lookup: key owning a data slot.
    pub fn key_at_slot(&self, bucket: u8, slot_idx: u64) -> Option<&Bytes> {
        self.by_slot[bucket as usize].get(&slot_idx)
    }

    /// Smallest expiry deadline currently tracked, if any.
    pub fn peek_expiry(&self) -> Option<(i64, u64)> {
        self.expiry_heap.peek_min()
    }

    /// Inserts or replaces an entry, keeping every secondary structure in
    /// step.
    pub fn insert(&mut self, entry: IndexEntry) {
        if let Some(old) = self.by_key.get(&entry.key) {
            self.live_bytes -= old.length as u64;
            if (old.bucket, old.slot_idx) != (entry.bucket, entry.slot_idx) {
                self.by_slot[old.bucket as usize].remove(&old.slot_idx);
            }
            if old.key_id != entry.key_id {
                self.by_key_id.remove(&old.key_id);
            }
        }

        self.live_bytes += entry.length as u64;
        self.by_key_id.insert(entry.key_id, entry.key.clone());
        self.by_slot[entry.bucket as usize].insert(entry.slot_idx, entry.key.clone());
        if entry.expiry > 0 {
            self.expiry_heap.insert_or_update(entry.key_id, entry.expiry);
        } else {
            self.expiry_heap.remove(entry.key_id);
        }
        self.by_key.insert(entry.key.clone(), entry);
    }

    /// Removes an entry and all of its secondary mappings.
    pub fn remove(&mut self, key: &[u8]) -> Option<IndexEntry> {
        let entry = self.by_key.remove(key)?;
        self.live_bytes -= entry.length as u64;
        self.by_key_id.remove(&entry.key_id);
        self.by_slot[entry.bucket as usize].remove(&entry.slot_idx);
        self.expiry_heap.remove(entry.key_id);
        Some(entry)
    }

    /// Points an entry at a new slot after a data file tail-move.
    pub fn update_slot_idx(&mut self, key: &[u8], new_slot_idx: u64) {
        let Some(entry) = self.by_key.get_mut(key) else {
            return;
        };
        self.by_slot[entry.bucket as usize].remove(&entry.slot_idx);
        entry.slot_idx = new_slot_idx;
        self.by_slot[entry.bucket as usize].insert(new_slot_idx, entry.key.clone());
    }

    /// Points an entry at a new key id after a key file tail-move. The
    /// expiry heap is re-keyed in place.
    pub fn update_key_id(&mut self, key: &[u8], new_key_id: u64) {
        let Some(entry) = self.by_key.get_mut(key) else {
            return;
        };
        let old_key_id = entry.key_id;
        entry.key_id = new_key_id;
        self.by_key_id.remove(&old_key_id);
        self.by_key_id.insert(new_key_id, entry.key.clone());
        self.expiry_heap.rekey(old_key_id, new_key_id);
    }

    /// Rewrites an entry's expiry and fixes its heap membership.
    pub fn update_expiry(&mut self, key: &[u8], expiry: i64) {
        let Some(entry) = self.by_key.get_mut(key) else {
            return;
        };
        entry.expiry = expiry;
        if expiry > 0 {
            self.expiry_heap.insert_or_update(entry.key_id, expiry);
        } else {
            self.expiry_heap.remove(entry.key_id);
        }
    }

    /// Drops everything (FLUSH_ALL).
    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_key_id.clear();
        for map in &mut self.by_slot {
            map.clear();
        }
        self.expiry_heap.clear();
        self.live_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, key_id: u64, bucket: u8, slot_idx: u64, expiry: i64) -> IndexEntry {
        IndexEntry {
            key: Bytes::from(key.to_string()),
            key_id,
            bucket,
            slot_idx,
            length: 10,
            expiry,
            cas: key_id + 1,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut idx = Index::new();
        idx.insert(entry("a", 0, 0, 0, 0));
        idx.insert(entry("b", 1, 2, 5, 0));

        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get(b"a").unwrap().key_id, 0);
        assert_eq!(idx.key_for_id(1).unwrap(), "b");
        assert_eq!(idx.key_at_slot(2, 5).unwrap(), "b");
        assert_eq!(idx.live_bytes(), 20);

        let removed = idx.remove(b"a").unwrap();
        assert_eq!(removed.key_id, 0);
        assert!(idx.get(b"a").is_none());
        assert!(idx.key_for_id(0).is_none());
        assert!(idx.key_at_slot(0, 0).is_none());
        assert_eq!(idx.live_bytes(), 10);
    }

    #[test]
    fn test_replace_cleans_old_slot_mapping() {
        let mut idx = Index::new();
        idx.insert(entry("a", 0, 0, 3, 0));
        // Same key moves to another bucket.
        idx.insert(entry("a", 0, 1, 0, 0));

        assert!(idx.key_at_slot(0, 3).is_none());
        assert_eq!(idx.key_at_slot(1, 0).unwrap(), "a");
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.live_bytes(), 10);
    }

    #[test]
    fn test_heap_membership_follows_expiry() {
        let mut idx = Index::new();
        idx.insert(entry("a", 0, 0, 0, 500));
        assert_eq!(idx.peek_expiry(), Some((500, 0)));

        // Expiry cleared: entry leaves the heap.
        idx.insert(entry("a", 0, 0, 0, 0));
        assert_eq!(idx.peek_expiry(), None);

        idx.update_expiry(b"a", 900);
        assert_eq!(idx.peek_expiry(), Some((900, 0)));
        idx.update_expiry(b"a", 0);
        assert_eq!(idx.peek_expiry(), None);
    }

    #[test]
    fn test_update_slot_idx() {
        let mut idx = Index::new();
        idx.insert(entry("a", 0, 2, 9, 0));
        idx.update_slot_idx(b"a", 4);
        assert!(idx.key_at_slot(2, 9).is_none());
        assert_eq!(idx.key_at_slot(2, 4).unwrap(), "a");
        assert_eq!(idx.get(b"a").unwrap().slot_idx, 4);
    }

    #[test]
    fn test_update_key_id_rekeys_heap() {
        let mut idx = Index::new();
        idx.insert(entry("a", 7, 0, 0, 300));
        idx.update_key_id(b"a", 2);

        assert!(idx.key_for_id(7).is_none());
        assert_eq!(idx.key_for_id(2).unwrap(), "a");
        assert_eq!(idx.get(b"a").unwrap().key_id, 2);
        assert_eq!(idx.peek_expiry(), Some((300, 2)));
    }

    #[test]
    fn test_clear() {
        let mut idx = Index::new();
        idx.insert(entry("a", 0, 0, 0, 100));
        idx.insert(entry("b", 1, 1, 1, 0));
        idx.clear();
        assert!(idx.is_empty());
        assert_eq!(idx.live_bytes(), 0);
        assert_eq!(idx.peek_expiry(), None);
        assert!(idx.key_for_id(0).is_none());
    }
}
