//! Shard Worker
//!
//! Each shard is driven by exactly one [`ShardWorker`] task that owns the
//! shard's [`StorageSet`], [`Index`] and allocation counters. Requests
//! arrive through a bounded mailbox and are executed strictly one at a
//! time; a 100 ms tick interleaves TTL cleanup with request handling in
//! the same loop, so no request ever observes partial state.
//!
//! ## Continuous defragmentation
//!
//! The key file and the data files never contain holes. Destroying an
//! entry moves the last record of the affected file into the freed
//! position and truncates the file by one record ("move tail to hole").
//! The index entry is removed *before* the data slot is compacted so the
//! tail-move's reverse lookup can never resolve to the dying entry.
//!
//! ## Crash ordering
//!
//! During a tail-move the relocated record (and, for data moves, the
//! owner's key record) is rewritten before the truncate. A crash in the
//! middle can therefore leave a duplicated record but never a dangling
//! reference; recovery re-derives the counters from file sizes and
//! tolerates the overestimate.

use crate::error::{CacheError, Result};
use crate::storage::files::StorageSet;
use crate::storage::index::{Index, IndexEntry};
use crate::storage::record::{bucket_for_size, KeyRecord, MAX_KEY_SIZE, NUM_BUCKETS};
use crate::storage::sync::SyncTrigger;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// How often a shard scans its expiry heap.
pub const TTL_TICK: Duration = Duration::from_millis(100);

/// Operation selector carried by a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Set,
    Add,
    Replace,
    Cas,
    Delete,
    Touch,
    Incr,
    Decr,
    Append,
    Prepend,
    FlushAll,
    Stats,
}

/// One request in a shard mailbox.
///
/// Fields that an operation does not use are left empty/zero. The reply
/// channel may be dropped by an impatient caller; the worker still
/// completes the operation and discards the orphaned reply.
#[derive(Debug)]
pub struct Request {
    pub op: Op,
    pub key: Bytes,
    pub value: Bytes,
    pub ttl: Duration,
    /// CAS witness; 0 means "not specified".
    pub cas: u64,
    pub delta: u64,
    pub reply: oneshot::Sender<Result<Response>>,
}

/// Successful outcome of a shard operation.
#[derive(Debug, Default)]
pub struct Response {
    pub value: Bytes,
    pub cas: u64,
    pub stats: Option<ShardStats>,
}

/// Per-shard statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardStats {
    /// Live entries in the index.
    pub curr_items: u64,
    /// Sum of live value lengths.
    pub bytes: u64,
}

/// Wall clock sampled exactly once per request.
///
/// Feeds both expiry computation and cas generation; the worker clamps
/// cas tokens to stay strictly increasing even if the wall clock steps
/// backwards.
#[derive(Debug, Clone, Copy)]
struct Clock {
    millis: i64,
    nanos: u64,
}

impl Clock {
    fn now() -> Clock {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Clock {
            millis: since_epoch.as_millis() as i64,
            nanos: since_epoch.as_nanos() as u64,
        }
    }
}

/// Single-owner worker for one shard.
pub struct ShardWorker {
    shard_id: usize,
    storage: Arc<StorageSet>,
    index: Index,
    next_key_id: u64,
    next_slot_id: [u64; NUM_BUCKETS],
    last_cas: u64,
    default_ttl: Duration,
    max_ttl: Duration,
    sync: Option<SyncTrigger>,
    /// Fsync once more when the mailbox closes (periodic/always modes).
    final_sync: bool,
}

impl ShardWorker {
    /// Builds a worker over an opened storage set, rebuilding the index
    /// from the key file.
    pub fn new(
        shard_id: usize,
        storage: Arc<StorageSet>,
        default_ttl: Duration,
        max_ttl: Duration,
        sync: Option<SyncTrigger>,
        final_sync: bool,
    ) -> Result<ShardWorker> {
        let mut worker = ShardWorker {
            shard_id,
            storage,
            index: Index::new(),
            next_key_id: 0,
            next_slot_id: [0; NUM_BUCKETS],
            last_cas: 0,
            default_ttl,
            max_ttl,
            sync,
            final_sync,
        };
        worker.recover()?;
        Ok(worker)
    }

    /// Rebuilds the in-memory state from the shard files.
    ///
    /// Unreadable records are skipped without truncating the file.
    /// Records that expired while the shard was offline are skipped too;
    /// their slots stay on disk until a later mutation compacts them away.
    fn recover(&mut self) -> Result<()> {
        let now = Clock::now();
        self.next_key_id = self.storage.key_count()?;

        let mut skipped = 0u64;
        for key_id in 0..self.next_key_id {
            let rec = match self.storage.read_key_record(key_id) {
                Ok(rec) => rec,
                Err(e) => {
                    warn!(shard = self.shard_id, key_id, error = %e, "skipping unreadable key record");
                    skipped += 1;
                    continue;
                }
            };

            // Keep the cas sequence increasing across restarts.
            self.last_cas = self.last_cas.max(rec.cas);

            if rec.expiry > 0 && rec.expiry <= now.millis {
                skipped += 1;
                continue;
            }

            let length = self
                .storage
                .read_slot_len(rec.bucket, rec.slot_idx)
                .unwrap_or(0);
            self.index.insert(IndexEntry {
                key: rec.key,
                key_id,
                bucket: rec.bucket,
                slot_idx: rec.slot_idx,
                length,
                expiry: rec.expiry,
                cas: rec.cas,
            });
        }

        for bucket in 0..NUM_BUCKETS as u8 {
            self.next_slot_id[bucket as usize] = self.storage.slot_count(bucket)?;
        }

        debug!(
            shard = self.shard_id,
            entries = self.index.len(),
            skipped,
            "shard recovered"
        );
        Ok(())
    }

    /// The worker loop: serve requests, tick TTL cleanup, drain on close.
    ///
    /// Returns once every sender to the mailbox has been dropped and the
    /// buffered requests have been served.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<Request>) {
        let mut tick = tokio::time::interval(TTL_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = mailbox.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
                _ = tick.tick() => self.cleanup_expired(),
            }
        }

        if self.final_sync {
            if let Err(e) = self.storage.sync_all() {
                warn!(shard = self.shard_id, error = %e, "final fsync failed");
            }
        }
        debug!(shard = self.shard_id, "shard worker stopped");
    }

    fn handle_request(&mut self, req: Request) {
        let Request {
            op,
            key,
            value,
            ttl,
            cas,
            delta,
            reply,
        } = req;
        let result = self.execute(op, key, value, ttl, cas, delta);
        // The caller may have gone away; side effects stand either way.
        let _ = reply.send(result);
    }

    /// Executes one operation against the shard state.
    pub(crate) fn execute(
        &mut self,
        op: Op,
        key: Bytes,
        value: Bytes,
        ttl: Duration,
        cas: u64,
        delta: u64,
    ) -> Result<Response> {
        let now = Clock::now();
        match op {
            Op::Get => self.get(&key, &now),
            Op::Set => self.with_sync_check(&now, |w| w.do_set(key, value, ttl, &now)),
            Op::Add => self.with_sync_check(&now, |w| {
                if w.live_entry(&key, &now)?.is_some() {
                    return Err(CacheError::KeyExists);
                }
                w.do_set(key, value, ttl, &now)
            }),
            Op::Replace => self.with_sync_check(&now, |w| {
                if w.live_entry(&key, &now)?.is_none() {
                    return Err(CacheError::KeyNotFound);
                }
                w.do_set(key, value, ttl, &now)
            }),
            Op::Cas => self.with_sync_check(&now, |w| {
                let entry = w.live_entry(&key, &now)?.ok_or(CacheError::KeyNotFound)?;
                if entry.cas != cas {
                    return Err(CacheError::CasMismatch);
                }
                w.do_set(key, value, ttl, &now)
            }),
            Op::Delete => self.with_sync_check(&now, |w| {
                let entry = w.live_entry(&key, &now)?.ok_or(CacheError::KeyNotFound)?;
                w.destroy_entry(&entry)?;
                Ok(Response::default())
            }),
            Op::Touch => self.with_sync_check(&now, |w| w.touch(&key, ttl, &now)),
            Op::Incr => self.with_sync_check(&now, |w| w.incr_decr(&key, delta, true, &now)),
            Op::Decr => self.with_sync_check(&now, |w| w.incr_decr(&key, delta, false, &now)),
            Op::Append => {
                self.with_sync_check(&now, |w| w.append_prepend(&key, &value, true, &now))
            }
            Op::Prepend => {
                self.with_sync_check(&now, |w| w.append_prepend(&key, &value, false, &now))
            }
            Op::FlushAll => self.with_sync_check(&now, |w| w.flush_all()),
            Op::Stats => Ok(Response {
                stats: Some(ShardStats {
                    curr_items: self.index.len() as u64,
                    bytes: self.index.live_bytes(),
                }),
                ..Response::default()
            }),
        }
    }

    /// Runs a mutation and, on success, checks whether a periodic sync is
    /// due.
    fn with_sync_check<F>(&mut self, now: &Clock, body: F) -> Result<Response>
    where
        F: FnOnce(&mut Self) -> Result<Response>,
    {
        let result = body(self);
        if result.is_ok() {
            if let Some(sync) = &self.sync {
                sync.check(now.millis);
            }
        }
        result
    }

    /// Looks up a key and lazily destroys it when its expiry has passed.
    ///
    /// Returns `Ok(None)` for "no live entry"; an `Err` only signals a
    /// storage failure during lazy destruction.
    fn live_entry(&mut self, key: &[u8], now: &Clock) -> Result<Option<IndexEntry>> {
        let Some(entry) = self.index.get(key).cloned() else {
            return Ok(None);
        };
        if entry.expiry > 0 && entry.expiry <= now.millis {
            self.destroy_entry(&entry)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn get(&mut self, key: &[u8], now: &Clock) -> Result<Response> {
        let entry = self.live_entry(key, now)?.ok_or(CacheError::KeyNotFound)?;
        let value = self.storage.read_data_slot(entry.bucket, entry.slot_idx)?;
        Ok(Response {
            value,
            cas: entry.cas,
            stats: None,
        })
    }

    /// Shared store path for SET/ADD/REPLACE/CAS.
    ///
    /// Validation happens before any write, so a rejected store leaves a
    /// pre-existing entry untouched. The data slot is written before the
    /// key record: a partial failure can orphan a slot but never leave a
    /// key record pointing at unwritten data.
    fn do_set(&mut self, key: Bytes, value: Bytes, ttl: Duration, now: &Clock) -> Result<Response> {
        if key.len() > MAX_KEY_SIZE {
            return Err(CacheError::KeyTooLarge);
        }
        let bucket = bucket_for_size(value.len()).ok_or(CacheError::ValueTooLarge)?;
        let expiry = self.expiry_for(ttl, now);

        let existing = self.index.get(&key).cloned();
        let (key_id, slot_idx, fresh_key, fresh_slot) = match &existing {
            // Same bucket: overwrite the value slot in place.
            Some(e) if e.bucket == bucket => (e.key_id, e.slot_idx, false, false),
            // Bucket changed: free the old slot first, then append into
            // the new bucket. The index entry must be gone before the
            // compaction so the tail-move cannot pick it up.
            Some(e) => {
                self.index.remove(&key);
                self.compact_data_slot(e.bucket, e.slot_idx)?;
                (e.key_id, self.next_slot_id[bucket as usize], false, true)
            }
            None => (
                self.next_key_id,
                self.next_slot_id[bucket as usize],
                true,
                true,
            ),
        };

        let cas = self.next_cas(now);
        self.storage.write_data_slot(bucket, slot_idx, &value)?;
        let rec = KeyRecord {
            key: key.clone(),
            cas,
            expiry,
            bucket,
            slot_idx,
        };
        self.storage.write_key_record(key_id, &rec)?;

        // Counters only advance after both writes succeeded.
        if fresh_key {
            self.next_key_id += 1;
        }
        if fresh_slot {
            self.next_slot_id[bucket as usize] += 1;
        }

        self.index.insert(IndexEntry {
            key,
            key_id,
            bucket,
            slot_idx,
            length: value.len() as u32,
            expiry,
            cas,
        });

        Ok(Response {
            cas,
            ..Response::default()
        })
    }

    fn touch(&mut self, key: &[u8], ttl: Duration, now: &Clock) -> Result<Response> {
        let entry = self.live_entry(key, now)?.ok_or(CacheError::KeyNotFound)?;
        let expiry = if ttl.is_zero() {
            0
        } else {
            now.millis + self.capped(ttl).as_millis() as i64
        };
        self.storage.update_expiry(entry.key_id, expiry)?;
        self.index.update_expiry(key, expiry);
        // cas is deliberately unchanged by TOUCH.
        Ok(Response {
            cas: entry.cas,
            ..Response::default()
        })
    }

    fn incr_decr(&mut self, key: &[u8], delta: u64, incr: bool, now: &Clock) -> Result<Response> {
        let entry = self.live_entry(key, now)?.ok_or(CacheError::KeyNotFound)?;
        let data = self.storage.read_data_slot(entry.bucket, entry.slot_idx)?;

        let mut current: u64 = 0;
        for &b in data.iter() {
            if !b.is_ascii_digit() {
                return Err(CacheError::NotNumeric);
            }
            current = current.wrapping_mul(10).wrapping_add((b - b'0') as u64);
        }

        let next = if incr {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };

        let new_value = Bytes::from(next.to_string());
        let cas = self.rewrite_value(entry, new_value.clone(), now)?;
        Ok(Response {
            value: new_value,
            cas,
            stats: None,
        })
    }

    fn append_prepend(
        &mut self,
        key: &[u8],
        data: &[u8],
        append: bool,
        now: &Clock,
    ) -> Result<Response> {
        let entry = self.live_entry(key, now)?.ok_or(CacheError::KeyNotFound)?;
        let current = self.storage.read_data_slot(entry.bucket, entry.slot_idx)?;

        let mut combined = Vec::with_capacity(current.len() + data.len());
        if append {
            combined.extend_from_slice(&current);
            combined.extend_from_slice(data);
        } else {
            combined.extend_from_slice(data);
            combined.extend_from_slice(&current);
        }

        let cas = self.rewrite_value(entry, Bytes::from(combined), now)?;
        Ok(Response {
            cas,
            ..Response::default()
        })
    }

    /// Replaces an entry's value, rebucketing when the new size demands a
    /// different slot class. Expiry is preserved; a fresh cas is issued
    /// and the key record rewritten so disk and index stay in agreement.
    fn rewrite_value(&mut self, entry: IndexEntry, value: Bytes, now: &Clock) -> Result<u64> {
        let bucket = bucket_for_size(value.len()).ok_or(CacheError::ValueTooLarge)?;

        let (slot_idx, fresh_slot) = if bucket == entry.bucket {
            (entry.slot_idx, false)
        } else {
            self.index.remove(&entry.key);
            self.compact_data_slot(entry.bucket, entry.slot_idx)?;
            (self.next_slot_id[bucket as usize], true)
        };

        let cas = self.next_cas(now);
        self.storage.write_data_slot(bucket, slot_idx, &value)?;
        let rec = KeyRecord {
            key: entry.key.clone(),
            cas,
            expiry: entry.expiry,
            bucket,
            slot_idx,
        };
        self.storage.write_key_record(entry.key_id, &rec)?;

        if fresh_slot {
            self.next_slot_id[bucket as usize] += 1;
        }

        self.index.insert(IndexEntry {
            key: entry.key,
            key_id: entry.key_id,
            bucket,
            slot_idx,
            length: value.len() as u32,
            expiry: entry.expiry,
            cas,
        });
        Ok(cas)
    }

    fn flush_all(&mut self) -> Result<Response> {
        self.index.clear();
        self.storage.truncate_keys_file(0)?;
        for bucket in 0..NUM_BUCKETS as u8 {
            self.storage.truncate_data_file(bucket, 0)?;
        }
        self.next_key_id = 0;
        self.next_slot_id = [0; NUM_BUCKETS];
        Ok(Response::default())
    }

    /// TTL tick body: pop and destroy every entry whose deadline passed.
    fn cleanup_expired(&mut self) {
        let now = Clock::now();
        let mut expired = 0u64;

        while let Some((expiry, key_id)) = self.index.peek_expiry() {
            if expiry <= 0 || expiry > now.millis {
                break;
            }
            let Some(key) = self.index.key_for_id(key_id).cloned() else {
                break;
            };
            let Some(entry) = self.index.get(&key).cloned() else {
                break;
            };
            if let Err(e) = self.destroy_entry(&entry) {
                warn!(shard = self.shard_id, error = %e, "expiry cleanup aborted");
                break;
            }
            expired += 1;
        }

        if expired > 0 {
            debug!(shard = self.shard_id, expired, "expired entries reclaimed");
            if let Some(sync) = &self.sync {
                sync.check(now.millis);
            }
        }
    }

    /// Full destruction: index first, then data slot, then key record.
    fn destroy_entry(&mut self, entry: &IndexEntry) -> Result<()> {
        self.index.remove(&entry.key);
        self.compact_data_slot(entry.bucket, entry.slot_idx)?;
        self.compact_key_slot(entry.key_id)?;
        Ok(())
    }

    /// Moves the tail slot of a bucket into the freed slot and truncates
    /// the data file by one slot.
    fn compact_data_slot(&mut self, bucket: u8, freed: u64) -> Result<()> {
        let count = self.next_slot_id[bucket as usize];
        if count == 0 {
            return Ok(());
        }
        let tail = count - 1;

        if freed != tail {
            let data = self.storage.read_data_slot(bucket, tail)?;
            self.storage.write_data_slot(bucket, freed, &data)?;
            if let Some(key) = self.index.key_at_slot(bucket, tail).cloned() {
                if let Some(owner) = self.index.get(&key) {
                    self.storage.update_slot_idx(owner.key_id, freed)?;
                }
                self.index.update_slot_idx(&key, freed);
            }
        }

        self.next_slot_id[bucket as usize] = tail;
        self.storage.truncate_data_file(bucket, tail)?;
        Ok(())
    }

    /// Moves the tail key record into the freed position and truncates the
    /// key file by one record.
    fn compact_key_slot(&mut self, freed: u64) -> Result<()> {
        if self.next_key_id == 0 {
            return Ok(());
        }
        let tail = self.next_key_id - 1;

        if freed != tail {
            let rec = self.storage.read_key_record(tail)?;
            self.storage.write_key_record(freed, &rec)?;
            if let Some(key) = self.index.key_for_id(tail).cloned() {
                self.index.update_key_id(&key, freed);
            }
        }

        self.next_key_id = tail;
        self.storage.truncate_keys_file(tail)?;
        Ok(())
    }

    fn capped(&self, ttl: Duration) -> Duration {
        if !self.max_ttl.is_zero() && ttl > self.max_ttl {
            self.max_ttl
        } else {
            ttl
        }
    }

    /// Expiry deadline for a store: the request TTL, else the configured
    /// default, both capped by the maximum TTL; zero means "never".
    fn expiry_for(&self, ttl: Duration, now: &Clock) -> i64 {
        let effective = if !ttl.is_zero() {
            ttl
        } else if !self.default_ttl.is_zero() {
            self.default_ttl
        } else {
            return 0;
        };
        now.millis + self.capped(effective).as_millis() as i64
    }

    /// Issues a cas token: wall-clock nanoseconds, clamped so every token
    /// is strictly greater than the shard's previous one.
    fn next_cas(&mut self, now: &Clock) -> u64 {
        let cas = now.nanos.max(self.last_cas + 1);
        self.last_cas = cas;
        cas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::{slot_size, KEY_RECORD_SIZE};
    use tempfile::TempDir;

    fn new_worker(dir: &TempDir) -> (ShardWorker, Arc<StorageSet>) {
        let storage = Arc::new(StorageSet::open(dir.path(), false).unwrap());
        let worker = ShardWorker::new(
            0,
            Arc::clone(&storage),
            Duration::ZERO,
            Duration::ZERO,
            None,
            false,
        )
        .unwrap();
        (worker, storage)
    }

    fn set(worker: &mut ShardWorker, key: &str, value: &[u8], ttl: Duration) -> u64 {
        worker
            .execute(
                Op::Set,
                Bytes::from(key.to_string()),
                Bytes::copy_from_slice(value),
                ttl,
                0,
                0,
            )
            .unwrap()
            .cas
    }

    fn get(worker: &mut ShardWorker, key: &str) -> Result<Response> {
        worker.execute(
            Op::Get,
            Bytes::from(key.to_string()),
            Bytes::new(),
            Duration::ZERO,
            0,
            0,
        )
    }

    fn delete(worker: &mut ShardWorker, key: &str) -> Result<Response> {
        worker.execute(
            Op::Delete,
            Bytes::from(key.to_string()),
            Bytes::new(),
            Duration::ZERO,
            0,
            0,
        )
    }

    #[test]
    fn test_put_get_cycle() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        let c1 = set(&mut worker, "k", b"v1", Duration::ZERO);
        let resp = get(&mut worker, "k").unwrap();
        assert_eq!(&resp.value[..], b"v1");
        assert_eq!(resp.cas, c1);

        let c2 = set(&mut worker, "k", b"v2", Duration::ZERO);
        assert!(c2 > c1);
        let resp = get(&mut worker, "k").unwrap();
        assert_eq!(&resp.value[..], b"v2");
        assert_eq!(resp.cas, c2);
    }

    #[test]
    fn test_add_and_replace_presence_rules() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        let replace = worker.execute(
            Op::Replace,
            Bytes::from("k"),
            Bytes::from("v"),
            Duration::ZERO,
            0,
            0,
        );
        assert!(matches!(replace, Err(CacheError::KeyNotFound)));

        worker
            .execute(
                Op::Add,
                Bytes::from("k"),
                Bytes::from("v"),
                Duration::ZERO,
                0,
                0,
            )
            .unwrap();
        let add_again = worker.execute(
            Op::Add,
            Bytes::from("k"),
            Bytes::from("w"),
            Duration::ZERO,
            0,
            0,
        );
        assert!(matches!(add_again, Err(CacheError::KeyExists)));
        assert_eq!(&get(&mut worker, "k").unwrap().value[..], b"v");

        worker
            .execute(
                Op::Replace,
                Bytes::from("k"),
                Bytes::from("w"),
                Duration::ZERO,
                0,
                0,
            )
            .unwrap();
        assert_eq!(&get(&mut worker, "k").unwrap().value[..], b"w");
    }

    #[test]
    fn test_cas_contention() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        let c1 = set(&mut worker, "k", b"a", Duration::ZERO);
        let c2 = set(&mut worker, "k", b"b", Duration::ZERO);

        let stale = worker.execute(
            Op::Cas,
            Bytes::from("k"),
            Bytes::from("c"),
            Duration::ZERO,
            c1,
            0,
        );
        assert!(matches!(stale, Err(CacheError::CasMismatch)));

        let resp = get(&mut worker, "k").unwrap();
        assert_eq!(&resp.value[..], b"b");
        assert_eq!(resp.cas, c2);

        let fresh = worker
            .execute(
                Op::Cas,
                Bytes::from("k"),
                Bytes::from("c"),
                Duration::ZERO,
                c2,
                0,
            )
            .unwrap();
        assert!(fresh.cas > c2);
        assert_eq!(&get(&mut worker, "k").unwrap().value[..], b"c");
    }

    #[test]
    fn test_compaction_keeps_files_dense() {
        let dir = TempDir::new().unwrap();
        let (mut worker, storage) = new_worker(&dir);

        let value = vec![0x42u8; 100];
        for i in 0..100 {
            set(&mut worker, &format!("k{}", i), &value, Duration::ZERO);
        }
        for i in (0..100).step_by(2) {
            delete(&mut worker, &format!("k{}", i)).unwrap();
        }

        for i in (1..100).step_by(2) {
            let resp = get(&mut worker, &format!("k{}", i)).unwrap();
            assert_eq!(&resp.value[..], &value[..], "key k{}", i);
        }
        for i in (0..100).step_by(2) {
            assert!(matches!(
                get(&mut worker, &format!("k{}", i)),
                Err(CacheError::KeyNotFound)
            ));
        }

        let keys_len = dir.path().join("keys").metadata().unwrap().len();
        assert_eq!(keys_len, 50 * KEY_RECORD_SIZE);
        let data_len = dir.path().join("data_00").metadata().unwrap().len();
        assert_eq!(data_len, 50 * slot_size(0));
        drop(storage);
    }

    #[test]
    fn test_bucket_promotion_on_append() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        set(&mut worker, "k", &vec![b'A'; 900], Duration::ZERO);
        worker
            .execute(
                Op::Append,
                Bytes::from("k"),
                Bytes::from(vec![b'B'; 500]),
                Duration::ZERO,
                0,
                0,
            )
            .unwrap();

        let resp = get(&mut worker, "k").unwrap();
        assert_eq!(resp.value.len(), 1400);
        assert!(resp.value[..900].iter().all(|&b| b == b'A'));
        assert!(resp.value[900..].iter().all(|&b| b == b'B'));

        // Bucket 0 is empty again; bucket 1 holds exactly one slot.
        assert_eq!(dir.path().join("data_00").metadata().unwrap().len(), 0);
        assert_eq!(
            dir.path().join("data_01").metadata().unwrap().len(),
            slot_size(1)
        );
    }

    #[test]
    fn test_prepend() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        set(&mut worker, "k", b"world", Duration::ZERO);
        worker
            .execute(
                Op::Prepend,
                Bytes::from("k"),
                Bytes::from("hello "),
                Duration::ZERO,
                0,
                0,
            )
            .unwrap();
        assert_eq!(&get(&mut worker, "k").unwrap().value[..], b"hello world");
    }

    #[test]
    fn test_incr_decr_semantics() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        set(&mut worker, "n", b"10", Duration::ZERO);
        let resp = worker
            .execute(
                Op::Incr,
                Bytes::from("n"),
                Bytes::new(),
                Duration::ZERO,
                0,
                5,
            )
            .unwrap();
        assert_eq!(&resp.value[..], b"15");

        // Decrement floors at zero.
        let resp = worker
            .execute(
                Op::Decr,
                Bytes::from("n"),
                Bytes::new(),
                Duration::ZERO,
                0,
                100,
            )
            .unwrap();
        assert_eq!(&resp.value[..], b"0");

        // Increment wraps modulo 2^64.
        set(
            &mut worker,
            "big",
            u64::MAX.to_string().as_bytes(),
            Duration::ZERO,
        );
        let resp = worker
            .execute(
                Op::Incr,
                Bytes::from("big"),
                Bytes::new(),
                Duration::ZERO,
                0,
                2,
            )
            .unwrap();
        assert_eq!(&resp.value[..], b"1");

        set(&mut worker, "s", b"12x4", Duration::ZERO);
        let err = worker.execute(
            Op::Incr,
            Bytes::from("s"),
            Bytes::new(),
            Duration::ZERO,
            0,
            1,
        );
        assert!(matches!(err, Err(CacheError::NotNumeric)));
    }

    #[test]
    fn test_delete_idempotence() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        assert!(matches!(
            delete(&mut worker, "ghost"),
            Err(CacheError::KeyNotFound)
        ));

        set(&mut worker, "k", b"v", Duration::ZERO);
        delete(&mut worker, "k").unwrap();
        assert!(matches!(
            delete(&mut worker, "k"),
            Err(CacheError::KeyNotFound)
        ));
        assert_eq!(dir.path().join("keys").metadata().unwrap().len(), 0);
    }

    #[test]
    fn test_key_and_value_size_limits() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        let long_key = "x".repeat(MAX_KEY_SIZE + 1);
        let err = worker.execute(
            Op::Set,
            Bytes::from(long_key),
            Bytes::from("v"),
            Duration::ZERO,
            0,
            0,
        );
        assert!(matches!(err, Err(CacheError::KeyTooLarge)));

        // An oversized overwrite must leave the previous value intact.
        set(&mut worker, "k", b"small", Duration::ZERO);
        let err = worker.execute(
            Op::Set,
            Bytes::from("k"),
            Bytes::from(vec![0u8; 64 * 1024 * 1024 + 1]),
            Duration::ZERO,
            0,
            0,
        );
        assert!(matches!(err, Err(CacheError::ValueTooLarge)));
        assert_eq!(&get(&mut worker, "k").unwrap().value[..], b"small");
    }

    #[test]
    fn test_expired_entry_destroyed_on_get() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        set(&mut worker, "k", b"v", Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));

        assert!(matches!(
            get(&mut worker, "k"),
            Err(CacheError::KeyNotFound)
        ));
        // Lazy destruction compacted both files.
        assert_eq!(dir.path().join("keys").metadata().unwrap().len(), 0);
        assert_eq!(dir.path().join("data_00").metadata().unwrap().len(), 0);
    }

    #[test]
    fn test_cleanup_expired_removes_only_due_entries() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        set(&mut worker, "a", b"x", Duration::from_secs(60));
        set(&mut worker, "b", b"y", Duration::from_millis(20));
        set(&mut worker, "c", b"z", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(40));

        worker.cleanup_expired();

        assert!(matches!(
            get(&mut worker, "b"),
            Err(CacheError::KeyNotFound)
        ));
        assert_eq!(&get(&mut worker, "a").unwrap().value[..], b"x");
        assert_eq!(&get(&mut worker, "c").unwrap().value[..], b"z");
        assert_eq!(
            dir.path().join("keys").metadata().unwrap().len(),
            2 * KEY_RECORD_SIZE
        );
    }

    #[test]
    fn test_touch_updates_expiry_not_cas() {
        let dir = TempDir::new().unwrap();
        let (mut worker, storage) = new_worker(&dir);

        let cas = set(&mut worker, "k", b"v", Duration::ZERO);
        let resp = worker
            .execute(
                Op::Touch,
                Bytes::from("k"),
                Bytes::new(),
                Duration::from_secs(60),
                0,
                0,
            )
            .unwrap();
        assert_eq!(resp.cas, cas);

        let rec = storage.read_key_record(0).unwrap();
        assert_eq!(rec.cas, cas);
        assert!(rec.expiry > 0);

        // Touch back to "no expiry" clears the deadline.
        worker
            .execute(
                Op::Touch,
                Bytes::from("k"),
                Bytes::new(),
                Duration::ZERO,
                0,
                0,
            )
            .unwrap();
        assert_eq!(storage.read_key_record(0).unwrap().expiry, 0);
    }

    #[test]
    fn test_flush_all_resets_everything() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        for i in 0..10 {
            set(&mut worker, &format!("k{}", i), b"v", Duration::ZERO);
        }
        worker
            .execute(
                Op::FlushAll,
                Bytes::new(),
                Bytes::new(),
                Duration::ZERO,
                0,
                0,
            )
            .unwrap();

        assert_eq!(dir.path().join("keys").metadata().unwrap().len(), 0);
        assert_eq!(dir.path().join("data_00").metadata().unwrap().len(), 0);
        assert!(matches!(
            get(&mut worker, "k0"),
            Err(CacheError::KeyNotFound)
        ));

        // The shard is immediately usable again.
        set(&mut worker, "fresh", b"v", Duration::ZERO);
        assert_eq!(&get(&mut worker, "fresh").unwrap().value[..], b"v");
    }

    #[test]
    fn test_recovery_restores_index() {
        let dir = TempDir::new().unwrap();
        let (c1, c2);
        {
            let (mut worker, storage) = new_worker(&dir);
            c1 = set(&mut worker, "k1", b"v1", Duration::ZERO);
            c2 = set(&mut worker, "k2", b"v2", Duration::ZERO);
            storage.sync_all().unwrap();
        }

        let (mut worker, _) = new_worker(&dir);
        let r1 = get(&mut worker, "k1").unwrap();
        assert_eq!(&r1.value[..], b"v1");
        assert_eq!(r1.cas, c1);
        let r2 = get(&mut worker, "k2").unwrap();
        assert_eq!(&r2.value[..], b"v2");
        assert_eq!(r2.cas, c2);

        let stats = worker
            .execute(
                Op::Stats,
                Bytes::new(),
                Bytes::new(),
                Duration::ZERO,
                0,
                0,
            )
            .unwrap()
            .stats
            .unwrap();
        assert_eq!(stats.curr_items, 2);
        assert_eq!(stats.bytes, 4);
    }

    #[test]
    fn test_recovery_skips_expired_records() {
        let dir = TempDir::new().unwrap();
        {
            let (mut worker, _) = new_worker(&dir);
            set(&mut worker, "stale", b"v", Duration::from_millis(20));
            set(&mut worker, "live", b"v", Duration::ZERO);
        }
        std::thread::sleep(Duration::from_millis(40));

        let (mut worker, _) = new_worker(&dir);
        assert!(matches!(
            get(&mut worker, "stale"),
            Err(CacheError::KeyNotFound)
        ));
        assert_eq!(&get(&mut worker, "live").unwrap().value[..], b"v");
        // The stale record is skipped but not truncated away.
        assert_eq!(
            dir.path().join("keys").metadata().unwrap().len(),
            2 * KEY_RECORD_SIZE
        );
    }

    #[test]
    fn test_cas_monotonic_across_reopen() {
        let dir = TempDir::new().unwrap();
        let before;
        {
            let (mut worker, _) = new_worker(&dir);
            before = set(&mut worker, "k", b"v", Duration::ZERO);
        }
        let (mut worker, _) = new_worker(&dir);
        let after = set(&mut worker, "k", b"v2", Duration::ZERO);
        assert!(after > before);
    }

    #[test]
    fn test_bucket_choice_property() {
        let dir = TempDir::new().unwrap();
        let (mut worker, storage) = new_worker(&dir);

        for size in [0usize, 1, 1024, 1025, 2048, 5000, 100_000] {
            let key = format!("k{}", size);
            set(&mut worker, &key, &vec![0u8; size], Duration::ZERO);
            let entry = worker.index.get(key.as_bytes()).unwrap();
            let cap = 1024usize << entry.bucket;
            assert!(size <= cap);
            if entry.bucket > 0 {
                assert!(size > cap / 2);
            }
        }
        drop(storage);
    }

    #[test]
    fn test_set_rebucket_moves_value() {
        let dir = TempDir::new().unwrap();
        let (mut worker, _) = new_worker(&dir);

        set(&mut worker, "a", &vec![1u8; 100], Duration::ZERO);
        set(&mut worker, "b", &vec![2u8; 100], Duration::ZERO);
        // Rewrite "a" into bucket 2; its bucket-0 slot is reclaimed by the
        // tail-move of "b".
        set(&mut worker, "a", &vec![3u8; 3000], Duration::ZERO);

        assert_eq!(&get(&mut worker, "b").unwrap().value[..], &vec![2u8; 100][..]);
        assert_eq!(
            &get(&mut worker, "a").unwrap().value[..],
            &vec![3u8; 3000][..]
        );
        assert_eq!(
            dir.path().join("data_00").metadata().unwrap().len(),
            slot_size(0)
        );
        assert_eq!(
            dir.path().join("data_02").metadata().unwrap().len(),
            slot_size(2)
        );
    }
}
