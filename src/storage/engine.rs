//! Sharded Cache Engine
//!
//! The [`Cache`] is the public face of the storage core. It owns a fleet
//! of independent shard workers and routes every single-key operation to
//! exactly one of them by FNV-1a hash; FLUSH_ALL and STATS fan out to all
//! shards.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                           Cache                            │
//! │   key ──fnv1a32(key) % N──►┌──────────┐                    │
//! │                            │ mailbox 0│──► ShardWorker 0   │
//! │                            ├──────────┤                    │
//! │                            │ mailbox 1│──► ShardWorker 1   │
//! │                            ├──────────┤                    │
//! │                            │   ...    │──► ...             │
//! │                            └──────────┘                    │
//! │                 ┌───────────────────────────┐              │
//! │                 │       SyncScheduler       │              │
//! │                 │ (process-wide fsync task) │              │
//! │                 └───────────────────────────┘              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shards share nothing except the sync scheduler's bounded mailbox, so
//! there are no locks on the data path: ordering within a shard comes
//! from its serial mailbox, and operations on different shards are
//! independent.

use crate::error::{CacheError, Result};
use crate::storage::files::StorageSet;
use crate::storage::sync::SyncScheduler;
use crate::storage::worker::{Op, Request, Response, ShardWorker};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Default per-shard mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1000;

/// Default interval between periodic fsync passes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// When the engine fsyncs shard files after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Never fsync; the OS flushes on its own schedule.
    None,
    /// Ask the sync scheduler for an fsync once per interval.
    #[default]
    Periodic,
    /// Fsync the affected file after every write.
    Always,
}

/// Engine configuration (process lifetime).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one `shard_NN` subdirectory per shard.
    pub data_dir: PathBuf,
    /// Number of shards; at least 1.
    pub shards: usize,
    /// TTL applied to stores without an explicit one; zero = none.
    pub default_ttl: Duration,
    /// Upper bound on any TTL; zero = unlimited.
    pub max_ttl: Duration,
    pub sync_mode: SyncMode,
    pub sync_interval: Duration,
    /// Bounded mailbox size per shard.
    pub mailbox_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            data_dir: PathBuf::from("data"),
            shards: DEFAULT_SHARD_COUNT,
            default_ttl: Duration::ZERO,
            max_ttl: Duration::ZERO,
            sync_mode: SyncMode::Periodic,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Aggregated statistics across all shards.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Total live entries.
    pub curr_items: u64,
    /// Total live value bytes.
    pub bytes: u64,
    /// Time since the engine was opened.
    pub uptime: Duration,
}

/// The sharded, persistent cache engine.
pub struct Cache {
    mailboxes: Vec<mpsc::Sender<Request>>,
    workers: Vec<JoinHandle<()>>,
    scheduler: Option<SyncScheduler>,
    started: Instant,
}

impl Cache {
    /// Opens (or creates) the cache under `config.data_dir`, recovering
    /// each shard from its files and spawning one worker task per shard.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: CacheConfig) -> Result<Cache> {
        let shard_count = config.shards.max(1);
        let capacity = config.mailbox_capacity.max(1);

        let mut storages = Vec::with_capacity(shard_count);
        for shard_id in 0..shard_count {
            let dir = config.data_dir.join(format!("shard_{:02}", shard_id));
            let storage = StorageSet::open(&dir, config.sync_mode == SyncMode::Always)?;
            storages.push(Arc::new(storage));
        }

        let (scheduler, triggers) = if config.sync_mode == SyncMode::Periodic {
            let (scheduler, triggers) =
                SyncScheduler::start(storages.clone(), config.sync_interval);
            (Some(scheduler), triggers.into_iter().map(Some).collect())
        } else {
            (None, (0..shard_count).map(|_| None).collect::<Vec<_>>())
        };

        let final_sync = config.sync_mode != SyncMode::None;
        let mut mailboxes = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for (shard_id, (storage, trigger)) in storages.into_iter().zip(triggers).enumerate() {
            let worker = ShardWorker::new(
                shard_id,
                storage,
                config.default_ttl,
                config.max_ttl,
                trigger,
                final_sync,
            )?;
            let (tx, rx) = mpsc::channel(capacity);
            mailboxes.push(tx);
            workers.push(tokio::spawn(worker.run(rx)));
        }

        info!(
            shards = shard_count,
            data_dir = %config.data_dir.display(),
            sync_mode = ?config.sync_mode,
            "cache engine opened"
        );

        Ok(Cache {
            mailboxes,
            workers,
            scheduler,
            started: Instant::now(),
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Time since the engine was opened.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Maps a key to its owning shard.
    fn shard_for(&self, key: &[u8]) -> usize {
        (fnv1a32(key) as usize) % self.mailboxes.len()
    }

    async fn send(
        &self,
        shard: usize,
        op: Op,
        key: Bytes,
        value: Bytes,
        ttl: Duration,
        cas: u64,
        delta: u64,
    ) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        let request = Request {
            op,
            key,
            value,
            ttl,
            cas,
            delta,
            reply,
        };
        self.mailboxes[shard]
            .send(request)
            .await
            .map_err(|_| CacheError::ShardUnavailable)?;
        rx.await.map_err(|_| CacheError::ShardUnavailable)?
    }

    async fn send_keyed(
        &self,
        op: Op,
        key: Bytes,
        value: Bytes,
        ttl: Duration,
        cas: u64,
        delta: u64,
    ) -> Result<Response> {
        let shard = self.shard_for(&key);
        self.send(shard, op, key, value, ttl, cas, delta).await
    }

    /// Fetches a value and its cas token.
    pub async fn get(&self, key: Bytes) -> Result<(Bytes, u64)> {
        let resp = self
            .send_keyed(Op::Get, key, Bytes::new(), Duration::ZERO, 0, 0)
            .await?;
        Ok((resp.value, resp.cas))
    }

    /// Stores a value unconditionally. Returns the new cas token.
    pub async fn set(&self, key: Bytes, value: Bytes, ttl: Duration) -> Result<u64> {
        Ok(self.send_keyed(Op::Set, key, value, ttl, 0, 0).await?.cas)
    }

    /// Stores a value only if the key is absent.
    pub async fn add(&self, key: Bytes, value: Bytes, ttl: Duration) -> Result<u64> {
        Ok(self.send_keyed(Op::Add, key, value, ttl, 0, 0).await?.cas)
    }

    /// Stores a value only if the key is present.
    pub async fn replace(&self, key: Bytes, value: Bytes, ttl: Duration) -> Result<u64> {
        Ok(self
            .send_keyed(Op::Replace, key, value, ttl, 0, 0)
            .await?
            .cas)
    }

    /// Stores a value only if `witness` matches the entry's current cas.
    pub async fn cas(&self, key: Bytes, value: Bytes, ttl: Duration, witness: u64) -> Result<u64> {
        Ok(self
            .send_keyed(Op::Cas, key, value, ttl, witness, 0)
            .await?
            .cas)
    }

    /// Removes a key.
    pub async fn delete(&self, key: Bytes) -> Result<()> {
        self.send_keyed(Op::Delete, key, Bytes::new(), Duration::ZERO, 0, 0)
            .await?;
        Ok(())
    }

    /// Updates only a key's expiry. Returns the unchanged cas token.
    pub async fn touch(&self, key: Bytes, ttl: Duration) -> Result<u64> {
        Ok(self
            .send_keyed(Op::Touch, key, Bytes::new(), ttl, 0, 0)
            .await?
            .cas)
    }

    /// Adds `delta` to a numeric value (wrapping). Returns the new value
    /// and cas token.
    pub async fn increment(&self, key: Bytes, delta: u64) -> Result<(u64, u64)> {
        let resp = self
            .send_keyed(Op::Incr, key, Bytes::new(), Duration::ZERO, 0, delta)
            .await?;
        Ok((parse_decimal(&resp.value), resp.cas))
    }

    /// Subtracts `delta` from a numeric value (floored at zero).
    pub async fn decrement(&self, key: Bytes, delta: u64) -> Result<(u64, u64)> {
        let resp = self
            .send_keyed(Op::Decr, key, Bytes::new(), Duration::ZERO, 0, delta)
            .await?;
        Ok((parse_decimal(&resp.value), resp.cas))
    }

    /// Appends bytes to an existing value.
    pub async fn append(&self, key: Bytes, tail: Bytes) -> Result<u64> {
        Ok(self
            .send_keyed(Op::Append, key, tail, Duration::ZERO, 0, 0)
            .await?
            .cas)
    }

    /// Prepends bytes to an existing value.
    pub async fn prepend(&self, key: Bytes, head: Bytes) -> Result<u64> {
        Ok(self
            .send_keyed(Op::Prepend, key, head, Duration::ZERO, 0, 0)
            .await?
            .cas)
    }

    /// Drops every entry on every shard and truncates all files.
    pub async fn flush_all(&self) -> Result<()> {
        for shard in 0..self.mailboxes.len() {
            self.send(
                shard,
                Op::FlushAll,
                Bytes::new(),
                Bytes::new(),
                Duration::ZERO,
                0,
                0,
            )
            .await?;
        }
        Ok(())
    }

    /// Sums item and byte counts across all shards.
    pub async fn stats(&self) -> Result<CacheStats> {
        let mut curr_items = 0;
        let mut bytes = 0;
        for shard in 0..self.mailboxes.len() {
            let resp = self
                .send(
                    shard,
                    Op::Stats,
                    Bytes::new(),
                    Bytes::new(),
                    Duration::ZERO,
                    0,
                    0,
                )
                .await?;
            if let Some(stats) = resp.stats {
                curr_items += stats.curr_items;
                bytes += stats.bytes;
            }
        }
        Ok(CacheStats {
            curr_items,
            bytes,
            uptime: self.started.elapsed(),
        })
    }

    /// Shuts the engine down cooperatively: stop admitting requests, let
    /// each shard drain its mailbox and run its final fsync, then stop
    /// the sync scheduler.
    pub async fn close(self) {
        drop(self.mailboxes);
        for worker in self.workers {
            let _ = worker.await;
        }
        if let Some(scheduler) = self.scheduler {
            scheduler.stopped().await;
        }
        info!("cache engine closed");
    }
}

/// FNV-1a, 32-bit. The router hash is part of the on-disk contract (it
/// decides which shard directory owns a key), so it is spelled out here
/// rather than taken from a hasher with unspecified stability.
fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

fn parse_decimal(data: &[u8]) -> u64 {
    data.iter()
        .filter(|b| b.is_ascii_digit())
        .fold(0u64, |acc, b| {
            acc.wrapping_mul(10).wrapping_add((b - b'0') as u64)
        })
}
