//! Periodic Sync Scheduler
//!
//! In `periodic` durability mode, workers do not fsync on their own hot
//! path. Instead, after each mutation they check how long ago their files
//! were last synced and, when the interval has elapsed, post their shard
//! id to the process-wide [`SyncScheduler`] over a bounded, non-blocking
//! channel. The scheduler fsyncs that shard's files (key file first, then
//! each data file) and records the completion time.
//!
//! The notification send is best-effort: when the channel is full a sync
//! for some shard is already pending and the next scheduler pass will
//! pick up the work anyway.

use crate::storage::files::StorageSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Per-shard handle for requesting a periodic sync.
///
/// Owned by the shard worker; cloning the sender side of the scheduler
/// channel is what keeps the scheduler alive.
#[derive(Debug)]
pub struct SyncTrigger {
    shard_id: usize,
    interval_ms: i64,
    last_sync: Arc<AtomicI64>,
    tx: mpsc::Sender<usize>,
}

impl SyncTrigger {
    /// Posts a sync request if the interval has elapsed since the last
    /// completed sync. Never blocks; a full channel means a sync is
    /// already pending.
    pub fn check(&self, now_ms: i64) {
        if now_ms - self.last_sync.load(Ordering::Relaxed) >= self.interval_ms {
            let _ = self.tx.try_send(self.shard_id);
        }
    }

    /// Unix milliseconds of the last completed sync for this shard.
    pub fn last_sync_ms(&self) -> i64 {
        self.last_sync.load(Ordering::Relaxed)
    }
}

/// The single process-wide fsync fan-out task.
pub struct SyncScheduler {
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Starts the scheduler over the given shard storage sets and returns
    /// one [`SyncTrigger`] per shard.
    ///
    /// The scheduler task exits after every trigger has been dropped and
    /// the pending notifications have been drained.
    pub fn start(
        storages: Vec<Arc<StorageSet>>,
        interval: Duration,
    ) -> (SyncScheduler, Vec<SyncTrigger>) {
        let (tx, rx) = mpsc::channel(storages.len().max(1) * 2);
        let started = now_millis();

        let last_syncs: Vec<Arc<AtomicI64>> = storages
            .iter()
            .map(|_| Arc::new(AtomicI64::new(started)))
            .collect();

        let triggers = last_syncs
            .iter()
            .enumerate()
            .map(|(shard_id, last_sync)| SyncTrigger {
                shard_id,
                interval_ms: interval.as_millis() as i64,
                last_sync: Arc::clone(last_sync),
                tx: tx.clone(),
            })
            .collect();

        let handle = tokio::spawn(run(rx, storages, last_syncs));
        (SyncScheduler { handle }, triggers)
    }

    /// Waits for the scheduler to finish its final drain.
    pub async fn stopped(self) {
        let _ = self.handle.await;
    }
}

async fn run(
    mut rx: mpsc::Receiver<usize>,
    storages: Vec<Arc<StorageSet>>,
    last_syncs: Vec<Arc<AtomicI64>>,
) {
    while let Some(shard_id) = rx.recv().await {
        match storages[shard_id].sync_all() {
            Ok(()) => {
                last_syncs[shard_id].store(now_millis(), Ordering::Relaxed);
                debug!(shard = shard_id, "shard files synced");
            }
            Err(e) => warn!(shard = shard_id, error = %e, "shard sync failed"),
        }
    }
    debug!("sync scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_trigger_fires_after_interval() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageSet::open(dir.path(), false).unwrap());
        let (scheduler, triggers) =
            SyncScheduler::start(vec![Arc::clone(&storage)], Duration::from_millis(50));

        let before = triggers[0].last_sync_ms();

        // Too early: nothing should be posted.
        triggers[0].check(before + 10);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(triggers[0].last_sync_ms(), before);

        // Past the interval: the scheduler syncs and stamps the time.
        triggers[0].check(before + 60);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(triggers[0].last_sync_ms() > before);

        drop(triggers);
        scheduler.stopped().await;
    }

    #[tokio::test]
    async fn test_scheduler_drains_and_stops() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageSet::open(dir.path(), false).unwrap());
        let (scheduler, triggers) =
            SyncScheduler::start(vec![storage], Duration::from_millis(1));

        triggers[0].check(now_millis() + 1000);
        drop(triggers);

        // Must terminate: the channel is closed and the backlog drained.
        scheduler.stopped().await;
    }
}
