//! Storage Engine Module
//!
//! The persistent core of TQCache: a fleet of independent shards, each
//! owned by a single worker task, storing fixed-size records in a key
//! file and 16 size-bucketed data files.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Cache                              │
//! │        (router: fnv1a32(key) % N, fan-out ops)              │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌───────────┐    │
//! │  │ Shard 0   │ │ Shard 1   │ │ Shard 2   │ │ ...N      │    │
//! │  │ worker    │ │ worker    │ │ worker    │ │ workers   │    │
//! │  │ index     │ │ index     │ │ index     │ │           │    │
//! │  │ files     │ │ files     │ │ files     │ │           │    │
//! │  └───────────┘ └───────────┘ └───────────┘ └───────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                             ▲
//!                             │ best-effort fsync requests
//!               ┌─────────────┴─────────────┐
//!               │       SyncScheduler       │
//!               │   (background Tokio task) │
//!               └───────────────────────────┘
//! ```
//!
//! ## Layout on disk
//!
//! Every shard keeps its files under `<data-dir>/shard_NN/`: a `keys`
//! file of fixed 1051-byte records and `data_00`..`data_15` bucket files
//! whose slot capacities double from 1 KiB to 64 MiB. Deletions compact
//! continuously (move tail into hole, truncate), so file sizes always
//! equal `live records x record size`.

pub mod engine;
pub mod files;
pub mod heap;
pub mod index;
pub mod record;
pub mod sync;
pub mod worker;

// Re-export the types the rest of the crate (and embedders) work with.
pub use engine::{Cache, CacheConfig, CacheStats, SyncMode, DEFAULT_SHARD_COUNT};
pub use files::StorageSet;
pub use record::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
