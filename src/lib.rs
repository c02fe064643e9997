//! # TQCache - A Persistent Memcached-Compatible Key-Value Cache
//!
//! TQCache is a memcached-compatible cache server that keeps every item
//! on disk, built for session-storage workloads where a cache restart
//! must not log everyone out.
//!
//! ## Features
//!
//! - **Memcached-Compatible**: Speaks both the text and binary wire
//!   protocols on the same port
//! - **Persistent**: Fixed-record files per shard; entries survive
//!   restarts, with recovery driven purely by file sizes
//! - **Sharded Workers**: One lock-free, single-owner worker task per
//!   shard, routed by FNV-1a hash
//! - **Continuous Defragmentation**: Deletions move the file tail into
//!   the hole and truncate, so data files never fragment
//! - **TTL Support**: Per-item expiry with a min-heap driven cleanup
//!   tick per shard
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            TQCache                              │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐          │
//! │  │ TCP / Unix  │───►│ Connection  │───►│  Command    │          │
//! │  │  Listener   │    │  Handler    │    │  Handler    │          │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘          │
//! │                     (text | binary)           │                 │
//! │                                               ▼                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                         Cache                             │  │
//! │  │     fnv1a32(key) % N ──► per-shard worker + mailbox       │  │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐      │  │
//! │  │  │ shard_00 │ │ shard_01 │ │ shard_02 │ │ ...      │      │  │
//! │  │  │ keys     │ │ keys     │ │ keys     │ │          │      │  │
//! │  │  │ data_00..│ │ data_00..│ │ data_00..│ │          │      │  │
//! │  │  └──────────┘ └──────────┘ └──────────┘ └──────────┘      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              ▲                                  │
//! │                              │ best-effort fsync requests       │
//! │                 ┌────────────┴────────────┐                     │
//! │                 │      SyncScheduler      │                     │
//! │                 └─────────────────────────┘                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tqcache::storage::{Cache, CacheConfig};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tqcache::CacheError> {
//!     let cache = Cache::open(CacheConfig::default())?;
//!
//!     let cas = cache
//!         .set(Bytes::from("session:42"), Bytes::from("payload"), Duration::ZERO)
//!         .await?;
//!     let (value, got_cas) = cache.get(Bytes::from("session:42")).await?;
//!     assert_eq!(&value[..], b"payload");
//!     assert_eq!(got_cas, cas);
//!
//!     cache.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: the persistent sharded engine (files, index, workers)
//! - [`protocol`]: memcached text and binary protocol codecs
//! - [`commands`]: protocol command execution against the engine
//! - [`connection`]: per-client connection loop and statistics
//! - [`config`]: INI configuration loading
//!
//! ## Durability
//!
//! Three sync modes: `none` leaves flushing to the OS, `always` fsyncs
//! after every write, and `periodic` (the default) batches fsyncs
//! through a single process-wide scheduler at a configurable interval.

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::FileConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use error::CacheError;
pub use storage::{Cache, CacheConfig, CacheStats, SyncMode};

/// The default port TQCache listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// Version of TQCache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
