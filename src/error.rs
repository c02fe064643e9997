//! Error Types
//!
//! This module defines the error surface of the cache engine.
//! Every operation on the engine returns one of these variants instead of
//! panicking; the protocol layer maps them onto wire responses
//! (`NOT_FOUND`, `EXISTS`, binary status codes, ...).

use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// The first six variants are ordinary protocol-visible outcomes. `Io` is
/// different: it means a read/write/fsync/truncate on the shard's files
/// failed. The worker keeps running after an `Io` error, but the in-memory
/// index is not rolled back, so operators should treat persistent I/O
/// failure as shard-fatal.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No live entry for the key at the moment of the operation.
    #[error("key not found")]
    KeyNotFound,

    /// ADD on a key that is already present.
    #[error("key already exists")]
    KeyExists,

    /// CAS witness did not match the entry's current cas token.
    #[error("cas mismatch")]
    CasMismatch,

    /// Key longer than 1024 bytes.
    #[error("key too large")]
    KeyTooLarge,

    /// Value (or an append/prepend result) larger than 64 MiB.
    #[error("value too large")]
    ValueTooLarge,

    /// INCR/DECR target is not the ASCII decimal form of a u64.
    #[error("cannot increment or decrement non-numeric value")]
    NotNumeric,

    /// A storage read/write/fsync/truncate failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The owning shard has shut down and can no longer take requests.
    #[error("shard unavailable")]
    ShardUnavailable,
}

impl CacheError {
    /// True for the "key is simply not there" outcome, which several
    /// protocol paths treat as a non-error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::KeyNotFound)
    }
}

/// Convenience alias used throughout the storage modules.
pub type Result<T> = std::result::Result<T, CacheError>;
