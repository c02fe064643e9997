//! Memcached Wire Protocols
//!
//! TQCache speaks both memcached protocols on the same port. The
//! connection layer peeks at the first byte of a session: `0x80` selects
//! the binary protocol, anything else the text protocol.
//!
//! ## Modules
//!
//! - `text`: the line-based text protocol (`set`, `get`, `incr`, ...)
//! - `binary`: the 24-byte-header binary protocol
//!
//! Both parsers share the same incremental contract: feed them the read
//! buffer, get back `Ok(Some((item, consumed)))` for a complete frame,
//! `Ok(None)` when more bytes are needed, or `Err` when the stream is
//! beyond recovery and the connection should close.

pub mod binary;
pub mod text;

// Re-export the parser entry points for convenience
pub use binary::{BinaryError, BinaryRequest};
pub use text::{TextCommand, TextError, TextItem};
