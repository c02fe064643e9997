//! Connection Handling Module
//!
//! Manages individual client connections. Each accepted socket gets its
//! own async task; the handler sniffs the wire protocol from the first
//! byte (binary magic `0x80` or text) and then loops read → parse →
//! execute → respond until the client goes away.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              TCP / Unix socket listener (main.rs)           │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept()  (admission-checked)
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler (per client)              │
//! │                                                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────┐       │
//! │  │ Read bytes  │──►│ Parse frame  │──►│ Execute cmd │       │
//! │  └─────────────┘   │ (text/binary)│   └──────┬──────┘       │
//! │                    └──────────────┘          ▼              │
//! │                                      ┌─────────────┐        │
//! │                                      │ Write reply │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod handler;

// Re-export commonly used types
pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
