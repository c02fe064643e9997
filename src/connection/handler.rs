//! Connection Handler Module
//!
//! One handler task per client connection. The handler reads from the
//! socket into a `BytesMut` buffer, sniffs the protocol from the first
//! byte of the session (`0x80` = binary, anything else = text), then
//! loops: parse one frame, execute it, write the response.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP or Unix socket)
//!        │
//!        ▼
//! 2. First byte sniffed: 0x80 → binary, else text
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │ Read bytes → parse frame →   │
//!    │ execute command → write and  │
//!    │ flush response → loop        │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects / quit / protocol error
//! ```
//!
//! TCP is a stream: a read may contain half a command or several
//! pipelined ones, so responses are flushed once per batch rather than
//! per command.

use crate::commands::{CommandHandler, Outcome};
use crate::protocol::binary::{self, BinaryError};
use crate::protocol::text::{self, reply, TextError, TextItem};
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Buffer cap for text sessions; leaves room to swallow an oversized
/// item before erroring.
const TEXT_MAX_BUFFER: usize = 8 * 1024 * 1024;

/// Buffer cap for binary sessions; must fit the largest storable value.
const BINARY_MAX_BUFFER: usize = binary::MAX_BODY_SIZE + binary::HEADER_SIZE;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Connections rejected by the admission limit
    pub connections_rejected: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable text protocol error
    #[error("text protocol error: {0}")]
    Text(#[from] TextError),

    /// Unrecoverable binary protocol error
    #[error("binary protocol error: {0}")]
    Binary(#[from] BinaryError),

    /// Client disconnected normally
    #[error("client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("buffer size limit exceeded")]
    BufferFull,
}

/// Handles a single client connection over any byte stream (TCP or Unix
/// socket).
pub struct ConnectionHandler<S> {
    stream: BufWriter<S>,
    /// Peer description, for logging only.
    peer: String,
    buffer: BytesMut,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionHandler<S> {
    pub fn new(
        stream: S,
        peer: String,
        commands: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        Self {
            stream: BufWriter::new(stream),
            peer,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            commands,
            stats,
        }
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.peer, "client connected");

        let result = self.session().await;

        match &result {
            Ok(()) => info!(client = %self.peer, "client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.peer, "client disconnected")
            }
            Err(ConnectionError::Io(e))
                if e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.peer, "connection reset by client")
            }
            Err(e) => warn!(client = %self.peer, error = %e, "connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn session(&mut self) -> Result<(), ConnectionError> {
        // Sniff the protocol from the first byte of the session.
        while self.buffer.is_empty() {
            self.read_more_data(TEXT_MAX_BUFFER).await?;
        }
        if self.buffer[0] == binary::REQ_MAGIC {
            trace!(client = %self.peer, "binary protocol session");
            self.binary_loop().await
        } else {
            trace!(client = %self.peer, "text protocol session");
            self.text_loop().await
        }
    }

    async fn text_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            loop {
                let parsed = match text::parse(&self.buffer) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        // Tell the client why before giving up on the
                        // stream.
                        let msg = match &e {
                            TextError::LineTooLong => reply::BAD_FORMAT,
                            TextError::DataTooLarge(_) => reply::TOO_LARGE,
                        };
                        self.write(msg).await?;
                        self.stream.flush().await?;
                        return Err(e.into());
                    }
                };
                let Some((item, consumed)) = parsed else {
                    break;
                };
                self.buffer.advance(consumed);

                let outcome = match item {
                    TextItem::Reply(bytes) => Outcome {
                        response: bytes.to_vec(),
                        close: false,
                    },
                    TextItem::Command(cmd) => {
                        self.stats.command_processed();
                        self.commands.execute_text(cmd).await
                    }
                };
                self.write(&outcome.response).await?;
                if outcome.close {
                    self.stream.flush().await?;
                    return Ok(());
                }
            }

            self.stream.flush().await?;
            self.read_more_data(TEXT_MAX_BUFFER).await?;
        }
    }

    async fn binary_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some((request, consumed)) = binary::parse(&self.buffer)? {
                self.buffer.advance(consumed);
                self.stats.command_processed();

                let outcome = self.commands.execute_binary(request).await;
                self.write(&outcome.response).await?;
                if outcome.close {
                    self.stream.flush().await?;
                    return Ok(());
                }
            }

            self.stream.flush().await?;
            self.read_more_data(BINARY_MAX_BUFFER).await?;
        }
    }

    async fn read_more_data(&mut self, max_buffer: usize) -> Result<(), ConnectionError> {
        if self.buffer.len() >= max_buffer {
            warn!(client = %self.peer, size = self.buffer.len(), "buffer size limit exceeded");
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }

        self.stats.bytes_read(n);
        trace!(client = %self.peer, bytes = n, "read data");
        Ok(())
    }

    async fn write(&mut self, response: &[u8]) -> Result<(), ConnectionError> {
        if response.is_empty() {
            return Ok(());
        }
        self.stream.write_all(response).await?;
        self.stats.bytes_written(response.len());
        Ok(())
    }
}

/// Convenience wrapper that builds a [`ConnectionHandler`] and runs it,
/// downgrading routine disconnects to debug logs.
pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    peer: String,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, peer.clone(), commands, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %peer, error = %e, "connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Cache, CacheConfig, SyncMode};
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn create_test_server(dir: &TempDir) -> (SocketAddr, Arc<ConnectionStats>) {
        let cache = Arc::new(
            Cache::open(CacheConfig {
                data_dir: dir.path().to_path_buf(),
                shards: 2,
                sync_mode: SyncMode::None,
                ..CacheConfig::default()
            })
            .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ConnectionStats::new());

        let stats_clone = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let commands = CommandHandler::new(Arc::clone(&cache));
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(
                    stream,
                    client_addr.to_string(),
                    commands,
                    stats,
                ));
            }
        });

        (addr, stats)
    }

    async fn read_until(client: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(2);
        while !out.windows(needle.len()).any(|w| w == needle)
            && tokio::time::Instant::now() < deadline
        {
            match tokio::time::timeout(
                tokio::time::Duration::from_millis(200),
                client.read(&mut buf),
            )
            .await
            {
                Ok(Ok(n)) if n > 0 => out.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_text_set_get_over_socket() {
        let dir = TempDir::new().unwrap();
        let (addr, _) = create_test_server(&dir).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"set name 0 0 4\r\ntqkv\r\n")
            .await
            .unwrap();
        let out = read_until(&mut client, b"STORED\r\n").await;
        assert_eq!(out, b"STORED\r\n");

        client.write_all(b"get name\r\n").await.unwrap();
        let out = read_until(&mut client, b"END\r\n").await;
        assert_eq!(out, b"VALUE name 0 4\r\ntqkv\r\nEND\r\n");
    }

    #[tokio::test]
    async fn test_text_pipelined_commands() {
        let dir = TempDir::new().unwrap();
        let (addr, _) = create_test_server(&dir).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"set k1 0 0 2\r\nv1\r\nset k2 0 0 2\r\nv2\r\nget k1 k2\r\n")
            .await
            .unwrap();
        let out = read_until(&mut client, b"END\r\n").await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("STORED"));
        assert!(text.contains("v1"));
        assert!(text.contains("v2"));
    }

    #[tokio::test]
    async fn test_text_unknown_command_keeps_session() {
        let dir = TempDir::new().unwrap();
        let (addr, _) = create_test_server(&dir).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"bogus\r\nversion\r\n").await.unwrap();
        let out = read_until(&mut client, b"VERSION").await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("ERROR\r\n"));
        assert!(text.contains("VERSION"));
    }

    #[tokio::test]
    async fn test_binary_session_over_socket() {
        let dir = TempDir::new().unwrap();
        let (addr, _) = create_test_server(&dir).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Binary SET "k" = "hi" with 8 extras bytes (flags + expiry).
        let mut req = Vec::new();
        req.push(0x80);
        req.push(0x01); // SET
        req.extend_from_slice(&1u16.to_be_bytes()); // key len
        req.push(8); // extras len
        req.push(0);
        req.extend_from_slice(&0u16.to_be_bytes());
        req.extend_from_slice(&11u32.to_be_bytes()); // body: 8 + 1 + 2
        req.extend_from_slice(&7u32.to_be_bytes()); // opaque
        req.extend_from_slice(&0u64.to_be_bytes());
        req.extend_from_slice(&[0; 8]); // extras
        req.extend_from_slice(b"k");
        req.extend_from_slice(b"hi");
        client.write_all(&req).await.unwrap();

        let mut header = [0u8; 24];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x81);
        assert_eq!(u16::from_be_bytes([header[6], header[7]]), 0); // success
        assert_eq!(&header[12..16], &7u32.to_be_bytes());

        // Binary GET "k".
        let mut req = Vec::new();
        req.push(0x80);
        req.push(0x00); // GET
        req.extend_from_slice(&1u16.to_be_bytes());
        req.push(0);
        req.push(0);
        req.extend_from_slice(&0u16.to_be_bytes());
        req.extend_from_slice(&1u32.to_be_bytes());
        req.extend_from_slice(&8u32.to_be_bytes());
        req.extend_from_slice(&0u64.to_be_bytes());
        req.extend_from_slice(b"k");
        client.write_all(&req).await.unwrap();

        let mut header = [0u8; 24];
        client.read_exact(&mut header).await.unwrap();
        let body_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let mut body = vec![0u8; body_len];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body[4..], b"hi"); // after 4 flag bytes
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (addr, _) = create_test_server(&dir).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"quit\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0); // server closed without a reply
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let dir = TempDir::new().unwrap();
        let (addr, stats) = create_test_server(&dir).await;

        assert_eq!(stats.active(), 0);
        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        client.write_all(b"version\r\n").await.unwrap();
        let _ = read_until(&mut client, b"\r\n").await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active(), 1);
        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(stats.active(), 0);
    }
}
