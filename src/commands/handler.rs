//! Command Handler Module
//!
//! This module bridges the wire protocols and the storage engine: it
//! takes parsed text or binary commands, executes them against the
//! [`Cache`], and renders the protocol response bytes.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ text / binary   │  (protocol module)
//! │ parser          │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - exptime→TTL  │
//! │  - dispatch     │
//! │  - render reply │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Cache       │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Expiry times
//!
//! Both protocols carry memcached `exptime` values: `0` means "no
//! explicit TTL" (the engine default applies), a value up to 30 days is
//! relative seconds, anything larger is an absolute Unix timestamp, and
//! a negative value (text protocol only) expires the item immediately.

use crate::error::CacheError;
use crate::protocol::binary::{self, opcode, status, BinaryRequest};
use crate::protocol::text::{self, reply, StorageVerb, TextCommand};
use crate::storage::Cache;
use bytes::{Buf, Bytes};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// exptime values above this are absolute Unix timestamps (30 days, the
/// memcached convention).
const RELATIVE_EXPTIME_LIMIT: i64 = 2_592_000;

/// Executes protocol commands against the cache engine.
#[derive(Clone)]
pub struct CommandHandler {
    cache: Arc<Cache>,
}

/// What a handled command asks the connection to do.
#[derive(Debug, PartialEq, Eq)]
pub struct Outcome {
    /// Bytes to write back; may be empty (noreply, quiet miss).
    pub response: Vec<u8>,
    /// Close the connection after writing the response.
    pub close: bool,
}

impl Outcome {
    fn reply(response: Vec<u8>) -> Outcome {
        Outcome {
            response,
            close: false,
        }
    }

    fn quit() -> Outcome {
        Outcome {
            response: Vec::new(),
            close: true,
        }
    }
}

impl CommandHandler {
    pub fn new(cache: Arc<Cache>) -> CommandHandler {
        CommandHandler { cache }
    }

    // ========================================================================
    // Text protocol
    // ========================================================================

    /// Executes one text command, returning the response bytes.
    pub async fn execute_text(&self, cmd: TextCommand) -> Outcome {
        match cmd {
            TextCommand::Storage {
                verb,
                key,
                exptime,
                data,
                noreply,
            } => {
                let out = self.text_storage(verb, key, exptime, data).await;
                Outcome::reply(if noreply { Vec::new() } else { out })
            }
            TextCommand::CasStore {
                key,
                exptime,
                data,
                cas,
                noreply,
            } => {
                let ttl = ttl_from_exptime(exptime);
                let out = match self.cache.cas(key, data, ttl, cas).await {
                    Ok(_) => reply::STORED.to_vec(),
                    Err(CacheError::CasMismatch) => reply::EXISTS.to_vec(),
                    Err(CacheError::KeyNotFound) => reply::NOT_FOUND.to_vec(),
                    Err(e) => server_error(&e),
                };
                Outcome::reply(if noreply { Vec::new() } else { out })
            }
            TextCommand::Get { keys, with_cas } => {
                let mut out = Vec::new();
                for key in keys {
                    if let Ok((value, cas)) = self.cache.get(key.clone()).await {
                        text::write_value(&mut out, &key, &value, with_cas.then_some(cas));
                    }
                }
                out.extend_from_slice(reply::END);
                Outcome::reply(out)
            }
            TextCommand::GetAndTouch {
                exptime,
                keys,
                with_cas,
            } => {
                let ttl = ttl_from_exptime(exptime);
                let mut out = Vec::new();
                for key in keys {
                    let Ok((value, cas)) = self.cache.get(key.clone()).await else {
                        continue;
                    };
                    let _ = self.cache.touch(key.clone(), ttl).await;
                    text::write_value(&mut out, &key, &value, with_cas.then_some(cas));
                }
                out.extend_from_slice(reply::END);
                Outcome::reply(out)
            }
            TextCommand::Delete { key, noreply } => {
                let out = match self.cache.delete(key).await {
                    Ok(()) => reply::DELETED.to_vec(),
                    Err(CacheError::KeyNotFound) => reply::NOT_FOUND.to_vec(),
                    Err(e) => server_error(&e),
                };
                Outcome::reply(if noreply { Vec::new() } else { out })
            }
            TextCommand::IncrDecr {
                key,
                delta,
                incr,
                noreply,
            } => {
                let result = if incr {
                    self.cache.increment(key, delta).await
                } else {
                    self.cache.decrement(key, delta).await
                };
                let out = match result {
                    Ok((value, _)) => format!("{}\r\n", value).into_bytes(),
                    Err(CacheError::KeyNotFound) => reply::NOT_FOUND.to_vec(),
                    Err(CacheError::NotNumeric) => reply::NOT_NUMERIC.to_vec(),
                    Err(e) => server_error(&e),
                };
                Outcome::reply(if noreply { Vec::new() } else { out })
            }
            TextCommand::Touch {
                key,
                exptime,
                noreply,
            } => {
                let ttl = ttl_from_exptime(exptime);
                let out = match self.cache.touch(key, ttl).await {
                    Ok(_) => reply::TOUCHED.to_vec(),
                    Err(CacheError::KeyNotFound) => reply::NOT_FOUND.to_vec(),
                    Err(e) => server_error(&e),
                };
                Outcome::reply(if noreply { Vec::new() } else { out })
            }
            TextCommand::FlushAll { noreply } => {
                let out = match self.cache.flush_all().await {
                    Ok(()) => reply::OK.to_vec(),
                    Err(e) => server_error(&e),
                };
                Outcome::reply(if noreply { Vec::new() } else { out })
            }
            TextCommand::Stats => Outcome::reply(self.render_stats_text().await),
            TextCommand::Version => {
                Outcome::reply(format!("VERSION {}\r\n", crate::VERSION).into_bytes())
            }
            TextCommand::Verbosity => Outcome::reply(Vec::new()),
            TextCommand::Quit => Outcome::quit(),
        }
    }

    async fn text_storage(
        &self,
        verb: StorageVerb,
        key: Bytes,
        exptime: i64,
        data: Bytes,
    ) -> Vec<u8> {
        let ttl = ttl_from_exptime(exptime);
        let result = match verb {
            StorageVerb::Set => self.cache.set(key, data, ttl).await,
            StorageVerb::Add => self.cache.add(key, data, ttl).await,
            StorageVerb::Replace => self.cache.replace(key, data, ttl).await,
            StorageVerb::Append => self.cache.append(key, data).await,
            StorageVerb::Prepend => self.cache.prepend(key, data).await,
        };
        match result {
            Ok(_) => reply::STORED.to_vec(),
            Err(CacheError::KeyExists) | Err(CacheError::KeyNotFound) => {
                reply::NOT_STORED.to_vec()
            }
            Err(e) => server_error(&e),
        }
    }

    async fn render_stats_text(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in self.stat_pairs().await {
            text::write_stat(&mut out, &name, &value);
        }
        out.extend_from_slice(reply::END);
        out
    }

    /// The STAT lines shared by both protocols.
    async fn stat_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("pid".to_string(), std::process::id().to_string()),
            (
                "uptime".to_string(),
                self.cache.uptime().as_secs().to_string(),
            ),
            ("time".to_string(), unix_now_secs().to_string()),
            ("version".to_string(), crate::VERSION.to_string()),
        ];
        if let Ok(stats) = self.cache.stats().await {
            pairs.push(("curr_items".to_string(), stats.curr_items.to_string()));
            pairs.push(("bytes".to_string(), stats.bytes.to_string()));
        }
        pairs
    }

    // ========================================================================
    // Binary protocol
    // ========================================================================

    /// Executes one binary request, returning the response bytes.
    pub async fn execute_binary(&self, req: BinaryRequest) -> Outcome {
        match req.opcode {
            opcode::SET | opcode::ADD | opcode::REPLACE => self.binary_storage(req).await,
            opcode::GET | opcode::GETQ => self.binary_get(req, false).await,
            opcode::GETK | opcode::GETKQ => self.binary_get(req, true).await,
            opcode::DELETE => {
                let out = match self.cache.delete(req.key.clone()).await {
                    Ok(()) => simple_response(&req, status::SUCCESS, 0),
                    Err(_) => simple_response(&req, status::KEY_NOT_FOUND, 0),
                };
                Outcome::reply(out)
            }
            opcode::INCREMENT | opcode::DECREMENT => self.binary_incr_decr(req).await,
            opcode::FLUSH => {
                let out = match self.cache.flush_all().await {
                    Ok(()) => simple_response(&req, status::SUCCESS, 0),
                    Err(_) => simple_response(&req, status::NOT_STORED, 0),
                };
                Outcome::reply(out)
            }
            opcode::APPEND | opcode::PREPEND => self.binary_append_prepend(req).await,
            opcode::NOOP => Outcome::reply(simple_response(&req, status::SUCCESS, 0)),
            opcode::VERSION => {
                let mut out = Vec::new();
                binary::write_response(
                    &mut out,
                    req.opcode,
                    req.opaque,
                    status::SUCCESS,
                    &[],
                    &[],
                    crate::VERSION.as_bytes(),
                    0,
                );
                Outcome::reply(out)
            }
            opcode::STAT => {
                let mut out = Vec::new();
                for (name, value) in self.stat_pairs().await {
                    binary::write_response(
                        &mut out,
                        req.opcode,
                        req.opaque,
                        status::SUCCESS,
                        &[],
                        name.as_bytes(),
                        value.as_bytes(),
                        0,
                    );
                }
                // Terminating empty packet.
                binary::write_response(
                    &mut out,
                    req.opcode,
                    req.opaque,
                    status::SUCCESS,
                    &[],
                    &[],
                    &[],
                    0,
                );
                Outcome::reply(out)
            }
            opcode::TOUCH => {
                if req.extras.len() != 4 {
                    return Outcome::reply(simple_response(&req, status::INVALID_ARGS, 0));
                }
                let ttl = ttl_from_binary_expiry((&req.extras[..]).get_u32());
                let out = match self.cache.touch(req.key.clone(), ttl).await {
                    Ok(cas) => simple_response(&req, status::SUCCESS, cas),
                    Err(_) => simple_response(&req, status::KEY_NOT_FOUND, 0),
                };
                Outcome::reply(out)
            }
            opcode::GAT => self.binary_get_and_touch(req, false).await,
            opcode::GATK => self.binary_get_and_touch(req, true).await,
            opcode::QUIT => Outcome::quit(),
            _ => Outcome::reply(simple_response(&req, status::UNKNOWN_COMMAND, 0)),
        }
    }

    async fn binary_storage(&self, req: BinaryRequest) -> Outcome {
        if req.extras.len() != 8 {
            return Outcome::reply(simple_response(&req, status::INVALID_ARGS, 0));
        }
        let mut extras = &req.extras[..];
        let _flags = extras.get_u32();
        let ttl = ttl_from_binary_expiry(extras.get_u32());

        // A nonzero request cas turns any storage op into a CAS store.
        let result = if req.cas > 0 {
            self.cache
                .cas(req.key.clone(), req.value.clone(), ttl, req.cas)
                .await
        } else {
            match req.opcode {
                opcode::SET => self.cache.set(req.key.clone(), req.value.clone(), ttl).await,
                opcode::ADD => self.cache.add(req.key.clone(), req.value.clone(), ttl).await,
                _ => {
                    self.cache
                        .replace(req.key.clone(), req.value.clone(), ttl)
                        .await
                }
            }
        };

        let out = match result {
            Ok(cas) => simple_response(&req, status::SUCCESS, cas),
            Err(e) => simple_response(&req, status_for(&e), 0),
        };
        Outcome::reply(out)
    }

    async fn binary_get(&self, req: BinaryRequest, with_key: bool) -> Outcome {
        let quiet = matches!(req.opcode, opcode::GETQ | opcode::GETKQ);
        match self.cache.get(req.key.clone()).await {
            Ok((value, cas)) => {
                let mut out = Vec::new();
                let key: &[u8] = if with_key { &req.key } else { &[] };
                binary::write_response(
                    &mut out,
                    req.opcode,
                    req.opaque,
                    status::SUCCESS,
                    &[0; 4], // flags
                    key,
                    &value,
                    cas,
                );
                Outcome::reply(out)
            }
            Err(_) if quiet => Outcome::reply(Vec::new()),
            Err(_) => Outcome::reply(simple_response(&req, status::KEY_NOT_FOUND, 0)),
        }
    }

    async fn binary_incr_decr(&self, req: BinaryRequest) -> Outcome {
        if req.extras.len() < 20 {
            return Outcome::reply(simple_response(&req, status::INVALID_ARGS, 0));
        }
        let mut extras = &req.extras[..];
        let delta = extras.get_u64();
        let initial = extras.get_u64();
        let expiry = extras.get_u32();
        let incr = req.opcode == opcode::INCREMENT;

        let result = if incr {
            self.cache.increment(req.key.clone(), delta).await
        } else {
            self.cache.decrement(req.key.clone(), delta).await
        };

        let (new_value, cas) = match result {
            Ok(pair) => pair,
            Err(CacheError::KeyNotFound) => {
                // 0xffffffff forbids creating the counter.
                if expiry == u32::MAX {
                    return Outcome::reply(simple_response(&req, status::KEY_NOT_FOUND, 0));
                }
                let ttl = ttl_from_binary_expiry(expiry);
                let seed = Bytes::from(initial.to_string());
                match self.cache.set(req.key.clone(), seed, ttl).await {
                    Ok(cas) => (initial, cas),
                    Err(_) => {
                        return Outcome::reply(simple_response(&req, status::NOT_STORED, 0))
                    }
                }
            }
            Err(_) => return Outcome::reply(simple_response(&req, status::INVALID_ARGS, 0)),
        };

        let mut out = Vec::new();
        binary::write_response(
            &mut out,
            req.opcode,
            req.opaque,
            status::SUCCESS,
            &[],
            &[],
            &new_value.to_be_bytes(),
            cas,
        );
        Outcome::reply(out)
    }

    async fn binary_append_prepend(&self, req: BinaryRequest) -> Outcome {
        if !req.extras.is_empty() {
            return Outcome::reply(simple_response(&req, status::INVALID_ARGS, 0));
        }
        let result = if req.opcode == opcode::APPEND {
            self.cache.append(req.key.clone(), req.value.clone()).await
        } else {
            self.cache.prepend(req.key.clone(), req.value.clone()).await
        };
        let out = match result {
            Ok(cas) => simple_response(&req, status::SUCCESS, cas),
            Err(CacheError::ValueTooLarge) => {
                simple_response(&req, status::VALUE_TOO_LARGE, 0)
            }
            Err(_) => simple_response(&req, status::NOT_STORED, 0),
        };
        Outcome::reply(out)
    }

    async fn binary_get_and_touch(&self, req: BinaryRequest, with_key: bool) -> Outcome {
        if req.extras.len() != 4 {
            return Outcome::reply(simple_response(&req, status::INVALID_ARGS, 0));
        }
        let ttl = ttl_from_binary_expiry((&req.extras[..]).get_u32());

        let Ok(cas) = self.cache.touch(req.key.clone(), ttl).await else {
            return Outcome::reply(simple_response(&req, status::KEY_NOT_FOUND, 0));
        };
        let Ok((value, _)) = self.cache.get(req.key.clone()).await else {
            return Outcome::reply(simple_response(&req, status::KEY_NOT_FOUND, 0));
        };

        let mut out = Vec::new();
        let key: &[u8] = if with_key { &req.key } else { &[] };
        binary::write_response(
            &mut out,
            req.opcode,
            req.opaque,
            status::SUCCESS,
            &[0; 4],
            key,
            &value,
            cas,
        );
        Outcome::reply(out)
    }
}

/// Renders a header-only binary response.
fn simple_response(req: &BinaryRequest, status: u16, cas: u64) -> Vec<u8> {
    let mut out = Vec::new();
    binary::write_response(&mut out, req.opcode, req.opaque, status, &[], &[], &[], cas);
    out
}

fn status_for(e: &CacheError) -> u16 {
    match e {
        CacheError::KeyNotFound => status::KEY_NOT_FOUND,
        CacheError::KeyExists | CacheError::CasMismatch => status::KEY_EXISTS,
        CacheError::ValueTooLarge | CacheError::KeyTooLarge => status::VALUE_TOO_LARGE,
        CacheError::NotNumeric => status::INVALID_ARGS,
        _ => status::NOT_STORED,
    }
}

fn server_error(e: &CacheError) -> Vec<u8> {
    format!("SERVER_ERROR {}\r\n", e).into_bytes()
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Converts a text protocol exptime into an engine TTL.
fn ttl_from_exptime(exptime: i64) -> Duration {
    if exptime < 0 {
        // Already expired.
        return Duration::from_nanos(1);
    }
    if exptime == 0 {
        return Duration::ZERO;
    }
    if exptime > RELATIVE_EXPTIME_LIMIT {
        let remaining = exptime - unix_now_secs();
        if remaining <= 0 {
            return Duration::from_nanos(1);
        }
        return Duration::from_secs(remaining as u64);
    }
    Duration::from_secs(exptime as u64)
}

/// Converts a binary protocol expiry (u32 seconds) into an engine TTL.
fn ttl_from_binary_expiry(expiry: u32) -> Duration {
    ttl_from_exptime(expiry as i64)
}
