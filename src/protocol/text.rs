//! Memcached Text Protocol
//!
//! Incremental parser for the classic line-based memcached protocol plus
//! the canned response fragments the command layer writes back.
//!
//! ## Parser contract
//!
//! The parser reads from a caller-owned buffer and returns:
//! - `Ok(Some((item, consumed)))` - a complete command (or a parse-level
//!   error response) was recognized and `consumed` bytes are done with
//! - `Ok(None)` - the buffer holds an incomplete command, read more
//! - `Err(e)` - the stream is unrecoverable and the connection closes
//!
//! Malformed-but-framed commands do not kill the connection: they come
//! back as [`TextItem::Reply`] carrying the `CLIENT_ERROR`/`ERROR` line
//! to send, matching how memcached keeps the session alive. Storage
//! commands whose payload exceeds the item size limit are swallowed
//! whole (the data block is consumed) before the `SERVER_ERROR` reply,
//! so the stream stays in sync.

use bytes::Bytes;
use thiserror::Error;

/// Largest accepted value in a text storage command (memcached's default
/// item size limit).
pub const MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Hard cap on a single command line.
pub const MAX_LINE_LENGTH: usize = 2 * 1024;

/// Unrecoverable text protocol failures; the connection is closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TextError {
    /// No line terminator within [`MAX_LINE_LENGTH`] bytes.
    #[error("command line too long")]
    LineTooLong,

    /// A storage command announced a payload too large to ever buffer.
    #[error("data block too large to buffer: {0} bytes")]
    DataTooLarge(usize),
}

/// Storage-family verbs that share one command shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// A parsed text protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextCommand {
    /// `set/add/replace/append/prepend <key> <flags> <exptime> <bytes>`
    Storage {
        verb: StorageVerb,
        key: Bytes,
        exptime: i64,
        data: Bytes,
        noreply: bool,
    },
    /// `cas <key> <flags> <exptime> <bytes> <cas unique>`
    CasStore {
        key: Bytes,
        exptime: i64,
        data: Bytes,
        cas: u64,
        noreply: bool,
    },
    /// `get`/`gets` with one or more keys.
    Get { keys: Vec<Bytes>, with_cas: bool },
    /// `gat`/`gats <exptime> <key>+` (get and touch).
    GetAndTouch {
        exptime: i64,
        keys: Vec<Bytes>,
        with_cas: bool,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    IncrDecr {
        key: Bytes,
        delta: u64,
        incr: bool,
        noreply: bool,
    },
    Touch {
        key: Bytes,
        exptime: i64,
        noreply: bool,
    },
    FlushAll {
        noreply: bool,
    },
    Stats,
    Version,
    /// `verbosity` is accepted and ignored.
    Verbosity,
    Quit,
}

/// One unit of parser output: either a command to execute or a canned
/// reply for a request that failed at the protocol level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextItem {
    Command(TextCommand),
    Reply(&'static [u8]),
}

/// Canned response lines shared by the parser and the command layer.
pub mod reply {
    pub const STORED: &[u8] = b"STORED\r\n";
    pub const NOT_STORED: &[u8] = b"NOT_STORED\r\n";
    pub const EXISTS: &[u8] = b"EXISTS\r\n";
    pub const NOT_FOUND: &[u8] = b"NOT_FOUND\r\n";
    pub const DELETED: &[u8] = b"DELETED\r\n";
    pub const TOUCHED: &[u8] = b"TOUCHED\r\n";
    pub const OK: &[u8] = b"OK\r\n";
    pub const END: &[u8] = b"END\r\n";
    pub const ERROR: &[u8] = b"ERROR\r\n";
    pub const BAD_FORMAT: &[u8] = b"CLIENT_ERROR bad command line format\r\n";
    pub const BAD_DELTA: &[u8] = b"CLIENT_ERROR invalid numeric delta argument\r\n";
    pub const NOT_NUMERIC: &[u8] =
        b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n";
    pub const TOO_LARGE: &[u8] = b"SERVER_ERROR object too large for cache\r\n";
}

/// Attempts to parse one command from `buf`.
pub fn parse(buf: &[u8]) -> Result<Option<(TextItem, usize)>, TextError> {
    let Some(line_end) = find_line_end(buf)? else {
        return Ok(None);
    };
    let line = trim(&buf[..line_end]);
    let consumed = line_end + 1; // through the '\n'

    let parts: Vec<&[u8]> = line.split(|&b| b == b' ').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        // Blank line: skip it silently, like a trimmed-empty read.
        return Ok(Some((TextItem::Reply(b""), consumed)));
    }

    let verb = parts[0];
    if let Some(storage_verb) = storage_verb(verb) {
        return parse_storage(buf, consumed, &parts, storage_verb);
    }
    if verb.eq_ignore_ascii_case(b"cas") {
        return parse_cas(buf, consumed, &parts);
    }

    let item = if verb.eq_ignore_ascii_case(b"get") || verb.eq_ignore_ascii_case(b"gets") {
        parse_get(&parts, verb.eq_ignore_ascii_case(b"gets"))
    } else if verb.eq_ignore_ascii_case(b"gat") || verb.eq_ignore_ascii_case(b"gats") {
        parse_gat(&parts, verb.eq_ignore_ascii_case(b"gats"))
    } else if verb.eq_ignore_ascii_case(b"delete") {
        parse_delete(&parts)
    } else if verb.eq_ignore_ascii_case(b"incr") || verb.eq_ignore_ascii_case(b"decr") {
        parse_incr_decr(&parts, verb.eq_ignore_ascii_case(b"incr"))
    } else if verb.eq_ignore_ascii_case(b"touch") {
        parse_touch(&parts)
    } else if verb.eq_ignore_ascii_case(b"flush_all") {
        TextItem::Command(TextCommand::FlushAll {
            noreply: has_noreply(&parts[1..]),
        })
    } else if verb.eq_ignore_ascii_case(b"stats") {
        TextItem::Command(TextCommand::Stats)
    } else if verb.eq_ignore_ascii_case(b"version") {
        TextItem::Command(TextCommand::Version)
    } else if verb.eq_ignore_ascii_case(b"verbosity") {
        TextItem::Command(TextCommand::Verbosity)
    } else if verb.eq_ignore_ascii_case(b"quit") {
        TextItem::Command(TextCommand::Quit)
    } else {
        TextItem::Reply(reply::ERROR)
    };

    Ok(Some((item, consumed)))
}

fn storage_verb(verb: &[u8]) -> Option<StorageVerb> {
    if verb.eq_ignore_ascii_case(b"set") {
        Some(StorageVerb::Set)
    } else if verb.eq_ignore_ascii_case(b"add") {
        Some(StorageVerb::Add)
    } else if verb.eq_ignore_ascii_case(b"replace") {
        Some(StorageVerb::Replace)
    } else if verb.eq_ignore_ascii_case(b"append") {
        Some(StorageVerb::Append)
    } else if verb.eq_ignore_ascii_case(b"prepend") {
        Some(StorageVerb::Prepend)
    } else {
        None
    }
}

/// `<verb> <key> <flags> <exptime> <bytes> [noreply]` + data block.
fn parse_storage(
    buf: &[u8],
    line_consumed: usize,
    parts: &[&[u8]],
    verb: StorageVerb,
) -> Result<Option<(TextItem, usize)>, TextError> {
    if parts.len() < 5 {
        return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), line_consumed)));
    }

    // Flags and exptime must be numeric even though flags are not stored.
    // Append/prepend skip that validation, as the original server does.
    let exptime = match verb {
        StorageVerb::Append | StorageVerb::Prepend => 0,
        _ => {
            if parse_u32(parts[2]).is_none() {
                return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), line_consumed)));
            }
            match parse_i64(parts[3]) {
                Some(v) => v,
                None => {
                    return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), line_consumed)))
                }
            }
        }
    };

    let Some(bytes) = parse_usize(parts[4]) else {
        return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), line_consumed)));
    };
    let noreply = has_noreply(&parts[5..]);

    let Some((data, total)) = take_data_block(buf, line_consumed, bytes)? else {
        return Ok(None);
    };

    if bytes > MAX_ITEM_SIZE {
        // Data was consumed above to keep the stream in sync.
        return Ok(Some((TextItem::Reply(reply::TOO_LARGE), total)));
    }

    let key = Bytes::copy_from_slice(parts[1]);
    Ok(Some((
        TextItem::Command(TextCommand::Storage {
            verb,
            key,
            exptime,
            data,
            noreply,
        }),
        total,
    )))
}

/// `cas <key> <flags> <exptime> <bytes> <cas unique> [noreply]` + data.
fn parse_cas(
    buf: &[u8],
    line_consumed: usize,
    parts: &[&[u8]],
) -> Result<Option<(TextItem, usize)>, TextError> {
    if parts.len() < 5 {
        return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), line_consumed)));
    }
    let flags_ok = parse_u32(parts[2]).is_some();
    let exptime = parse_i64(parts[3]);
    let Some(bytes) = parse_usize(parts[4]) else {
        return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), line_consumed)));
    };

    // The data block is always consumed, even when the line is bad, so
    // the next command starts at a clean boundary.
    let Some((data, total)) = take_data_block(buf, line_consumed, bytes)? else {
        return Ok(None);
    };

    if bytes > MAX_ITEM_SIZE {
        return Ok(Some((TextItem::Reply(reply::TOO_LARGE), total)));
    }

    let (Some(exptime), true) = (exptime, flags_ok) else {
        return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), total)));
    };
    let Some(cas) = parts.get(5).and_then(|p| parse_u64(p)) else {
        return Ok(Some((TextItem::Reply(reply::BAD_FORMAT), total)));
    };
    let noreply = has_noreply(&parts[6..]);

    Ok(Some((
        TextItem::Command(TextCommand::CasStore {
            key: Bytes::copy_from_slice(parts[1]),
            exptime,
            data,
            cas,
            noreply,
        }),
        total,
    )))
}

fn parse_get(parts: &[&[u8]], with_cas: bool) -> TextItem {
    if parts.len() < 2 {
        return TextItem::Reply(reply::ERROR);
    }
    let keys = parts[1..].iter().map(|k| Bytes::copy_from_slice(k)).collect();
    TextItem::Command(TextCommand::Get { keys, with_cas })
}

fn parse_gat(parts: &[&[u8]], with_cas: bool) -> TextItem {
    if parts.len() < 3 {
        return TextItem::Reply(reply::ERROR);
    }
    let Some(exptime) = parse_i64(parts[1]) else {
        return TextItem::Reply(reply::BAD_FORMAT);
    };
    let keys = parts[2..].iter().map(|k| Bytes::copy_from_slice(k)).collect();
    TextItem::Command(TextCommand::GetAndTouch {
        exptime,
        keys,
        with_cas,
    })
}

fn parse_delete(parts: &[&[u8]]) -> TextItem {
    if parts.len() < 2 {
        return TextItem::Reply(reply::BAD_FORMAT);
    }
    TextItem::Command(TextCommand::Delete {
        key: Bytes::copy_from_slice(parts[1]),
        noreply: has_noreply(&parts[2..]),
    })
}

fn parse_incr_decr(parts: &[&[u8]], incr: bool) -> TextItem {
    if parts.len() < 3 {
        return TextItem::Reply(reply::BAD_FORMAT);
    }
    let Some(delta) = parse_u64(parts[2]) else {
        return TextItem::Reply(reply::BAD_DELTA);
    };
    TextItem::Command(TextCommand::IncrDecr {
        key: Bytes::copy_from_slice(parts[1]),
        delta,
        incr,
        noreply: has_noreply(&parts[3..]),
    })
}

fn parse_touch(parts: &[&[u8]]) -> TextItem {
    if parts.len() < 3 {
        return TextItem::Reply(reply::BAD_FORMAT);
    }
    let Some(exptime) = parse_i64(parts[2]) else {
        return TextItem::Reply(reply::BAD_FORMAT);
    };
    TextItem::Command(TextCommand::Touch {
        key: Bytes::copy_from_slice(parts[1]),
        exptime,
        noreply: has_noreply(&parts[3..]),
    })
}

/// Writes one `VALUE` block of a get/gets response.
pub fn write_value(out: &mut Vec<u8>, key: &[u8], data: &[u8], cas: Option<u64>) {
    out.extend_from_slice(b"VALUE ");
    out.extend_from_slice(key);
    out.extend_from_slice(b" 0 ");
    out.extend_from_slice(data.len().to_string().as_bytes());
    if let Some(cas) = cas {
        out.push(b' ');
        out.extend_from_slice(cas.to_string().as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Writes one `STAT <name> <value>` line.
pub fn write_stat(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(b"STAT ");
    out.extend_from_slice(name.as_bytes());
    out.push(b' ');
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Locates the `\n` terminating the first line, enforcing the length cap.
fn find_line_end(buf: &[u8]) -> Result<Option<usize>, TextError> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(pos) if pos > MAX_LINE_LENGTH => Err(TextError::LineTooLong),
        Some(pos) => Ok(Some(pos)),
        None if buf.len() > MAX_LINE_LENGTH => Err(TextError::LineTooLong),
        None => Ok(None),
    }
}

/// Extracts the `<bytes>` data block following a storage command line.
///
/// Returns `Ok(None)` while the block (plus its trailing CRLF) is not yet
/// fully buffered. Payloads that could never fit a connection buffer are
/// rejected outright.
fn take_data_block(
    buf: &[u8],
    line_consumed: usize,
    bytes: usize,
) -> Result<Option<(Bytes, usize)>, TextError> {
    if bytes > 4 * MAX_ITEM_SIZE {
        return Err(TextError::DataTooLarge(bytes));
    }
    let mut total = line_consumed + bytes;
    if buf.len() < total {
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&buf[line_consumed..total]);
    // Swallow the terminating CRLF (or lone LF) after the payload.
    if buf.get(total) == Some(&b'\r') {
        total += 1;
    }
    match buf.get(total) {
        Some(&b'\n') => total += 1,
        Some(_) => {}
        None => return Ok(None),
    }
    Ok(Some((data, total)))
}

fn has_noreply(parts: &[&[u8]]) -> bool {
    parts.iter().any(|p| p.eq_ignore_ascii_case(b"noreply"))
}

fn trim(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &line[s..=e],
        _ => &[],
    }
}

fn parse_u32(s: &[u8]) -> Option<u32> {
    std::str::from_utf8(s).ok()?.parse().ok()
}

fn parse_u64(s: &[u8]) -> Option<u64> {
    std::str::from_utf8(s).ok()?.parse().ok()
}

fn parse_i64(s: &[u8]) -> Option<i64> {
    std::str::from_utf8(s).ok()?.parse().ok()
}

fn parse_usize(s: &[u8]) -> Option<usize> {
    std::str::from_utf8(s).ok()?.parse().ok()
}
