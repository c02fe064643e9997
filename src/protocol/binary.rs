//! Memcached Binary Protocol
//!
//! Codec for the 24-byte-header binary protocol. Requests start with
//! magic `0x80`, responses with `0x81`; all header integers are
//! big-endian. The body is `extras ++ key ++ value`, with the extras and
//! key lengths taken from the header.
//!
//! ```text
//! offset  size  request field        response field
//! 0       1     magic 0x80           magic 0x81
//! 1       1     opcode               opcode
//! 2       2     key length           key length
//! 4       1     extras length        extras length
//! 5       1     data type            data type
//! 6       2     vbucket id           status
//! 8       4     total body length    total body length
//! 12      4     opaque               opaque
//! 16      8     cas                  cas
//! ```

use bytes::{Buf, Bytes};
use thiserror::Error;

/// Request magic byte; also what the connection layer sniffs on.
pub const REQ_MAGIC: u8 = 0x80;

/// Response magic byte.
pub const RES_MAGIC: u8 = 0x81;

/// Header size for both directions.
pub const HEADER_SIZE: usize = 24;

/// Upper bound on a request body; covers the largest storable value.
pub const MAX_BODY_SIZE: usize = 65 * 1024 * 1024;

/// Binary protocol opcodes.
pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const QUIT: u8 = 0x07;
    pub const FLUSH: u8 = 0x08;
    pub const GETQ: u8 = 0x09;
    pub const NOOP: u8 = 0x0a;
    pub const VERSION: u8 = 0x0b;
    pub const GETK: u8 = 0x0c;
    pub const GETKQ: u8 = 0x0d;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const STAT: u8 = 0x10;
    pub const TOUCH: u8 = 0x1c;
    pub const GAT: u8 = 0x1d;
    pub const GATK: u8 = 0x1e;
}

/// Binary protocol response status codes.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EXISTS: u16 = 0x0002;
    pub const VALUE_TOO_LARGE: u16 = 0x0003;
    pub const INVALID_ARGS: u16 = 0x0004;
    pub const NOT_STORED: u16 = 0x0005;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
}

/// Unrecoverable binary protocol failures; the connection is closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BinaryError {
    #[error("invalid request magic: {0:#04x}")]
    InvalidMagic(u8),

    #[error("request body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("extras and key lengths exceed body length")]
    MalformedBody,
}

/// A fully framed binary request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequest {
    pub opcode: u8,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

/// Attempts to frame one binary request from `buf`.
///
/// Same incremental contract as the text parser: `Ok(None)` means the
/// header or body is still incomplete.
pub fn parse(buf: &[u8]) -> Result<Option<(BinaryRequest, usize)>, BinaryError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &buf[..HEADER_SIZE];
    let magic = header.get_u8();
    if magic != REQ_MAGIC {
        return Err(BinaryError::InvalidMagic(magic));
    }
    let opcode = header.get_u8();
    let key_len = header.get_u16() as usize;
    let extras_len = header.get_u8() as usize;
    let _data_type = header.get_u8();
    let _vbucket = header.get_u16();
    let body_len = header.get_u32() as usize;
    let opaque = header.get_u32();
    let cas = header.get_u64();

    if body_len > MAX_BODY_SIZE {
        return Err(BinaryError::BodyTooLarge(body_len));
    }
    if extras_len + key_len > body_len {
        return Err(BinaryError::MalformedBody);
    }

    let total = HEADER_SIZE + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[HEADER_SIZE..total];
    let extras = Bytes::copy_from_slice(&body[..extras_len]);
    let key = Bytes::copy_from_slice(&body[extras_len..extras_len + key_len]);
    let value = Bytes::copy_from_slice(&body[extras_len + key_len..]);

    Ok(Some((
        BinaryRequest {
            opcode,
            opaque,
            cas,
            extras,
            key,
            value,
        },
        total,
    )))
}

/// Appends a complete binary response to `out`.
pub fn write_response(
    out: &mut Vec<u8>,
    opcode: u8,
    opaque: u32,
    status: u16,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    cas: u64,
) {
    let body_len = (extras.len() + key.len() + value.len()) as u32;
    out.reserve(HEADER_SIZE + body_len as usize);
    out.push(RES_MAGIC);
    out.push(opcode);
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0); // data type
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&cas.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}
