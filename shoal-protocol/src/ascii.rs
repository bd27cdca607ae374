//! ASCII dialect: command encoding and response parsing.
//!
//! Commands are newline-terminated text with space-separated fields:
//!
//! - `get <key>\r\n` / `gets <key1> <key2> ...\r\n`
//! - `<storage> <key> <flags> <exptime> <bytes>\r\n<data>\r\n`
//! - `incr <key> <delta>\r\n` / `decr <key> <delta>\r\n`
//! - `delete <key>\r\n`
//! - `touch <key> <exptime>\r\n`
//! - `flush_all <expiration>\r\n`
//! - `version\r\n`
//!
//! Responses are a closed line vocabulary plus the multi-line
//! `VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\n ... END\r\n` form.

use std::io::Write;

use crate::error::ParseError;

/// Maximum accepted value data size (1 MiB, memcached's default item limit).
const MAX_VALUE_DATA_LEN: usize = 1024 * 1024;

/// A single ASCII-dialect command, borrowed from the caller's operation.
#[derive(Debug, Clone)]
pub enum AsciiRequest<'a> {
    Get {
        key: &'a [u8],
    },
    /// Multi-key retrieval with CAS tokens.
    Gets {
        keys: &'a [&'a [u8]],
    },
    Set {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
    },
    Add {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
    },
    Replace {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
    },
    Append {
        key: &'a [u8],
        value: &'a [u8],
    },
    Prepend {
        key: &'a [u8],
        value: &'a [u8],
    },
    Cas {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
        cas: u64,
    },
    Delete {
        key: &'a [u8],
    },
    Incr {
        key: &'a [u8],
        delta: u64,
    },
    Decr {
        key: &'a [u8],
        delta: u64,
    },
    Touch {
        key: &'a [u8],
        exptime: u32,
    },
    /// `flush_all <expiration>` - the expiration is always written, with 0
    /// meaning "flush immediately".
    FlushAll {
        expiration: u32,
    },
    Version,
}

impl<'a> AsciiRequest<'a> {
    /// Append this command's wire bytes to `buf`.
    ///
    /// Encoding is a pure function of the request, so re-encoding a
    /// duplicated request for a retry produces identical bytes.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            AsciiRequest::Get { key } => {
                buf.extend_from_slice(b"get ");
                buf.extend_from_slice(key);
                buf.extend_from_slice(b"\r\n");
            }
            AsciiRequest::Gets { keys } => {
                buf.extend_from_slice(b"gets");
                for key in *keys {
                    buf.push(b' ');
                    buf.extend_from_slice(key);
                }
                buf.extend_from_slice(b"\r\n");
            }
            AsciiRequest::Set {
                key,
                value,
                flags,
                exptime,
            } => encode_storage(buf, b"set", key, value, *flags, *exptime),
            AsciiRequest::Add {
                key,
                value,
                flags,
                exptime,
            } => encode_storage(buf, b"add", key, value, *flags, *exptime),
            AsciiRequest::Replace {
                key,
                value,
                flags,
                exptime,
            } => encode_storage(buf, b"replace", key, value, *flags, *exptime),
            AsciiRequest::Append { key, value } => encode_storage(buf, b"append", key, value, 0, 0),
            AsciiRequest::Prepend { key, value } => {
                encode_storage(buf, b"prepend", key, value, 0, 0)
            }
            AsciiRequest::Cas {
                key,
                value,
                flags,
                exptime,
                cas,
            } => {
                buf.extend_from_slice(b"cas ");
                buf.extend_from_slice(key);
                write!(buf, " {} {} {} {}\r\n", flags, exptime, value.len(), cas).unwrap();
                buf.extend_from_slice(value);
                buf.extend_from_slice(b"\r\n");
            }
            AsciiRequest::Delete { key } => {
                buf.extend_from_slice(b"delete ");
                buf.extend_from_slice(key);
                buf.extend_from_slice(b"\r\n");
            }
            AsciiRequest::Incr { key, delta } => encode_arith(buf, b"incr", key, *delta),
            AsciiRequest::Decr { key, delta } => encode_arith(buf, b"decr", key, *delta),
            AsciiRequest::Touch { key, exptime } => {
                buf.extend_from_slice(b"touch ");
                buf.extend_from_slice(key);
                write!(buf, " {}\r\n", exptime).unwrap();
            }
            AsciiRequest::FlushAll { expiration } => {
                write!(buf, "flush_all {}\r\n", expiration).unwrap();
            }
            AsciiRequest::Version => buf.extend_from_slice(b"version\r\n"),
        }
    }
}

/// `<cmd> <key> <flags> <exptime> <bytes>\r\n<data>\r\n` - shared by all
/// storage commands.
fn encode_storage(
    buf: &mut Vec<u8>,
    cmd: &[u8],
    key: &[u8],
    value: &[u8],
    flags: u32,
    exptime: u32,
) {
    buf.extend_from_slice(cmd);
    buf.push(b' ');
    buf.extend_from_slice(key);
    write!(buf, " {} {} {}\r\n", flags, exptime, value.len()).unwrap();
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// `<cmd> <key> <delta>\r\n` for incr/decr.
fn encode_arith(buf: &mut Vec<u8>, cmd: &[u8], key: &[u8], delta: u64) {
    buf.extend_from_slice(cmd);
    buf.push(b' ');
    buf.extend_from_slice(key);
    write!(buf, " {}\r\n", delta).unwrap();
}

/// A single retrieved item from a VALUE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiValue {
    pub key: Vec<u8>,
    pub flags: u32,
    pub data: Vec<u8>,
    /// CAS token, present when the server answered a `gets` command.
    pub cas: Option<u64>,
}

/// One parsed server response line/frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsciiResponse {
    /// Zero or more VALUE items terminated by END. Empty means cache miss.
    Values(Vec<AsciiValue>),
    Stored,
    NotStored,
    Deleted,
    NotFound,
    Exists,
    Touched,
    Ok,
    /// New counter value from incr/decr.
    Numeric(u64),
    Version(Vec<u8>),
    Error,
    ClientError(Vec<u8>),
    ServerError(Vec<u8>),
}

impl AsciiResponse {
    /// Parse one complete response from `data`.
    ///
    /// Returns the response and the number of bytes consumed, or
    /// [`ParseError::Incomplete`] if a full frame is not yet buffered.
    /// Response text outside the closed vocabulary is a protocol violation.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let line_end = find_crlf(data).ok_or(ParseError::Incomplete)?;
        let line = &data[..line_end];
        let consumed = line_end + 2;

        let response = match line {
            b"STORED" => AsciiResponse::Stored,
            b"NOT_STORED" => AsciiResponse::NotStored,
            b"DELETED" => AsciiResponse::Deleted,
            b"NOT_FOUND" => AsciiResponse::NotFound,
            b"EXISTS" => AsciiResponse::Exists,
            b"TOUCHED" => AsciiResponse::Touched,
            b"OK" => AsciiResponse::Ok,
            b"END" => AsciiResponse::Values(Vec::new()),
            b"ERROR" => AsciiResponse::Error,
            _ => {
                if let Some(msg) = line.strip_prefix(b"CLIENT_ERROR ".as_slice()) {
                    AsciiResponse::ClientError(msg.to_vec())
                } else if let Some(msg) = line.strip_prefix(b"SERVER_ERROR ".as_slice()) {
                    AsciiResponse::ServerError(msg.to_vec())
                } else if let Some(v) = line.strip_prefix(b"VERSION ".as_slice()) {
                    AsciiResponse::Version(v.to_vec())
                } else if line.starts_with(b"VALUE ") {
                    return parse_values(data);
                } else if !line.is_empty() && line.iter().all(|b| b.is_ascii_digit()) {
                    AsciiResponse::Numeric(parse_u64(line)?)
                } else {
                    return Err(ParseError::Protocol("unknown response line"));
                }
            }
        };

        Ok((response, consumed))
    }
}

/// Parse `VALUE ...` items until the END terminator.
fn parse_values(data: &[u8]) -> Result<(AsciiResponse, usize), ParseError> {
    let mut values = Vec::new();
    let mut pos = 0;

    loop {
        let rest = &data[pos..];
        let line_end = find_crlf(rest).ok_or(ParseError::Incomplete)?;
        let line = &rest[..line_end];

        if line == b"END" {
            pos += line_end + 2;
            return Ok((AsciiResponse::Values(values), pos));
        }

        let header = line
            .strip_prefix(b"VALUE ".as_slice())
            .ok_or(ParseError::Protocol("expected VALUE or END"))?;

        // VALUE <key> <flags> <bytes> [<cas>]
        let mut fields = header.split(|&b| b == b' ');
        let key = fields.next().filter(|k| !k.is_empty());
        let flags = fields.next();
        let bytes = fields.next();
        let (key, flags, bytes) = match (key, flags, bytes) {
            (Some(k), Some(f), Some(b)) => (k, f, b),
            _ => return Err(ParseError::Protocol("short VALUE line")),
        };
        let cas = fields.next().map(parse_u64).transpose()?;

        let flags = parse_u32(flags)?;
        let len = parse_u64(bytes)? as usize;
        if len > MAX_VALUE_DATA_LEN {
            return Err(ParseError::Protocol("value data too large"));
        }

        pos += line_end + 2;
        let data_end = pos + len;
        if data.len() < data_end + 2 {
            return Err(ParseError::Incomplete);
        }
        if &data[data_end..data_end + 2] != b"\r\n" {
            return Err(ParseError::Protocol("missing data terminator"));
        }

        values.push(AsciiValue {
            key: key.to_vec(),
            flags,
            data: data[pos..data_end].to_vec(),
            cas,
        });
        pos = data_end + 2;
    }
}

/// Position of `\r` in the first CRLF pair, if fully buffered.
fn find_crlf(data: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = memchr::memchr(b'\r', &data[from..]) {
        let pos = from + pos;
        if pos + 1 < data.len() {
            if data[pos + 1] == b'\n' {
                return Some(pos);
            }
            from = pos + 1;
        } else {
            return None;
        }
    }
    None
}

fn parse_u32(data: &[u8]) -> Result<u32, ParseError> {
    std::str::from_utf8(data)
        .map_err(|_| ParseError::InvalidNumber)?
        .parse()
        .map_err(|_| ParseError::InvalidNumber)
}

fn parse_u64(data: &[u8]) -> Result<u64, ParseError> {
    std::str::from_utf8(data)
        .map_err(|_| ParseError::InvalidNumber)?
        .parse()
        .map_err(|_| ParseError::InvalidNumber)
}
