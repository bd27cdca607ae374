//! Operations, in-flight requests, and response interpretation.
//!
//! An [`Operation`] is the caller's intent, immutable once submitted and
//! cheap to clone. A [`Request`] binds an operation to a dialect and knows
//! how to encode itself and how to interpret the one response frame the
//! server will send back for it. Responses carry no correlation ids, so
//! interpretation always runs against the oldest in-flight request.

use bytes::Bytes;

use shoal_protocol::ascii::{AsciiRequest, AsciiResponse, AsciiValue};
use shoal_protocol::binary::{
    BinaryRequest, BinaryResponse, Opcode, STATUS_AUTH_ERROR, STATUS_NO_ERROR,
};
use shoal_protocol::{MemcacheStatus, ParseError, ttl_to_expiration};

use crate::config::Dialect;
use crate::error::Error;

/// A logical memcache operation.
#[derive(Debug, Clone)]
pub enum Operation {
    Get {
        key: Bytes,
    },
    /// Single-key retrieval that also yields the CAS token.
    GetWithCas {
        key: Bytes,
    },
    /// Multi-key retrieval with CAS tokens, ascii dialect only. The
    /// binary dialect decomposes multi-gets into [`Operation::GetWithCas`]
    /// before submission.
    Gets {
        keys: Vec<Bytes>,
    },
    Set {
        key: Bytes,
        value: Bytes,
        flags: u32,
        ttl: i64,
    },
    Add {
        key: Bytes,
        value: Bytes,
        flags: u32,
        ttl: i64,
    },
    Replace {
        key: Bytes,
        value: Bytes,
        flags: u32,
        ttl: i64,
    },
    Append {
        key: Bytes,
        value: Bytes,
    },
    Prepend {
        key: Bytes,
        value: Bytes,
    },
    Cas {
        key: Bytes,
        value: Bytes,
        flags: u32,
        ttl: i64,
        cas: u64,
    },
    Delete {
        key: Bytes,
    },
    Incr {
        key: Bytes,
        delta: u64,
    },
    Decr {
        key: Bytes,
        delta: u64,
    },
    Touch {
        key: Bytes,
        ttl: i64,
    },
    /// Broadcast to every ready shard. Negative or zero delay flushes
    /// immediately.
    FlushAll {
        delay: i64,
    },
    Version,
}

impl Operation {
    /// The key that decides shard placement, or `None` for operations
    /// that are broadcast or shard-agnostic.
    pub fn routing_key(&self) -> Option<&[u8]> {
        match self {
            Operation::Get { key }
            | Operation::GetWithCas { key }
            | Operation::Set { key, .. }
            | Operation::Add { key, .. }
            | Operation::Replace { key, .. }
            | Operation::Append { key, .. }
            | Operation::Prepend { key, .. }
            | Operation::Cas { key, .. }
            | Operation::Delete { key }
            | Operation::Incr { key, .. }
            | Operation::Decr { key, .. }
            | Operation::Touch { key, .. } => Some(key),
            Operation::Gets { keys } => keys.first().map(|k| k.as_ref()),
            Operation::FlushAll { .. } | Operation::Version => None,
        }
    }
}

/// A retrieved value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub data: Bytes,
    pub flags: u32,
}

/// A retrieved value with its key and CAS token, from `gets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetValue {
    pub key: Bytes,
    pub data: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// Caller-visible completion value. Misses are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(MemcacheStatus),
    Value(Option<Value>),
    Values(Vec<GetValue>),
    Counter(Option<u64>),
    Version(String),
}

/// One response frame, decoded but not yet interpreted.
#[derive(Debug)]
pub enum Decoded {
    Ascii(AsciiResponse),
    Binary(BinaryResponse),
}

/// Decode one frame in the given dialect.
///
/// Returns the decoded frame and bytes consumed, or
/// [`ParseError::Incomplete`] until a full frame is buffered.
pub fn try_decode(dialect: Dialect, data: &[u8]) -> Result<(Decoded, usize), ParseError> {
    match dialect {
        Dialect::Ascii => {
            AsciiResponse::parse(data).map(|(resp, used)| (Decoded::Ascii(resp), used))
        }
        Dialect::Binary => {
            BinaryResponse::parse(data).map(|(resp, used)| (Decoded::Binary(resp), used))
        }
    }
}

/// One in-flight exchange: an operation bound to a dialect.
#[derive(Debug, Clone)]
pub struct Request {
    pub op: Operation,
    pub dialect: Dialect,
}

impl Request {
    pub fn new(op: Operation, dialect: Dialect) -> Self {
        Self { op, dialect }
    }

    /// A fresh request carrying the same operation, for retry on another
    /// connection or fan-out across shards. Encoding is a pure function
    /// of the operation, so the duplicate produces identical wire bytes.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Append this request's wire bytes to `buf`.
    ///
    /// Fails with [`Error::Protocol`] for operations the dialect has no
    /// frame for, rather than writing anything to the buffer.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        match self.dialect {
            Dialect::Ascii => {
                self.encode_ascii(buf);
                Ok(())
            }
            Dialect::Binary => self.encode_binary(buf),
        }
    }

    fn encode_ascii(&self, buf: &mut Vec<u8>) {
        match &self.op {
            Operation::Get { key } => AsciiRequest::Get { key }.encode(buf),
            Operation::GetWithCas { key } => {
                let keys: [&[u8]; 1] = [key];
                AsciiRequest::Gets { keys: &keys }.encode(buf);
            }
            Operation::Gets { keys } => {
                let keys: Vec<&[u8]> = keys.iter().map(|k| k.as_ref()).collect();
                AsciiRequest::Gets { keys: &keys }.encode(buf);
            }
            Operation::Set {
                key,
                value,
                flags,
                ttl,
            } => AsciiRequest::Set {
                key,
                value,
                flags: *flags,
                exptime: ttl_to_expiration(*ttl),
            }
            .encode(buf),
            Operation::Add {
                key,
                value,
                flags,
                ttl,
            } => AsciiRequest::Add {
                key,
                value,
                flags: *flags,
                exptime: ttl_to_expiration(*ttl),
            }
            .encode(buf),
            Operation::Replace {
                key,
                value,
                flags,
                ttl,
            } => AsciiRequest::Replace {
                key,
                value,
                flags: *flags,
                exptime: ttl_to_expiration(*ttl),
            }
            .encode(buf),
            Operation::Append { key, value } => AsciiRequest::Append { key, value }.encode(buf),
            Operation::Prepend { key, value } => AsciiRequest::Prepend { key, value }.encode(buf),
            Operation::Cas {
                key,
                value,
                flags,
                ttl,
                cas,
            } => AsciiRequest::Cas {
                key,
                value,
                flags: *flags,
                exptime: ttl_to_expiration(*ttl),
                cas: *cas,
            }
            .encode(buf),
            Operation::Delete { key } => AsciiRequest::Delete { key }.encode(buf),
            Operation::Incr { key, delta } => AsciiRequest::Incr {
                key,
                delta: *delta,
            }
            .encode(buf),
            Operation::Decr { key, delta } => AsciiRequest::Decr {
                key,
                delta: *delta,
            }
            .encode(buf),
            Operation::Touch { key, ttl } => AsciiRequest::Touch {
                key,
                exptime: ttl_to_expiration(*ttl),
            }
            .encode(buf),
            Operation::FlushAll { delay } => AsciiRequest::FlushAll {
                expiration: ttl_to_expiration(*delay),
            }
            .encode(buf),
            Operation::Version => AsciiRequest::Version.encode(buf),
        }
    }

    fn encode_binary(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        match &self.op {
            Operation::Get { key } => BinaryRequest::Get { key }.encode(buf),
            Operation::GetWithCas { key } => BinaryRequest::GetK { key }.encode(buf),
            Operation::Gets { .. } => {
                // No multi-key frame in the binary dialect; the facade
                // decomposes multi-gets into per-key requests first.
                return Err(Error::Protocol(
                    "multi-get has no binary frame and must be decomposed per key".into(),
                ));
            }
            Operation::Set {
                key,
                value,
                flags,
                ttl,
            } => BinaryRequest::Set {
                key,
                value,
                flags: *flags,
                expiration: ttl_to_expiration(*ttl),
                cas: 0,
            }
            .encode(buf),
            Operation::Add {
                key,
                value,
                flags,
                ttl,
            } => BinaryRequest::Add {
                key,
                value,
                flags: *flags,
                expiration: ttl_to_expiration(*ttl),
            }
            .encode(buf),
            Operation::Replace {
                key,
                value,
                flags,
                ttl,
            } => BinaryRequest::Replace {
                key,
                value,
                flags: *flags,
                expiration: ttl_to_expiration(*ttl),
            }
            .encode(buf),
            Operation::Append { key, value } => BinaryRequest::Append { key, value }.encode(buf),
            Operation::Prepend { key, value } => BinaryRequest::Prepend { key, value }.encode(buf),
            Operation::Cas {
                key,
                value,
                flags,
                ttl,
                cas,
            } => BinaryRequest::Set {
                key,
                value,
                flags: *flags,
                expiration: ttl_to_expiration(*ttl),
                cas: *cas,
            }
            .encode(buf),
            Operation::Delete { key } => BinaryRequest::Delete { key }.encode(buf),
            Operation::Incr { key, delta } => BinaryRequest::Incr {
                key,
                delta: *delta,
            }
            .encode(buf),
            Operation::Decr { key, delta } => BinaryRequest::Decr {
                key,
                delta: *delta,
            }
            .encode(buf),
            Operation::Touch { key, ttl } => BinaryRequest::Touch {
                key,
                expiration: ttl_to_expiration(*ttl),
            }
            .encode(buf),
            Operation::FlushAll { delay } => BinaryRequest::Flush {
                expiration: ttl_to_expiration(*delay),
            }
            .encode(buf),
            Operation::Version => BinaryRequest::Version.encode(buf),
        }
        Ok(())
    }

    /// Interpret the response frame for this request.
    ///
    /// One cross-cutting rule precedes per-kind interpretation: a
    /// CLIENT_ERROR reply (or the binary auth-error status) to any normal
    /// command means the server demands authentication this connection
    /// does not have, and resolves as [`Error::Authentication`] no matter
    /// the operation kind. Everything else outside the kind's accepted
    /// set is a protocol error that desynchronizes the connection.
    pub fn interpret(&self, decoded: Decoded) -> Result<Reply, Error> {
        match decoded {
            Decoded::Ascii(resp) => self.interpret_ascii(resp),
            Decoded::Binary(resp) => self.interpret_binary(resp),
        }
    }

    fn interpret_ascii(&self, resp: AsciiResponse) -> Result<Reply, Error> {
        if let AsciiResponse::ClientError(msg) = &resp {
            return Err(Error::Authentication(format!(
                "server rejected command: {}",
                String::from_utf8_lossy(msg)
            )));
        }

        match (&self.op, resp) {
            (Operation::Get { .. }, AsciiResponse::Values(values)) => {
                Ok(Reply::Value(values.into_iter().next().map(|v| Value {
                    data: Bytes::from(v.data),
                    flags: v.flags,
                })))
            }
            (
                Operation::GetWithCas { .. } | Operation::Gets { .. },
                AsciiResponse::Values(values),
            ) => Ok(Reply::Values(
                values.into_iter().map(ascii_get_value).collect(),
            )),
            (
                Operation::Set { .. }
                | Operation::Add { .. }
                | Operation::Replace { .. }
                | Operation::Append { .. }
                | Operation::Prepend { .. }
                | Operation::Cas { .. },
                resp,
            ) => match resp {
                AsciiResponse::Stored => Ok(Reply::Status(MemcacheStatus::Ok)),
                AsciiResponse::NotStored => Ok(Reply::Status(MemcacheStatus::NotStored)),
                AsciiResponse::Exists => Ok(Reply::Status(MemcacheStatus::Exists)),
                AsciiResponse::NotFound => Ok(Reply::Status(MemcacheStatus::NotFound)),
                other => self.server_level(other),
            },
            (Operation::Delete { .. }, resp) => match resp {
                AsciiResponse::Deleted => Ok(Reply::Status(MemcacheStatus::Ok)),
                AsciiResponse::NotFound => Ok(Reply::Status(MemcacheStatus::NotFound)),
                other => self.server_level(other),
            },
            (Operation::Incr { .. } | Operation::Decr { .. }, resp) => match resp {
                AsciiResponse::Numeric(n) => Ok(Reply::Counter(Some(n))),
                AsciiResponse::NotFound => Ok(Reply::Counter(None)),
                other => self.unexpected(&other),
            },
            (Operation::Touch { .. }, resp) => match resp {
                AsciiResponse::Touched => Ok(Reply::Status(MemcacheStatus::Ok)),
                AsciiResponse::NotFound => Ok(Reply::Status(MemcacheStatus::NotFound)),
                other => self.server_level(other),
            },
            (Operation::FlushAll { .. }, resp) => match resp {
                AsciiResponse::Ok => Ok(Reply::Status(MemcacheStatus::Ok)),
                other => self.server_level(other),
            },
            (Operation::Version, AsciiResponse::Version(v)) => {
                Ok(Reply::Version(String::from_utf8_lossy(&v).into_owned()))
            }
            (_, other) => self.unexpected(&other),
        }
    }

    /// ERROR and SERVER_ERROR are part of the accepted set for
    /// status-bearing operations; they resolve as statuses, not failures.
    fn server_level(&self, resp: AsciiResponse) -> Result<Reply, Error> {
        match resp {
            AsciiResponse::Error => Ok(Reply::Status(MemcacheStatus::Error)),
            AsciiResponse::ServerError(_) => Ok(Reply::Status(MemcacheStatus::ServerError)),
            other => self.unexpected(&other),
        }
    }

    fn unexpected(&self, resp: &AsciiResponse) -> Result<Reply, Error> {
        Err(Error::Protocol(format!(
            "unexpected reply {resp:?} to {:?}",
            kind_name(&self.op)
        )))
    }

    fn interpret_binary(&self, resp: BinaryResponse) -> Result<Reply, Error> {
        if resp.status == STATUS_AUTH_ERROR {
            return Err(Error::Authentication(
                "server requires authentication for this command".into(),
            ));
        }
        let expected = binary_opcode(&self.op);
        if resp.opcode != expected {
            return Err(Error::Protocol(format!(
                "response opcode {:?} does not match pending {:?}",
                resp.opcode, expected
            )));
        }

        match &self.op {
            Operation::Get { .. } => match resp.status {
                STATUS_NO_ERROR => Ok(Reply::Value(Some(Value {
                    data: Bytes::from(resp.value),
                    flags: resp.flags,
                }))),
                s if MemcacheStatus::from_wire(s) == MemcacheStatus::NotFound => {
                    Ok(Reply::Value(None))
                }
                s => self.unexpected_status(s),
            },
            Operation::GetWithCas { key } => match resp.status {
                STATUS_NO_ERROR => Ok(Reply::Values(vec![GetValue {
                    key: key.clone(),
                    data: Bytes::from(resp.value),
                    flags: resp.flags,
                    cas: resp.cas,
                }])),
                s if MemcacheStatus::from_wire(s) == MemcacheStatus::NotFound => {
                    Ok(Reply::Values(Vec::new()))
                }
                s => self.unexpected_status(s),
            },
            Operation::Gets { .. } => Err(Error::Protocol(
                "multi-get frame on a binary connection".into(),
            )),
            Operation::Set { .. }
            | Operation::Add { .. }
            | Operation::Replace { .. }
            | Operation::Append { .. }
            | Operation::Prepend { .. }
            | Operation::Cas { .. }
            | Operation::Delete { .. }
            | Operation::Touch { .. }
            | Operation::FlushAll { .. } => {
                Ok(Reply::Status(MemcacheStatus::from_wire(resp.status)))
            }
            Operation::Incr { .. } | Operation::Decr { .. } => match resp.status {
                STATUS_NO_ERROR => Ok(Reply::Counter(Some(resp.counter()?))),
                s if MemcacheStatus::from_wire(s) == MemcacheStatus::NotFound => {
                    Ok(Reply::Counter(None))
                }
                s => self.unexpected_status(s),
            },
            Operation::Version => match resp.status {
                STATUS_NO_ERROR => Ok(Reply::Version(
                    String::from_utf8_lossy(&resp.value).into_owned(),
                )),
                s => self.unexpected_status(s),
            },
        }
    }

    fn unexpected_status(&self, status: u16) -> Result<Reply, Error> {
        Err(Error::Protocol(format!(
            "unexpected status {status:#06x} for {}",
            kind_name(&self.op)
        )))
    }
}

fn ascii_get_value(v: AsciiValue) -> GetValue {
    GetValue {
        key: Bytes::from(v.key),
        data: Bytes::from(v.data),
        flags: v.flags,
        cas: v.cas.unwrap_or(0),
    }
}

fn binary_opcode(op: &Operation) -> Opcode {
    match op {
        Operation::Get { .. } => Opcode::Get,
        Operation::GetWithCas { .. } => Opcode::GetK,
        Operation::Gets { .. } => Opcode::GetK,
        Operation::Set { .. } | Operation::Cas { .. } => Opcode::Set,
        Operation::Add { .. } => Opcode::Add,
        Operation::Replace { .. } => Opcode::Replace,
        Operation::Append { .. } => Opcode::Append,
        Operation::Prepend { .. } => Opcode::Prepend,
        Operation::Delete { .. } => Opcode::Delete,
        Operation::Incr { .. } => Opcode::Increment,
        Operation::Decr { .. } => Opcode::Decrement,
        Operation::Touch { .. } => Opcode::Touch,
        Operation::FlushAll { .. } => Opcode::Flush,
        Operation::Version => Opcode::Version,
    }
}

fn kind_name(op: &Operation) -> &'static str {
    match op {
        Operation::Get { .. } => "get",
        Operation::GetWithCas { .. } => "gets",
        Operation::Gets { .. } => "gets",
        Operation::Set { .. } => "set",
        Operation::Add { .. } => "add",
        Operation::Replace { .. } => "replace",
        Operation::Append { .. } => "append",
        Operation::Prepend { .. } => "prepend",
        Operation::Cas { .. } => "cas",
        Operation::Delete { .. } => "delete",
        Operation::Incr { .. } => "incr",
        Operation::Decr { .. } => "decr",
        Operation::Touch { .. } => "touch",
        Operation::FlushAll { .. } => "flush_all",
        Operation::Version => "version",
    }
}

/// Merge per-shard status results from a broadcast.
///
/// Ok iff every shard reported Ok; otherwise the first non-Ok status in
/// shard order. Any local failure short-circuits the merge.
pub fn merge_statuses<I>(results: I) -> Result<MemcacheStatus, Error>
where
    I: IntoIterator<Item = Result<MemcacheStatus, Error>>,
{
    let mut merged = MemcacheStatus::Ok;
    for result in results {
        let status = result?;
        if merged.is_ok() && !status.is_ok() {
            merged = status;
        }
    }
    Ok(merged)
}
