//! Binary dialect: fixed-header framing.
//!
//! Every request and response starts with a 24-byte header:
//!
//! ```text
//! 0: magic (0x80 request / 0x81 response)
//! 1: opcode
//! 2: key length (u16)
//! 4: extras length (u8)
//! 5: data type
//! 6: vbucket id (request) / status (response) (u16)
//! 8: total body length (u32)
//! 12: opaque (u32)
//! 16: cas (u64)
//! ```
//!
//! followed by extras, key, and value in that order. Authentication rides
//! on the reserved SASL opcodes (0x20..0x22).

use crate::error::ParseError;

pub const HEADER_LEN: usize = 24;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

/// SASL statuses are not part of [`crate::MemcacheStatus`]; the handshake
/// inspects them directly before any operation traffic flows.
pub const STATUS_NO_ERROR: u16 = 0x0000;
pub const STATUS_AUTH_ERROR: u16 = 0x0020;
pub const STATUS_AUTH_CONTINUE: u16 = 0x0021;
pub const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;

/// Sanity cap on response body size. Covers the 1 MiB item limit plus
/// key and extras with room to spare.
const MAX_BODY_LEN: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Flush = 0x08,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, ParseError> {
        match value {
            0x00 => Ok(Opcode::Get),
            0x01 => Ok(Opcode::Set),
            0x02 => Ok(Opcode::Add),
            0x03 => Ok(Opcode::Replace),
            0x04 => Ok(Opcode::Delete),
            0x05 => Ok(Opcode::Increment),
            0x06 => Ok(Opcode::Decrement),
            0x08 => Ok(Opcode::Flush),
            0x0a => Ok(Opcode::Noop),
            0x0b => Ok(Opcode::Version),
            0x0c => Ok(Opcode::GetK),
            0x0e => Ok(Opcode::Append),
            0x0f => Ok(Opcode::Prepend),
            0x1c => Ok(Opcode::Touch),
            0x20 => Ok(Opcode::SaslListMechs),
            0x21 => Ok(Opcode::SaslAuth),
            0x22 => Ok(Opcode::SaslStep),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }
}

/// A single binary-dialect command.
#[derive(Debug, Clone)]
pub enum BinaryRequest<'a> {
    Get {
        key: &'a [u8],
    },
    /// Like Get but the response echoes the key back, so multi-key reads
    /// can match values to keys.
    GetK {
        key: &'a [u8],
    },
    Set {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        expiration: u32,
        /// Zero means unconditional store; nonzero makes this a CAS store.
        cas: u64,
    },
    Add {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        expiration: u32,
    },
    Replace {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        expiration: u32,
    },
    Append {
        key: &'a [u8],
        value: &'a [u8],
    },
    Prepend {
        key: &'a [u8],
        value: &'a [u8],
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
        expiration: u32,
    },
    Flush {
        expiration: u32,
    },
    Version,
    Noop,
    SaslListMechs,
    SaslAuth {
        mechanism: &'a [u8],
        /// Mechanism-specific initial response, e.g. `\0user\0password`
        /// for PLAIN.
        payload: &'a [u8],
    },
}

impl<'a> BinaryRequest<'a> {
    /// Append this command's wire frame to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            BinaryRequest::Get { key } => {
                write_header(buf, Opcode::Get, key.len(), 0, key.len(), 0);
                buf.extend_from_slice(key);
            }
            BinaryRequest::GetK { key } => {
                write_header(buf, Opcode::GetK, key.len(), 0, key.len(), 0);
                buf.extend_from_slice(key);
            }
            BinaryRequest::Set {
                key,
                value,
                flags,
                expiration,
                cas,
            } => encode_store(buf, Opcode::Set, key, value, *flags, *expiration, *cas),
            BinaryRequest::Add {
                key,
                value,
                flags,
                expiration,
            } => encode_store(buf, Opcode::Add, key, value, *flags, *expiration, 0),
            BinaryRequest::Replace {
                key,
                value,
                flags,
                expiration,
            } => encode_store(buf, Opcode::Replace, key, value, *flags, *expiration, 0),
            BinaryRequest::Append { key, value } => {
                write_header(buf, Opcode::Append, key.len(), 0, key.len() + value.len(), 0);
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
            }
            BinaryRequest::Prepend { key, value } => {
                write_header(
                    buf,
                    Opcode::Prepend,
                    key.len(),
                    0,
                    key.len() + value.len(),
                    0,
                );
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
            }
            BinaryRequest::Delete { key } => {
                write_header(buf, Opcode::Delete, key.len(), 0, key.len(), 0);
                buf.extend_from_slice(key);
            }
            BinaryRequest::Incr { key, delta } => encode_arith(buf, Opcode::Increment, key, *delta),
            BinaryRequest::Decr { key, delta } => encode_arith(buf, Opcode::Decrement, key, *delta),
            BinaryRequest::Touch { key, expiration } => {
                write_header(buf, Opcode::Touch, key.len(), 4, key.len() + 4, 0);
                buf.extend_from_slice(&expiration.to_be_bytes());
                buf.extend_from_slice(key);
            }
            BinaryRequest::Flush { expiration } => {
                write_header(buf, Opcode::Flush, 0, 4, 4, 0);
                buf.extend_from_slice(&expiration.to_be_bytes());
            }
            BinaryRequest::Version => write_header(buf, Opcode::Version, 0, 0, 0, 0),
            BinaryRequest::Noop => write_header(buf, Opcode::Noop, 0, 0, 0, 0),
            BinaryRequest::SaslListMechs => {
                write_header(buf, Opcode::SaslListMechs, 0, 0, 0, 0);
            }
            BinaryRequest::SaslAuth { mechanism, payload } => {
                write_header(
                    buf,
                    Opcode::SaslAuth,
                    mechanism.len(),
                    0,
                    mechanism.len() + payload.len(),
                    0,
                );
                buf.extend_from_slice(mechanism);
                buf.extend_from_slice(payload);
            }
        }
    }
}

fn write_header(
    buf: &mut Vec<u8>,
    opcode: Opcode,
    key_len: usize,
    extras_len: usize,
    body_len: usize,
    cas: u64,
) {
    buf.push(MAGIC_REQUEST);
    buf.push(opcode as u8);
    buf.extend_from_slice(&(key_len as u16).to_be_bytes());
    buf.push(extras_len as u8);
    buf.push(0); // data type
    buf.extend_from_slice(&0u16.to_be_bytes()); // vbucket
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // opaque
    buf.extend_from_slice(&cas.to_be_bytes());
}

/// Storage commands carry 8 bytes of extras: flags then expiration.
fn encode_store(
    buf: &mut Vec<u8>,
    opcode: Opcode,
    key: &[u8],
    value: &[u8],
    flags: u32,
    expiration: u32,
    cas: u64,
) {
    write_header(buf, opcode, key.len(), 8, key.len() + value.len() + 8, cas);
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&expiration.to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Incr/decr extras: delta, initial value, expiration. An all-ones
/// expiration tells the server not to auto-create missing counters, so a
/// miss comes back as KeyNotFound instead of a silent zero.
fn encode_arith(buf: &mut Vec<u8>, opcode: Opcode, key: &[u8], delta: u64) {
    write_header(buf, opcode, key.len(), 20, key.len() + 20, 0);
    buf.extend_from_slice(&delta.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());
    buf.extend_from_slice(&u32::MAX.to_be_bytes());
    buf.extend_from_slice(key);
}

/// A parsed binary response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryResponse {
    pub opcode: Opcode,
    /// Raw wire status. Operation responses map this through
    /// [`crate::MemcacheStatus::from_wire`]; SASL responses compare it
    /// against the `STATUS_*` constants directly.
    pub status: u16,
    pub cas: u64,
    pub opaque: u32,
    /// From the 4-byte extras of a Get/GetK response, zero otherwise.
    pub flags: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BinaryResponse {
    /// Parse one complete response frame from `data`.
    ///
    /// Returns the response and the number of bytes consumed, or
    /// [`ParseError::Incomplete`] until the whole body is buffered.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Incomplete);
        }
        if data[0] != MAGIC_RESPONSE {
            return Err(ParseError::InvalidMagic(data[0]));
        }
        let opcode = Opcode::from_u8(data[1])?;
        let key_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let extras_len = data[4] as usize;
        let status = u16::from_be_bytes([data[6], data[7]]);
        let body_len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let opaque = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let cas = u64::from_be_bytes([
            data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
        ]);

        if body_len > MAX_BODY_LEN {
            return Err(ParseError::Protocol("response body too large"));
        }
        let body_len = body_len as usize;
        if extras_len + key_len > body_len {
            return Err(ParseError::Protocol("inconsistent body lengths"));
        }
        let frame_len = HEADER_LEN + body_len;
        if data.len() < frame_len {
            return Err(ParseError::Incomplete);
        }

        let body = &data[HEADER_LEN..frame_len];
        let flags = if extras_len >= 4 {
            u32::from_be_bytes([body[0], body[1], body[2], body[3]])
        } else {
            0
        };
        let key = body[extras_len..extras_len + key_len].to_vec();
        let value = body[extras_len + key_len..].to_vec();

        Ok((
            BinaryResponse {
                opcode,
                status,
                cas,
                opaque,
                flags,
                key,
                value,
            },
            frame_len,
        ))
    }

    /// Interpret the value as the 8-byte big-endian counter that incr/decr
    /// responses carry.
    pub fn counter(&self) -> Result<u64, ParseError> {
        let bytes: [u8; 8] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| ParseError::Protocol("counter value is not 8 bytes"))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(req: BinaryRequest<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        req.encode(&mut buf);
        buf
    }

    fn response_frame(
        opcode: Opcode,
        status: u16,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        cas: u64,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(MAGIC_RESPONSE);
        buf.push(opcode as u8);
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.push(extras.len() as u8);
        buf.push(0);
        buf.extend_from_slice(&status.to_be_bytes());
        let body = (extras.len() + key.len() + value.len()) as u32;
        buf.extend_from_slice(&body.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&cas.to_be_bytes());
        buf.extend_from_slice(extras);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    #[test]
    fn encode_get() {
        let buf = encoded(BinaryRequest::Get { key: b"mykey" });
        assert_eq!(buf.len(), HEADER_LEN + 5);
        assert_eq!(buf[0], MAGIC_REQUEST);
        assert_eq!(buf[1], Opcode::Get as u8);
        assert_eq!(&buf[2..4], &5u16.to_be_bytes());
        assert_eq!(buf[4], 0); // no extras
        assert_eq!(&buf[8..12], &5u32.to_be_bytes());
        assert_eq!(&buf[HEADER_LEN..], b"mykey");
    }

    #[test]
    fn encode_set_layout() {
        let buf = encoded(BinaryRequest::Set {
            key: b"k",
            value: b"value",
            flags: 0xdead_beef,
            expiration: 3600,
            cas: 0,
        });
        assert_eq!(buf[1], Opcode::Set as u8);
        assert_eq!(buf[4], 8); // extras: flags + expiration
        assert_eq!(&buf[8..12], &(8u32 + 1 + 5).to_be_bytes());
        assert_eq!(&buf[24..28], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&buf[28..32], &3600u32.to_be_bytes());
        assert_eq!(&buf[32..33], b"k");
        assert_eq!(&buf[33..], b"value");
    }

    #[test]
    fn encode_cas_store_carries_token() {
        let buf = encoded(BinaryRequest::Set {
            key: b"k",
            value: b"v",
            flags: 0,
            expiration: 0,
            cas: 0x1122_3344_5566_7788,
        });
        assert_eq!(&buf[16..24], &0x1122_3344_5566_7788u64.to_be_bytes());
    }

    #[test]
    fn encode_incr_extras() {
        let buf = encoded(BinaryRequest::Incr {
            key: b"counter",
            delta: 5,
        });
        assert_eq!(buf[1], Opcode::Increment as u8);
        assert_eq!(buf[4], 20);
        assert_eq!(&buf[24..32], &5u64.to_be_bytes());
        assert_eq!(&buf[32..40], &0u64.to_be_bytes());
        // No auto-create on miss.
        assert_eq!(&buf[40..44], &u32::MAX.to_be_bytes());
        assert_eq!(&buf[44..], b"counter");
    }

    #[test]
    fn encode_touch_and_flush() {
        let buf = encoded(BinaryRequest::Touch {
            key: b"k",
            expiration: 30,
        });
        assert_eq!(buf[1], Opcode::Touch as u8);
        assert_eq!(buf[4], 4);
        assert_eq!(&buf[24..28], &30u32.to_be_bytes());
        assert_eq!(&buf[28..], b"k");

        let buf = encoded(BinaryRequest::Flush { expiration: 0 });
        assert_eq!(buf[1], Opcode::Flush as u8);
        assert_eq!(buf.len(), HEADER_LEN + 4);
        assert_eq!(&buf[24..28], &0u32.to_be_bytes());
    }

    #[test]
    fn encode_sasl_auth_plain() {
        let buf = encoded(BinaryRequest::SaslAuth {
            mechanism: b"PLAIN",
            payload: b"\0user\0pass",
        });
        assert_eq!(buf[1], Opcode::SaslAuth as u8);
        assert_eq!(&buf[2..4], &5u16.to_be_bytes());
        assert_eq!(&buf[8..12], &15u32.to_be_bytes());
        assert_eq!(&buf[24..29], b"PLAIN");
        assert_eq!(&buf[29..], b"\0user\0pass");
    }

    #[test]
    fn parse_get_hit() {
        let frame = response_frame(
            Opcode::Get,
            STATUS_NO_ERROR,
            &0xabcd_1234u32.to_be_bytes(),
            b"",
            b"myvalue",
            7,
        );
        let (resp, consumed) = BinaryResponse::parse(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(resp.opcode, Opcode::Get);
        assert_eq!(resp.status, STATUS_NO_ERROR);
        assert_eq!(resp.flags, 0xabcd_1234);
        assert_eq!(resp.value, b"myvalue");
        assert_eq!(resp.cas, 7);
    }

    #[test]
    fn parse_getk_echoes_key() {
        let frame = response_frame(
            Opcode::GetK,
            STATUS_NO_ERROR,
            &0u32.to_be_bytes(),
            b"mykey",
            b"v",
            1,
        );
        let (resp, _) = BinaryResponse::parse(&frame).unwrap();
        assert_eq!(resp.key, b"mykey");
        assert_eq!(resp.value, b"v");
    }

    #[test]
    fn parse_counter_response() {
        let frame = response_frame(
            Opcode::Increment,
            STATUS_NO_ERROR,
            &[],
            b"",
            &42u64.to_be_bytes(),
            0,
        );
        let (resp, _) = BinaryResponse::parse(&frame).unwrap();
        assert_eq!(resp.counter().unwrap(), 42);
    }

    #[test]
    fn counter_rejects_wrong_width() {
        let frame = response_frame(Opcode::Increment, STATUS_NO_ERROR, &[], b"", b"bad", 0);
        let (resp, _) = BinaryResponse::parse(&frame).unwrap();
        assert!(resp.counter().is_err());
    }

    #[test]
    fn parse_error_status_with_text_body() {
        let frame = response_frame(Opcode::Set, 0x0005, &[], b"", b"Not stored.", 0);
        let (resp, _) = BinaryResponse::parse(&frame).unwrap();
        assert_eq!(resp.status, 0x0005);
        assert_eq!(resp.value, b"Not stored.");
    }

    #[test]
    fn parse_is_resumable() {
        let frame = response_frame(
            Opcode::Get,
            STATUS_NO_ERROR,
            &0u32.to_be_bytes(),
            b"",
            b"value",
            0,
        );
        for cut in [0, 1, HEADER_LEN - 1, HEADER_LEN, frame.len() - 1] {
            assert!(matches!(
                BinaryResponse::parse(&frame[..cut]),
                Err(ParseError::Incomplete)
            ));
        }
    }

    #[test]
    fn parse_rejects_bad_magic_and_opcode() {
        let mut frame = response_frame(Opcode::Get, 0, &[], b"", b"", 0);
        frame[0] = MAGIC_REQUEST;
        assert!(matches!(
            BinaryResponse::parse(&frame),
            Err(ParseError::InvalidMagic(0x80))
        ));

        let mut frame = response_frame(Opcode::Get, 0, &[], b"", b"", 0);
        frame[1] = 0x77;
        assert!(matches!(
            BinaryResponse::parse(&frame),
            Err(ParseError::UnknownOpcode(0x77))
        ));
    }

    #[test]
    fn parse_rejects_inconsistent_lengths() {
        let mut frame = response_frame(Opcode::Get, 0, &[], b"key", b"", 0);
        // Claim a key longer than the whole body.
        frame[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            BinaryResponse::parse(&frame),
            Err(ParseError::Protocol("inconsistent body lengths"))
        ));
    }

    #[test]
    fn parse_rejects_oversized_body() {
        let mut frame = response_frame(Opcode::Get, 0, &[], b"", b"", 0);
        frame[8..12].copy_from_slice(&(MAX_BODY_LEN + 1).to_be_bytes());
        assert!(matches!(
            BinaryResponse::parse(&frame),
            Err(ParseError::Protocol("response body too large"))
        ));
    }

    #[test]
    fn parse_two_pipelined_frames() {
        let mut stream = response_frame(Opcode::Set, STATUS_NO_ERROR, &[], b"", b"", 1);
        let second = response_frame(Opcode::Delete, 0x0001, &[], b"", b"Not found", 0);
        stream.extend_from_slice(&second);

        let (first, consumed) = BinaryResponse::parse(&stream).unwrap();
        assert_eq!(first.opcode, Opcode::Set);
        let (next, rest) = BinaryResponse::parse(&stream[consumed..]).unwrap();
        assert_eq!(next.opcode, Opcode::Delete);
        assert_eq!(next.status, 0x0001);
        assert_eq!(consumed + rest, stream.len());
    }
}
