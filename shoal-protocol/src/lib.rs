//! Client-side Memcache wire protocol support.
//!
//! This crate is the pure codec layer of the shoal client: it turns logical
//! commands into wire bytes and wire bytes back into typed responses, for
//! both protocol dialects. It performs no I/O and holds no connection state.
//!
//! # ASCII dialect
//!
//! Newline-terminated text commands with space-separated fields; value data
//! is length-prefixed, not escaped.
//!
//! ```
//! use shoal_protocol::ascii::{AsciiRequest, AsciiResponse};
//!
//! let mut buf = Vec::new();
//! AsciiRequest::Get { key: b"mykey" }.encode(&mut buf);
//! assert_eq!(&buf, b"get mykey\r\n");
//!
//! let (response, consumed) = AsciiResponse::parse(b"STORED\r\n").unwrap();
//! assert_eq!(response, AsciiResponse::Stored);
//! assert_eq!(consumed, 8);
//! ```
//!
//! # Binary dialect
//!
//! Fixed 24-byte headers followed by extras/key/value. Authentication uses
//! the protocol's reserved SASL opcodes.
//!
//! Parsing in both dialects is resumable: an incomplete frame yields
//! [`ParseError::Incomplete`] and the caller buffers more bytes and retries.

pub mod ascii;
pub mod binary;
mod error;
mod status;
mod ttl;

pub use error::ParseError;
pub use status::MemcacheStatus;
pub use ttl::ttl_to_expiration;
