//! Caller-visible result codes for status-bearing operations.

use std::fmt;

/// Closed result-code vocabulary for mutation operations.
///
/// Server-reported outcomes from both dialects normalize into this one set,
/// so callers never match on dialect-specific response types. Local failures
/// (transport, routing, authentication) are a separate error type in the
/// client crate; this enum only carries what a live server said.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcacheStatus {
    /// The operation succeeded (STORED, DELETED, TOUCHED, OK, NoError).
    Ok,
    /// Store condition not met (NOT_STORED / ItemNotStored).
    NotStored,
    /// The key does not exist (NOT_FOUND / KeyNotFound).
    NotFound,
    /// CAS token mismatch (EXISTS / KeyExists).
    Exists,
    /// The value exceeds the server's item size limit.
    ValueTooLarge,
    /// The server rejected the command arguments.
    InvalidArguments,
    /// The server is out of memory for this item.
    OutOfMemory,
    /// Generic ERROR response (unknown command).
    Error,
    /// SERVER_ERROR or an unrecognized binary status.
    ServerError,
}

impl MemcacheStatus {
    /// Returns true for the success code.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, MemcacheStatus::Ok)
    }

    /// Map a binary-dialect wire status to the shared vocabulary.
    ///
    /// Authentication statuses are intentionally absent: they are handled
    /// before this mapping and surface as authentication errors, never as
    /// an operation status.
    pub fn from_wire(status: u16) -> Self {
        match status {
            0x0000 => MemcacheStatus::Ok,
            0x0001 => MemcacheStatus::NotFound,
            0x0002 => MemcacheStatus::Exists,
            0x0003 => MemcacheStatus::ValueTooLarge,
            0x0004 => MemcacheStatus::InvalidArguments,
            0x0005 => MemcacheStatus::NotStored,
            0x0081 => MemcacheStatus::Error,
            0x0082 => MemcacheStatus::OutOfMemory,
            _ => MemcacheStatus::ServerError,
        }
    }
}

impl fmt::Display for MemcacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemcacheStatus::Ok => "OK",
            MemcacheStatus::NotStored => "NOT_STORED",
            MemcacheStatus::NotFound => "NOT_FOUND",
            MemcacheStatus::Exists => "EXISTS",
            MemcacheStatus::ValueTooLarge => "VALUE_TOO_LARGE",
            MemcacheStatus::InvalidArguments => "INVALID_ARGUMENTS",
            MemcacheStatus::OutOfMemory => "OUT_OF_MEMORY",
            MemcacheStatus::Error => "ERROR",
            MemcacheStatus::ServerError => "SERVER_ERROR",
        };
        f.write_str(s)
    }
}
