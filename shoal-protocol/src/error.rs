//! Parse errors shared by both dialects.

/// Error type for wire parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    /// Not fatal - the caller should buffer more bytes and retry.
    #[error("incomplete frame")]
    Incomplete,

    /// The response text/frame violates the protocol grammar.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A numeric field could not be parsed.
    #[error("invalid number")]
    InvalidNumber,

    /// Unknown opcode byte in a binary response.
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// Wrong magic byte in a binary response.
    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),
}

impl ParseError {
    /// Returns true if this error means more bytes are needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}
