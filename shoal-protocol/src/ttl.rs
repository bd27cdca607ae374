//! Time-to-expiration normalization.

/// Normalize a caller-supplied relative TTL (seconds) to the server's
/// expected expiration field.
///
/// Every command that takes a relative delay (storage exptime, touch,
/// flush delay) goes through this one rule: zero or negative means
/// "immediate", positive values pass through unchanged. Values beyond
/// the wire field's range saturate.
#[inline]
pub fn ttl_to_expiration(ttl: i64) -> u32 {
    if ttl <= 0 {
        0
    } else if ttl > u32::MAX as i64 {
        u32::MAX
    } else {
        ttl as u32
    }
}
