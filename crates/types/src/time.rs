//! Wall-clock helpers.
//!
//! Consensus timestamps are Unix milliseconds. Proposer-based timestamps
//! compare these against locally observed receive times.

/// A Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotone_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
