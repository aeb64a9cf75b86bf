//! Small shared utilities.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in seconds.
///
/// Used to stamp outgoing control messages so the receiving side can judge
/// their freshness (stale health pings from before a restart are ignored by
/// consumers, not by the bus).
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_after_2023() {
        assert!(current_timestamp() > 1_672_531_200);
    }
}
