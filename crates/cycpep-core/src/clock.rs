use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, the unit of every job record timestamp.
///
/// A clock set before the epoch reads as `0` instead of failing.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Nanoseconds since the Unix epoch; only used as id entropy.
pub fn current_unix_timestamp_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp_ms, current_unix_timestamp_nanos};

    #[test]
    fn unit_millis_and_nanos_agree() {
        let before_ms = current_unix_timestamp_ms();
        let nanos = current_unix_timestamp_nanos();
        let after_ms = current_unix_timestamp_ms();
        let nanos_ms = u64::try_from(nanos / 1_000_000).expect("fits in u64");
        assert!(before_ms <= nanos_ms && nanos_ms <= after_ms);
    }
}
