use rand::Rng;
use std::time::Duration;
use tokio::time::{interval, Interval};

/// Generates a random election timeout within the configured range.
/// Randomization keeps simultaneous candidacies (and so split votes) rare.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms.max(min_ms));
    Duration::from_millis(timeout_ms)
}

/// Creates the leader heartbeat tick.
pub fn heartbeat_interval(interval_ms: u64) -> Interval {
    interval(Duration::from_millis(interval_ms.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_within_range() {
        for _ in 0..100 {
            let timeout = random_election_timeout(150, 300);
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_degenerate_range() {
        let timeout = random_election_timeout(100, 100);
        assert_eq!(timeout, Duration::from_millis(100));
        // Inverted bounds collapse to the minimum
        let timeout = random_election_timeout(200, 100);
        assert_eq!(timeout, Duration::from_millis(200));
    }
}
