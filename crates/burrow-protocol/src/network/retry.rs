//! Retry backoff for failed apps and the rendezvous link

use std::time::Duration;

/// Exponential backoff policy.
///
/// Defaults: first retry after 5 seconds, doubling up to 10 minutes, with a
/// small deterministic jitter so a fleet of nodes does not retry in step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Jitter factor in `0.0..1.0` of the backoff duration
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(600),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff for a given attempt number (0-indexed): exponential, capped,
    /// plus deterministic jitter keyed on the attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = base.saturating_mul(2_u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_backoff.as_millis() as u64);

        let jitter_range = (capped as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7 + 13) % (jitter_range + 1)
        } else {
            0
        };

        Duration::from_millis(capped.saturating_add(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for_attempt(20), Duration::from_secs(600));
        // no overflow at absurd attempt counts
        assert_eq!(policy.backoff_for_attempt(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            let backoff = policy.backoff_for_attempt(attempt);
            let bare = RetryPolicy {
                jitter_factor: 0.0,
                ..Default::default()
            }
            .backoff_for_attempt(attempt);
            assert!(backoff >= bare);
            assert!(backoff <= bare.mul_f64(1.1) + Duration::from_millis(1));
        }
    }
}
