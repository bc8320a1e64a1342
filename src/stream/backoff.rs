use std::time::Duration;

/// Maps a failed-attempt count to a retry delay.
///
/// `delay = min(base * growth ^ min(attempts, cap_exponent), max_delay)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub growth: f64,
    pub cap_exponent: u32,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(self.cap_exponent);
        let factor = self.growth.powi(exponent as i32);
        let scaled = self.base.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// Tracks consecutive failures against a policy and an attempt limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            attempts: 0,
        }
    }

    /// Record one failure. `None` once the attempt limit is exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.max_attempts {
            return None;
        }
        Some(self.policy.delay_for(self.attempts))
    }

    /// Called after every successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            growth: 1.01,
            cap_exponent: 5,
            max_delay: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_sequence_is_non_decreasing_and_capped() {
        let policy = policy();
        let delays: Vec<Duration> = (0..50).map(|n| policy.delay_for(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(2000)));
        assert_eq!(delays[0], Duration::from_millis(100));
        // Exponent stops growing at the cap.
        assert_eq!(delays[5], delays[49]);
    }

    #[test]
    fn test_steep_growth_hits_max_delay() {
        let policy = BackoffPolicy {
            growth: 3.0,
            ..policy()
        };
        assert_eq!(policy.delay_for(5), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
    }

    #[test]
    fn test_reset_after_successful_reconnect() {
        let mut backoff = Backoff::new(policy(), 10);
        for _ in 0..3 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.attempts(), 3);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(policy().delay_for(1)));
    }

    #[test]
    fn test_exceeding_max_attempts_is_fatal() {
        let mut backoff = Backoff::new(policy(), 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }
}
