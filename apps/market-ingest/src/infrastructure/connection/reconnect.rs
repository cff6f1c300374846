//! Reconnection Policy
//!
//! Bounded exponential backoff: the wait before redial `n` (0-based) is
//! `base * multiplier^n`, capped at `max_delay`, optionally jittered.
//! After `max_attempts` redials the policy yields no further delays.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Wait before the first redial.
    pub base_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the wait (0.1 = +/-10%).
    pub jitter_factor: f64,
    /// Redial budget. Must be at least 1.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

/// Per-outage backoff state. Create one when the link drops; discard it
/// once the link is back.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Fresh policy with no attempts used.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Consume one attempt and return how long to wait before it, or `None`
    /// when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(self.jitter(delay))
    }

    /// Attempts consumed so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Un-jittered wait before attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        let secs = self.config.base_delay.as_secs_f64() * factor;
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.config.max_delay
        }
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(base_ms: u64, max_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        })
    }

    #[test]
    fn doubles_from_base() {
        let mut policy = exact(100, 60_000, 5);
        let delays: Vec<u128> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn caps_each_wait() {
        let mut policy = exact(1_000, 2_500, 4);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2_500)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2_500)));
    }

    #[test]
    fn budget_is_exhausted_after_max_attempts() {
        let mut policy = exact(10, 1_000, 3);
        for expected in 1..=3 {
            assert!(policy.next_delay().is_some());
            assert_eq!(policy.attempts(), expected);
        }
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_cap() {
        let policy = exact(500, 30_000, 1);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                base_delay: Duration::from_millis(1_000),
                jitter_factor: 0.1,
                ..ReconnectConfig::default()
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((899..=1_100).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
