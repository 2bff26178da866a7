use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential backoff with a cap and downward jitter. State is per-job and
/// per-stage; nothing here is shared between workers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  base: Duration,
  cap: Duration,
  jitter: f64,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base: Duration, cap: Duration, jitter: f64) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      base,
      cap,
      jitter: jitter.clamp(0.0, 1.0),
    }
  }

  pub fn from_config(config: &RetryConfig) -> Self {
    Self::new(
      config.max_attempts,
      config.base.inner(),
      config.cap.inner(),
      config.jitter,
    )
  }

  /// Whether another attempt is allowed after `attempts` completed tries.
  pub fn allows_retry(&self, attempts: u32) -> bool {
    attempts < self.max_attempts
  }

  /// Delay before the retry that follows failed attempt number `attempt`
  /// (1-based). Jitter shaves off a random fraction so concurrent workers
  /// retrying against the same service spread out.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let uncapped = self.base.saturating_mul(1u32 << exponent);
    let capped = uncapped.min(self.cap);

    if self.jitter <= f64::EPSILON {
      return capped;
    }

    let shave: f64 = rand::rng().random_range(0.0..self.jitter);
    capped.mul_f64(1.0 - shave)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy(jitter: f64) -> RetryPolicy {
    RetryPolicy::new(
      5,
      Duration::from_millis(100),
      Duration::from_secs(2),
      jitter,
    )
  }

  #[test]
  fn test_delays_grow_exponentially_without_jitter() {
    let policy = policy(0.0);
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    assert_eq!(policy.delay_for(4), Duration::from_millis(800));
  }

  #[test]
  fn test_delay_is_capped() {
    let policy = policy(0.0);
    assert_eq!(policy.delay_for(10), Duration::from_secs(2));
    // Large attempt numbers must not overflow.
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(2));
  }

  #[test]
  fn test_jitter_stays_within_bounds() {
    let policy = policy(0.3);
    for _ in 0..100 {
      let delay = policy.delay_for(3);
      assert!(delay <= Duration::from_millis(400));
      assert!(delay >= Duration::from_millis(280));
    }
  }

  #[test]
  fn test_retry_budget() {
    let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10), 0.0);
    assert!(policy.allows_retry(1));
    assert!(policy.allows_retry(2));
    assert!(!policy.allows_retry(3));
  }

  #[test]
  fn test_zero_attempts_is_clamped_to_one() {
    let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(10), 0.0);
    assert_eq!(policy.max_attempts, 1);
  }
}
