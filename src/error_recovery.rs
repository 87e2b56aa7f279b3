//! Bounded retry for instrument detection.
//
// Detection is the only operation retried automatically. Transport faults on an
// established link end that link instead.

use crate::config::SignalGeneratorSettings;
use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// How many times to check, and how long to wait between checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Total checks, including the first.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait between checks.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl From<&SignalGeneratorSettings> for RetryPolicy {
    fn from(settings: &SignalGeneratorSettings) -> Self {
        Self::new(
            settings.detection_attempts,
            Duration::from_millis(settings.detection_backoff_ms),
        )
    }
}

/// A single reachability check.
#[async_trait]
pub trait Reachable: Send {
    /// Fails if the target did not answer this time.
    async fn check(&mut self) -> AppResult<()>;
}

/// Runs `target.check()` until it succeeds or `policy` runs out of attempts.
///
/// Returns the attempt number that succeeded, or the error from the final attempt.
pub async fn retry_detection<R: Reachable>(target: &mut R, policy: RetryPolicy) -> AppResult<u32> {
    let mut attempt = 1;
    loop {
        match target.check().await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt >= policy.attempts => return Err(e),
            Err(e) => {
                debug!(attempt, attempts = policy.attempts, "detection attempt failed: {}", e);
                sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SweepError;

    /// Answers from the `answers_on` attempt onward. Each failure carries its attempt number.
    struct SlowToAnswer {
        checks: u32,
        answers_on: u32,
    }

    #[async_trait]
    impl Reachable for SlowToAnswer {
        async fn check(&mut self) -> AppResult<()> {
            self.checks += 1;
            if self.checks >= self.answers_on {
                Ok(())
            } else {
                Err(SweepError::Timeout(Duration::from_millis(self.checks as u64)))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detected_after_backoff() {
        let mut target = SlowToAnswer {
            checks: 0,
            answers_on: 3,
        };
        let policy = RetryPolicy::new(4, Duration::from_millis(500));
        let started = tokio::time::Instant::now();

        assert_eq!(retry_detection(&mut target, policy).await.unwrap(), 3);
        assert_eq!(target.checks, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_final_error_without_trailing_backoff() {
        let mut target = SlowToAnswer {
            checks: 0,
            answers_on: u32::MAX,
        };
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let started = tokio::time::Instant::now();

        let result = retry_detection(&mut target, policy).await;
        assert!(
            matches!(result, Err(SweepError::Timeout(d)) if d == Duration::from_millis(3)),
            "{:?}",
            result
        );
        assert_eq!(target.checks, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_zero_attempts_from_settings_still_checks_once() {
        let settings = SignalGeneratorSettings {
            detection_attempts: 0,
            detection_backoff_ms: 250,
            ..SignalGeneratorSettings::default()
        };
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.backoff(), Duration::from_millis(250));

        let mut target = SlowToAnswer {
            checks: 0,
            answers_on: 2,
        };
        assert!(retry_detection(&mut target, policy).await.is_err());
        assert_eq!(target.checks, 1);
    }
}
