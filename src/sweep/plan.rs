//! Geometric sweep arithmetic.
//!
//! Each step grows the frequency by a constant fraction (`f += f * term`), so progress and
//! step counts are computed on a log scale.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Progress of `current` between `min` and `max` on a log scale, in percent.
///
/// A degenerate range (`max <= min`) reports 100.
pub fn log_percentage(current: f64, min: f64, max: f64) -> f64 {
    if max <= min {
        return 100.0;
    }
    (current.ln() - min.ln()) / (max.ln() - min.ln()) * 100.0
}

/// Number of `f += f * term` applications needed to go from `start` to at least `stop`.
pub fn step_count(start: f64, stop: f64, term: f64) -> u32 {
    if stop <= start || term <= 0.0 {
        return 0;
    }
    let steps = ((stop / start).ln() / (1.0 + term).ln()).ceil();
    // Guard the boundary where floating point lands a hair above an exact power.
    let mut count = steps.max(0.0) as u32;
    if count > 0 && start * (1.0 + term).powi(count as i32 - 1) >= stop {
        count -= 1;
    }
    count
}

/// Estimated sweep duration: dwell per step plus 10% settling overhead.
pub fn sweep_time(dwell_ms: u64, start: f64, stop: f64, term: f64) -> Duration {
    let seconds = dwell_ms as f64 / 1000.0 * f64::from(step_count(start, stop, term)) * 1.1;
    Duration::from_secs_f64(seconds.max(0.0))
}

/// Next frequency of a forward pass, and whether it is the final (clamped) step.
pub fn next_frequency(current: f64, stop: f64, term: f64) -> (f64, bool) {
    let next = current + current * term;
    if next >= stop {
        (stop, true)
    } else {
        (next, false)
    }
}

/// Dwell time units accepted by [`to_millis`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Microsecond,
    Millisecond,
    Second,
}

/// Normalises a dwell value to whole milliseconds, truncating.
pub fn to_millis(value: f64, unit: TimeUnit) -> u64 {
    let millis = match unit {
        TimeUnit::Microsecond => value * 0.001,
        TimeUnit::Millisecond => value,
        TimeUnit::Second => value * 1000.0,
    };
    millis.max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_percentage_bounds() {
        for (min, max) in [(1.0, 2.0), (100.0, 200.0), (80.0, 6000.0)] {
            assert!(log_percentage(min, min, max).abs() < 1e-9);
            assert!((log_percentage(max, min, max) - 100.0).abs() < 1e-9);
        }
        assert_eq!(log_percentage(5.0, 10.0, 10.0), 100.0);
    }

    #[test]
    fn test_log_percentage_midpoint() {
        // sqrt(100 * 400) is halfway on a log axis.
        assert!((log_percentage(200.0, 100.0, 400.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_step_count_matches_iteration() {
        for (start, stop, term) in [
            (100.0, 200.0, 0.1),
            (1000.0, 2000.0, 0.01),
            (80.0, 1000.0, 0.05),
            (1.0, 3.0, 0.5),
        ] {
            let mut f: f64 = start;
            let mut applications = 0;
            while f < stop {
                f += f * term;
                applications += 1;
            }
            assert_eq!(step_count(start, stop, term), applications, "{start}->{stop} @ {term}");
        }
    }

    #[test]
    fn test_step_count_example() {
        assert_eq!(step_count(100.0, 200.0, 0.1), 8);
        assert_eq!(step_count(200.0, 100.0, 0.1), 0);
    }

    #[test]
    fn test_sweep_time() {
        // 8 steps * 0.5 s * 1.1
        let estimate = sweep_time(500, 100.0, 200.0, 0.1);
        assert!((estimate.as_secs_f64() - 4.4).abs() < 1e-9);
    }

    #[test]
    fn test_next_frequency_clamps() {
        let (next, last) = next_frequency(100.0, 200.0, 0.1);
        assert!((next - 110.0).abs() < 1e-9);
        assert!(!last);
        assert_eq!(next_frequency(194.0, 200.0, 0.1), (200.0, true));
    }

    #[test]
    fn test_dwell_units() {
        assert_eq!(to_millis(2.0, TimeUnit::Second), 2000);
        assert_eq!(to_millis(250.0, TimeUnit::Millisecond), 250);
        assert_eq!(to_millis(1500.0, TimeUnit::Microsecond), 1);
    }
}
