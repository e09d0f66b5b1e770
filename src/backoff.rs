// Backoff delay calculation for retries

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum fraction of the exponential delay added as jitter.
pub const MAX_JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Linear,
    Exponential,
    ExponentialJitter,
}

/// Compute the delay before retry number `attempt_index` (0-based).
///
/// Jitter is drawn from the thread RNG; use [`delay_with_jitter`] for a
/// deterministic result.
pub fn delay(
    strategy: BackoffStrategy,
    attempt_index: u32,
    base: Duration,
    cap: Duration,
) -> Duration {
    let jitter = match strategy {
        BackoffStrategy::ExponentialJitter => rand::thread_rng().gen_range(0.0..=1.0),
        _ => 0.0,
    };
    delay_with_jitter(strategy, attempt_index, base, cap, jitter)
}

/// Same as [`delay`] with the jitter draw supplied by the caller.
///
/// `jitter` is a unit value in `[0, 1]` scaled to at most 25% of the
/// exponential delay. The result is always within `[0, cap]`.
pub fn delay_with_jitter(
    strategy: BackoffStrategy,
    attempt_index: u32,
    base: Duration,
    cap: Duration,
    jitter: f64,
) -> Duration {
    let base_ns = base.as_nanos() as f64;
    let cap_ns = cap.as_nanos() as f64;

    let raw_ns = match strategy {
        BackoffStrategy::Immediate => 0.0,
        BackoffStrategy::Linear => base_ns * (attempt_index as f64 + 1.0),
        BackoffStrategy::Exponential => base_ns * exponent(attempt_index),
        BackoffStrategy::ExponentialJitter => {
            let exponential = base_ns * exponent(attempt_index);
            exponential * (1.0 + MAX_JITTER_FRACTION * jitter.clamp(0.0, 1.0))
        }
    };

    if !raw_ns.is_finite() || raw_ns >= cap_ns {
        return cap;
    }
    Duration::from_nanos(raw_ns.max(0.0).round() as u64)
}

fn exponent(attempt_index: u32) -> f64 {
    // 2^1023 is the largest finite power; anything above saturates to the cap anyway
    2f64.powi(attempt_index.min(1023) as i32)
}

/// Serde helper storing a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
