// Per-key circuit breaker for tools and domains
// Keys are free-form, typically "domain:tool"

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that trip the breaker
    pub threshold: u32,
    pub window_ms: u64,
    /// Cooloff after the first trip; doubles on each consecutive trip
    pub cooloff_ms: u64,
    pub max_cooloff_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_ms: 30_000,
            cooloff_ms: 60_000,
            max_cooloff_ms: 600_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooloff(&self) -> Duration {
        Duration::from_millis(self.cooloff_ms)
    }

    pub fn max_cooloff(&self) -> Duration {
        Duration::from_millis(self.max_cooloff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Cooloff elapsed; one trial call is allowed and a failure re-trips immediately
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failures: VecDeque<Instant>,
    cooloff_until: Option<Instant>,
    trips: u32,
    /// Admission time of the outstanding half-open trial call
    trial_since: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            cooloff_until: None,
            trips: 0,
            trial_since: None,
        }
    }
}

/// Snapshot of one key's breaker state
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooloff_remaining: Option<Duration>,
    pub trips: u32,
}

/// Concurrent per-key breaker. Operations on one key never block other keys.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    entries: DashMap<String, BreakerEntry>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn can_execute(&self, key: &str) -> bool {
        self.can_execute_at(key, Instant::now())
    }

    /// Whether a call on `key` may go out now.
    ///
    /// In half-open state only one caller is admitted until the trial call is
    /// settled by a recorded outcome. A trial call never settled within one
    /// cooloff period is presumed lost and another caller is admitted.
    pub fn can_execute_at(&self, key: &str, now: Instant) -> bool {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return true;
        };
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => match entry.trial_since {
                Some(since) if now.saturating_duration_since(since) < self.config.cooloff() => false,
                _ => {
                    entry.trial_since = Some(now);
                    true
                }
            },
            CircuitState::Open => match entry.cooloff_until {
                Some(until) if now < until => false,
                _ => {
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_since = Some(now);
                    debug!(key = %key, "Circuit breaker half-open, allowing a trial call");
                    true
                }
            },
        }
    }

    /// Remaining cooloff if the breaker for `key` is open
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.remaining_at(key, Instant::now())
    }

    pub fn remaining_at(&self, key: &str, now: Instant) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        match (entry.state, entry.cooloff_until) {
            (CircuitState::Open, Some(until)) if now < until => Some(until - now),
            _ => None,
        }
    }

    pub fn record_success(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.state != CircuitState::Closed {
                info!(key = %key, "Circuit breaker closed");
            }
            *entry = BreakerEntry::new();
        }
    }

    /// Outcome that says nothing about the resource's health, e.g. a missing
    /// selector. Releases a half-open trial call without closing or re-tripping.
    pub fn record_inconclusive(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.trial_since = None;
        }
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Instant::now());
    }

    pub fn record_failure_at(&self, key: &str, now: Instant) {
        let window = self.config.window();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            CircuitState::HalfOpen => {
                self.trip(key, &mut entry, now);
            }
            CircuitState::Open => {
                // Failures reported by calls that started before the trip
                entry.failures.push_back(now);
            }
            CircuitState::Closed => {
                entry.failures.push_back(now);
                while let Some(&oldest) = entry.failures.front() {
                    if now.saturating_duration_since(oldest) > window {
                        entry.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if entry.failures.len() as u32 >= self.config.threshold {
                    self.trip(key, &mut entry, now);
                }
            }
        }
    }

    fn trip(&self, key: &str, entry: &mut BreakerEntry, now: Instant) {
        entry.trips = entry.trips.saturating_add(1);
        let factor = 2u32.saturating_pow(entry.trips - 1);
        let cooloff = self
            .config
            .cooloff()
            .saturating_mul(factor)
            .min(self.config.max_cooloff());
        entry.state = CircuitState::Open;
        entry.cooloff_until = Some(now + cooloff);
        entry.trial_since = None;
        warn!(
            key = %key,
            trips = entry.trips,
            failures = entry.failures.len(),
            cooloff_ms = cooloff.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let now = Instant::now();
        self.entries.get(key).map(|entry| CircuitSnapshot {
            key: key.to_string(),
            state: entry.state,
            consecutive_failures: entry.failures.len() as u32,
            cooloff_remaining: entry
                .cooloff_until
                .filter(|until| entry.state == CircuitState::Open && now < *until)
                .map(|until| until - now),
            trips: entry.trips,
        })
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.entries
            .get(key)
            .map(|entry| entry.failures.len() as u32)
            .unwrap_or(0)
    }
}
