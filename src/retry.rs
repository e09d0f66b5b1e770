// Retry policy engine for Rebound
// Decides whether a failed call is retried, how long to wait, or whether to escalate

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::backoff::{self, BackoffStrategy};
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{ErrorClassifier, ErrorKind};
use crate::healing::pattern::normalize_error_signature;
use crate::ledger::{AttemptLedger, AttemptRecord};

/// Retry policy for one error kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    #[serde(with = "backoff::duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "backoff::duration_ms")]
    pub max_delay: Duration,
    pub retryable: bool,
    pub immediate_retry_once: bool,
    pub requires_escalation: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            strategy,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            retryable: true,
            immediate_retry_once: false,
            requires_escalation: false,
        }
    }

    pub fn non_retryable() -> Self {
        Self {
            max_attempts: 0,
            strategy: BackoffStrategy::Immediate,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retryable: false,
            immediate_retry_once: false,
            requires_escalation: true,
        }
    }

    pub fn with_immediate_retry_once(mut self) -> Self {
        self.immediate_retry_once = true;
        self
    }

    pub fn with_escalation(mut self) -> Self {
        self.requires_escalation = true;
        self
    }
}

/// Sparse override of a built-in policy, as read from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyOverride {
    pub max_attempts: Option<u32>,
    pub strategy: Option<BackoffStrategy>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub retryable: Option<bool>,
    pub immediate_retry_once: Option<bool>,
    pub requires_escalation: Option<bool>,
}

impl RetryPolicyOverride {
    pub fn apply(&self, policy: &mut RetryPolicy) {
        if let Some(v) = self.max_attempts {
            policy.max_attempts = v;
        }
        if let Some(v) = self.strategy {
            policy.strategy = v;
        }
        if let Some(v) = self.base_delay_ms {
            policy.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.max_delay_ms {
            policy.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retryable {
            policy.retryable = v;
        }
        if let Some(v) = self.immediate_retry_once {
            policy.immediate_retry_once = v;
        }
        if let Some(v) = self.requires_escalation {
            policy.requires_escalation = v;
        }
    }
}

/// One policy per error kind
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    policies: HashMap<ErrorKind, RetryPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        use BackoffStrategy::*;

        let mut policies = HashMap::new();
        policies.insert(
            ErrorKind::NetworkTimeout,
            RetryPolicy::new(3, ExponentialJitter, 1_000, 10_000).with_immediate_retry_once(),
        );
        policies.insert(
            ErrorKind::RateLimited,
            RetryPolicy::new(5, ExponentialJitter, 5_000, 60_000),
        );
        policies.insert(
            ErrorKind::ServerError,
            RetryPolicy::new(3, Exponential, 2_000, 30_000),
        );
        policies.insert(
            ErrorKind::Captcha,
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::non_retryable()
            },
        );
        policies.insert(
            ErrorKind::SelectorNotFound,
            RetryPolicy::new(3, Linear, 1_000, 5_000),
        );
        policies.insert(
            ErrorKind::StaleElement,
            RetryPolicy::new(3, Linear, 500, 2_000).with_immediate_retry_once(),
        );
        policies.insert(ErrorKind::NotFound, RetryPolicy::non_retryable());
        policies.insert(ErrorKind::AuthRequired, RetryPolicy::non_retryable());
        policies.insert(
            ErrorKind::ConnectionReset,
            RetryPolicy::new(3, Exponential, 1_000, 10_000).with_immediate_retry_once(),
        );
        policies.insert(
            ErrorKind::PageCrash,
            RetryPolicy::new(2, Linear, 2_000, 10_000).with_escalation(),
        );
        policies.insert(
            ErrorKind::Unknown,
            RetryPolicy::new(2, Exponential, 1_000, 8_000),
        );
        Self { policies }
    }
}

impl PolicyTable {
    pub fn get(&self, kind: ErrorKind) -> &RetryPolicy {
        // every kind is populated by Default and never removed
        &self.policies[&kind]
    }

    pub fn set(&mut self, kind: ErrorKind, policy: RetryPolicy) {
        self.policies.insert(kind, policy);
    }

    pub fn with_overrides(mut self, overrides: &HashMap<ErrorKind, RetryPolicyOverride>) -> Self {
        for (kind, over) in overrides {
            if let Some(policy) = self.policies.get_mut(kind) {
                over.apply(policy);
            }
        }
        self
    }
}

/// Caller context for a retry decision
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Circuit breaker key, e.g. `shop.example.com:click`
    pub domain_or_tool: String,
    pub action: String,
}

impl RetryContext {
    pub fn new(domain_or_tool: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            domain_or_tool: domain_or_tool.into(),
            action: action.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationReason {
    NotRetryable { kind: ErrorKind },
    MaxAttempts { kind: ErrorKind, attempts: u32 },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::NotRetryable { kind } => write!(f, "{kind} is not retryable"),
            EscalationReason::MaxAttempts { kind, attempts } => {
                write!(f, "max attempts ({attempts}) reached for {kind}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration, kind: ErrorKind },
    Escalate(EscalationReason),
    /// Breaker open; does not consume an attempt
    CoolOff { remaining: Duration },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }

    pub fn is_escalate(&self) -> bool {
        matches!(self, RetryDecision::Escalate(_))
    }
}

pub struct RetryPolicyEngine {
    classifier: ErrorClassifier,
    policies: PolicyTable,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<AttemptLedger>,
}

impl RetryPolicyEngine {
    pub fn new(
        policies: PolicyTable,
        breaker: Arc<CircuitBreaker>,
        ledger: Arc<AttemptLedger>,
    ) -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            policies,
            breaker,
            ledger,
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn policy_for(&self, kind: ErrorKind) -> &RetryPolicy {
        self.policies.get(kind)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn ledger(&self) -> &Arc<AttemptLedger> {
        &self.ledger
    }

    /// Decide what to do about `error` on attempt `attempt_index` (0-based).
    ///
    /// Reads breaker state but records nothing; call [`Self::record_attempt`]
    /// separately.
    pub fn decide(&self, error: &str, attempt_index: u32, context: &RetryContext) -> RetryDecision {
        let kind = self.classifier.classify(error);
        let policy = self.policies.get(kind);

        if !policy.retryable {
            debug!(kind = %kind, action = %context.action, "Error is not retryable");
            return RetryDecision::Escalate(EscalationReason::NotRetryable { kind });
        }

        if attempt_index >= policy.max_attempts {
            return RetryDecision::Escalate(EscalationReason::MaxAttempts {
                kind,
                attempts: attempt_index,
            });
        }

        if let Some(remaining) = self.breaker.remaining(&context.domain_or_tool) {
            return RetryDecision::CoolOff { remaining };
        }

        let delay = if attempt_index == 0 && policy.immediate_retry_once && kind.is_transient() {
            Duration::ZERO
        } else {
            backoff::delay(
                policy.strategy,
                attempt_index,
                policy.base_delay,
                policy.max_delay,
            )
        };

        trace!(
            kind = %kind,
            attempt = attempt_index,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        RetryDecision::Retry { delay, kind }
    }

    /// Record an attempt outcome into the ledger and the breaker for `key`.
    ///
    /// Failures that do not reflect the resource's health (a missing
    /// selector, a captcha) leave the breaker's failure count alone.
    pub fn record_attempt(&self, key: &str, record: AttemptRecord) {
        match record.error.as_deref() {
            _ if record.success => self.breaker.record_success(key),
            Some(error) if self.classifier.classify(error).reflects_resource_health() => {
                self.breaker.record_failure(key)
            }
            _ => self.breaker.record_inconclusive(key),
        }
        self.ledger.record(record);
    }

    pub fn is_stuck_in_loop(&self, window_size: usize) -> bool {
        is_stuck_in_loop(&self.ledger, window_size)
    }
}

/// True iff the last `window_size` attempts are all failures of the same
/// action with at most two distinct error signatures.
pub fn is_stuck_in_loop(ledger: &AttemptLedger, window_size: usize) -> bool {
    if window_size == 0 {
        return false;
    }
    let recent = ledger.recent(window_size);
    if recent.len() < window_size {
        return false;
    }
    let first_action = &recent[0].action;
    if recent
        .iter()
        .any(|r| r.success || &r.action != first_action)
    {
        return false;
    }
    let signatures: HashSet<String> = recent
        .iter()
        .map(|r| normalize_error_signature(r.error.as_deref().unwrap_or_default()))
        .collect();
    signatures.len() <= 2
}
