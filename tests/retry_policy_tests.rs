// Retry policy engine working together with the breaker and the ledger

use rebound::backoff::BackoffStrategy;
use rebound::{
    AttemptLedger, AttemptRecord, CircuitBreaker, CircuitBreakerConfig, EngineConfig, ErrorKind,
    EscalationReason, PolicyTable, RetryContext, RetryDecision, RetryPolicyEngine,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn engine(policies: PolicyTable) -> RetryPolicyEngine {
    RetryPolicyEngine::new(
        policies,
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
        Arc::new(AttemptLedger::new(100)),
    )
}

fn fail(engine: &RetryPolicyEngine, key: &str, action: &str, error: &str) {
    engine.record_attempt(key, AttemptRecord::failure(action, &json!({}), error, 10));
}

#[test]
fn test_connection_reset_schedule() {
    let engine = engine(PolicyTable::default());
    let context = RetryContext::new("shop.example.com:navigate", "open cart");
    let error = "net::ERR_CONNECTION_RESET";

    // first retry is immediate, then exponential from 1s
    let delays: Vec<RetryDecision> = (0..3).map(|i| engine.decide(error, i, &context)).collect();
    assert_eq!(
        delays,
        vec![
            RetryDecision::Retry {
                delay: Duration::ZERO,
                kind: ErrorKind::ConnectionReset
            },
            RetryDecision::Retry {
                delay: Duration::from_secs(2),
                kind: ErrorKind::ConnectionReset
            },
            RetryDecision::Retry {
                delay: Duration::from_secs(4),
                kind: ErrorKind::ConnectionReset
            },
        ]
    );
    assert!(engine.decide(error, 3, &context).is_escalate());
}

#[test]
fn test_rate_limit_jitter_stays_bounded() {
    let engine = engine(PolicyTable::default());
    let context = RetryContext::new("api.example.com:fetch", "fetch prices");
    for attempt in 0..5 {
        match engine.decide("429 Too Many Requests", attempt, &context) {
            RetryDecision::Retry { delay, kind } => {
                assert_eq!(kind, ErrorKind::RateLimited);
                let floor = Duration::from_secs(5) * 2u32.pow(attempt);
                let ceiling = floor.mul_f64(1.25).min(Duration::from_secs(60));
                assert!(delay >= floor.min(Duration::from_secs(60)), "{delay:?} < {floor:?}");
                assert!(delay <= ceiling, "{delay:?} > {ceiling:?}");
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }
}

#[test]
fn test_captcha_never_retries() {
    let engine = engine(PolicyTable::default());
    let decision = engine.decide(
        "Please verify you are human",
        0,
        &RetryContext::new("shop:click", "checkout"),
    );
    assert_eq!(
        decision,
        RetryDecision::Escalate(EscalationReason::NotRetryable {
            kind: ErrorKind::Captcha
        })
    );
}

#[test]
fn test_tripped_breaker_cools_off_without_consuming_attempts() {
    let engine = engine(PolicyTable::default());
    let key = "shop.example.com:navigate";
    let context = RetryContext::new(key, "open cart");

    for _ in 0..3 {
        fail(&engine, key, "open cart", "502 Bad Gateway");
    }
    match engine.decide("502 Bad Gateway", 0, &context) {
        RetryDecision::CoolOff { remaining } => {
            assert!(remaining <= Duration::from_secs(60));
            assert!(remaining > Duration::from_secs(50));
        }
        other => panic!("expected cool-off, got {other:?}"),
    }

    // other keys are unaffected
    let other = RetryContext::new("other.example.com:navigate", "open cart");
    assert!(engine.decide("502 Bad Gateway", 0, &other).is_retry());

    // a success closes the breaker again
    engine.record_attempt(key, AttemptRecord::success("open cart", &json!({}), 5));
    assert!(engine.decide("502 Bad Gateway", 0, &context).is_retry());
}

#[test]
fn test_loop_detection_over_recorded_attempts() {
    let engine = engine(PolicyTable::default());
    for i in 0..4 {
        fail(
            &engine,
            &format!("key-{i}"),
            "click buy",
            &format!("No node found for selector #buy-{i}"),
        );
    }
    assert!(!engine.is_stuck_in_loop(5));
    fail(&engine, "key-4", "click buy", "No node found for selector #buy-99");
    assert!(engine.is_stuck_in_loop(5));

    engine.record_attempt("key-5", AttemptRecord::success("click buy", &json!({}), 3));
    assert!(!engine.is_stuck_in_loop(5));
}

#[test]
fn test_configured_overrides_drive_decisions() {
    let config = EngineConfig::from_yaml(
        r#"
policies:
  not_found:
    retryable: true
    max_attempts: 2
    strategy: linear
    base_delay_ms: 250
    max_delay_ms: 1000
"#,
    )
    .unwrap();
    let engine = engine(config.policy_table());
    let context = RetryContext::new("shop:navigate", "open");

    assert_eq!(
        engine.decide("404 Not Found", 1, &context),
        RetryDecision::Retry {
            delay: Duration::from_millis(500),
            kind: ErrorKind::NotFound
        }
    );
    assert!(engine.decide("404 Not Found", 2, &context).is_escalate());
    assert_eq!(
        engine.policy_for(ErrorKind::NotFound).strategy,
        BackoffStrategy::Linear
    );
}
