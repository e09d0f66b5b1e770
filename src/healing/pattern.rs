// Failure signatures and EMA-scored failure patterns

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classifier::ErrorKind;

pub const DEFAULT_EMA_WEIGHT: f64 = 0.2;

static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("valid uuid pattern")
});
static HEX_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b0x[0-9a-f]+\b").expect("valid hex literal pattern"));
// long hex-ish ids such as node ids or request hashes; must contain a digit
static HEX_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]*[0-9][0-9a-f]*\b").expect("valid hex id pattern")
});
static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid digits pattern"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Strip volatile tokens so similar failures cluster together.
///
/// "selector X not found at line 42" and "...line 99" normalize identically.
pub fn normalize_error_signature(error: &str) -> String {
    let lowered = error.to_lowercase();
    let s = UUID.replace_all(&lowered, "<id>");
    let s = HEX_LITERAL.replace_all(&s, "<hex>");
    let s = HEX_ID.replace_all(&s, |caps: &regex::Captures| {
        let token = &caps[0];
        if token.len() >= 8 && token.chars().any(|c| c.is_ascii_alphabetic()) {
            "<hex>".to_string()
        } else {
            token.to_string()
        }
    });
    let s = DIGITS.replace_all(&s, "#");
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

/// Stable hash of `action` plus the normalized error
pub fn signature_hash(action: &str, error: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_error_signature(error).as_bytes());
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub signature_hash: String,
    pub action: String,
    pub error_kind: ErrorKind,
    pub normalized_error: String,
    pub occurrences: u64,
    pub strategies_tried: Vec<String>,
    pub successful_strategy: Option<String>,
    /// Exponential moving average of remediation success
    pub success_rate: f64,
    pub last_seen: DateTime<Utc>,
}

impl FailurePattern {
    pub fn new(action: &str, error_kind: ErrorKind, error: &str) -> Self {
        Self {
            signature_hash: signature_hash(action, error),
            action: action.to_string(),
            error_kind,
            normalized_error: normalize_error_signature(error),
            occurrences: 0,
            strategies_tried: Vec::new(),
            successful_strategy: None,
            success_rate: 0.0,
            last_seen: Utc::now(),
        }
    }

    pub fn observe_occurrence(&mut self) {
        self.occurrences += 1;
        self.last_seen = Utc::now();
    }

    pub fn observe_outcome(&mut self, strategy: &str, success: bool, weight: f64) {
        let weight = weight.clamp(0.0, 1.0);
        let observation = if success { 1.0 } else { 0.0 };
        self.success_rate = (1.0 - weight) * self.success_rate + weight * observation;
        if !self.strategies_tried.iter().any(|s| s == strategy) {
            self.strategies_tried.push(strategy.to_string());
        }
        if success {
            self.successful_strategy = Some(strategy.to_string());
        }
        self.last_seen = Utc::now();
    }
}
