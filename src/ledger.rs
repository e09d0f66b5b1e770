// Bounded attempt history shared across concurrently running tasks

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

pub const DEFAULT_LEDGER_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub action: String,
    pub strategy_used: Option<String>,
    pub args_fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn success(action: impl Into<String>, args: &serde_json::Value, duration_ms: u64) -> Self {
        Self {
            action: action.into(),
            strategy_used: None,
            args_fingerprint: fingerprint_args(args),
            timestamp: Utc::now(),
            success: true,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(
        action: impl Into<String>,
        args: &serde_json::Value,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            action: action.into(),
            strategy_used: None,
            args_fingerprint: fingerprint_args(args),
            timestamp: Utc::now(),
            success: false,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy_used = Some(strategy.into());
        self
    }
}

/// Short stable hash of tool arguments
pub fn fingerprint_args(args: &serde_json::Value) -> String {
    // serde_json maps are ordered, so equal args serialize identically
    let encoded = serde_json::to_vec(args).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<AttemptRecord>>,
    /// Next slot to write
    head: usize,
    len: usize,
    evicted: u64,
}

/// Fixed-capacity ring buffer of attempts. The oldest record is evicted first.
#[derive(Debug)]
pub struct AttemptLedger {
    capacity: usize,
    ring: RwLock<Ring>,
}

impl Default for AttemptLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl AttemptLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: RwLock::new(Ring {
                slots: vec![None; capacity],
                head: 0,
                len: 0,
                evicted: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total records evicted since creation
    pub fn evicted(&self) -> u64 {
        self.ring.read().evicted
    }

    pub fn record(&self, record: AttemptRecord) {
        let mut ring = self.ring.write();
        let head = ring.head;
        if let Some(old) = ring.slots[head].replace(record) {
            ring.evicted += 1;
            debug!(
                action = %old.action,
                success = old.success,
                evicted_total = ring.evicted,
                "Evicted oldest attempt from ledger"
            );
        } else {
            ring.len += 1;
        }
        ring.head = (head + 1) % self.capacity;
    }

    /// The most recent `n` records, oldest first
    pub fn recent(&self, n: usize) -> Vec<AttemptRecord> {
        let ring = self.ring.read();
        let take = n.min(ring.len);
        (0..take)
            .rev()
            .filter_map(|back| {
                let index = (ring.head + self.capacity - 1 - back) % self.capacity;
                ring.slots[index].clone()
            })
            .collect()
    }

    /// All retained records, oldest first
    pub fn snapshot(&self) -> Vec<AttemptRecord> {
        self.recent(self.capacity)
    }

    /// Success rate for an action over retained history
    pub fn success_rate(&self, action: &str) -> Option<f64> {
        self.rate_where(|r| r.action == action)
    }

    /// Success rate for attempts that used a given remediation strategy
    pub fn strategy_success_rate(&self, strategy: &str) -> Option<f64> {
        self.rate_where(|r| r.strategy_used.as_deref() == Some(strategy))
    }

    fn rate_where(&self, predicate: impl Fn(&AttemptRecord) -> bool) -> Option<f64> {
        let ring = self.ring.read();
        let (total, successes) = ring
            .slots
            .iter()
            .flatten()
            .filter(|r| predicate(r))
            .fold((0usize, 0usize), |(t, s), r| (t + 1, s + r.success as usize));
        (total > 0).then(|| successes as f64 / total as f64)
    }

    pub fn clear(&self) {
        let mut ring = self.ring.write();
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        ring.head = 0;
        ring.len = 0;
    }
}
