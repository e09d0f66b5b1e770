// Self-healing: propose remediation strategies and learn which ones work

pub mod pattern;
pub mod store;
pub mod strategy;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::{ErrorClassifier, ErrorKind};
use crate::error::Result;

pub use pattern::{normalize_error_signature, signature_hash, FailurePattern};
pub use store::{MemoryStrategyStore, SqliteStrategyStore, StrategyStats, StrategyStore};
pub use strategy::{
    DiagnosticReport, FailureCategory, FailureContext, RemediationStrategy, StrategyKind,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Observations needed before a strategy can be called "best"
    pub min_observations: u64,
    /// Success rate a strategy must exceed to be trusted
    pub confidence_threshold: f64,
    /// EMA weight for failure pattern success rates
    pub ema_weight: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            min_observations: 3,
            confidence_threshold: 0.7,
            ema_weight: pattern::DEFAULT_EMA_WEIGHT,
        }
    }
}

/// Ranks remediation strategies by recorded outcomes.
///
/// Ground-truth counters live in the [`StrategyStore`]; failure patterns
/// carry an EMA for quick heuristics and never feed `best_strategy`.
pub struct StrategyLearner {
    classifier: ErrorClassifier,
    store: Arc<dyn StrategyStore>,
    config: LearnerConfig,
    // serializes read-modify-write of pattern rows
    pattern_lock: Mutex<()>,
}

impl StrategyLearner {
    pub fn new(store: Arc<dyn StrategyStore>, config: LearnerConfig) -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            store,
            config,
            pattern_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StrategyStore> {
        &self.store
    }

    /// Strategy to try for remediation number `attempt_number` (0-based).
    ///
    /// Walks the category ladder, skipping strategies that cannot apply to
    /// this failure. A confident learned strategy from the same ladder is
    /// tried first. Past the end of the ladder the result is `Exhausted`.
    pub fn analyze_failure(
        &self,
        error: &str,
        context: &FailureContext,
        attempt_number: u32,
    ) -> RemediationStrategy {
        let ranked = self.rank(error, context);
        match ranked.candidates.get(attempt_number as usize) {
            Some(strategy) => ranked.select(strategy, context),
            None => ranked.exhausted(error, context),
        }
    }

    /// First candidate in ranked order whose kind is not in `tried`.
    ///
    /// Unlike [`Self::analyze_failure`] this is stable when the ranking
    /// changes between calls: a strategy is never repeated or skipped because
    /// another task's outcomes promoted something else meanwhile.
    pub fn next_strategy(
        &self,
        error: &str,
        context: &FailureContext,
        tried: &[StrategyKind],
    ) -> RemediationStrategy {
        let ranked = self.rank(error, context);
        let untried = ranked
            .candidates
            .iter()
            .find(|s| s.kind().map_or(true, |k| !tried.contains(&k)));
        match untried {
            Some(strategy) => ranked.select(strategy, context),
            None => ranked.exhausted(error, context),
        }
    }

    fn rank(&self, error: &str, context: &FailureContext) -> Ranked {
        let kind = self.classifier.classify(error);
        let category = FailureCategory::categorize(kind, context.tool_category());
        let mut ladder: Vec<StrategyKind> = category.ladder().to_vec();

        match self.best_strategy(kind) {
            Ok(Some(best)) => {
                if let Some(position) = ladder.iter().position(|k| *k == best) {
                    let promoted = ladder.remove(position);
                    ladder.insert(0, promoted);
                    debug!(kind = %kind, strategy = %best, "Promoted learned strategy");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Strategy store unavailable, using default ladder"),
        }

        let candidates = ladder
            .iter()
            .filter_map(|k| RemediationStrategy::build(*k, context))
            .collect();
        Ranked {
            kind,
            category,
            candidates,
        }
    }

    /// Count one more occurrence of this failure's pattern
    pub fn record_failure(&self, error: &str, context: &FailureContext) -> Result<FailurePattern> {
        let kind = self.classifier.classify(error);
        let _guard = self.pattern_lock.lock();
        let mut pattern = self
            .store
            .load_pattern(&signature_hash(&context.action, error))?
            .unwrap_or_else(|| FailurePattern::new(&context.action, kind, error));
        pattern.observe_occurrence();
        self.store.upsert_pattern(&pattern)?;
        Ok(pattern)
    }

    /// Record whether `strategy` fixed the failure described by `error`
    pub fn record_outcome(
        &self,
        error: &str,
        context: &FailureContext,
        strategy: &RemediationStrategy,
        success: bool,
    ) -> Result<()> {
        let Some(strategy_kind) = strategy.kind() else {
            return Ok(());
        };
        let kind = self.classifier.classify(error);
        let stats = self.store.record_outcome(kind, strategy_kind, success)?;
        debug!(
            kind = %kind,
            strategy = %strategy_kind,
            success,
            total = stats.total,
            "Recorded remediation outcome"
        );

        let _guard = self.pattern_lock.lock();
        let mut pattern = self
            .store
            .load_pattern(&signature_hash(&context.action, error))?
            .unwrap_or_else(|| FailurePattern::new(&context.action, kind, error));
        pattern.observe_outcome(strategy_kind.as_str(), success, self.config.ema_weight);
        self.store.upsert_pattern(&pattern)
    }

    /// Highest-rate strategy with enough observations and confidence, if any
    pub fn best_strategy(&self, kind: ErrorKind) -> Result<Option<StrategyKind>> {
        let best = self
            .store
            .stats_for(kind)?
            .into_iter()
            .filter(|s| {
                s.total >= self.config.min_observations
                    && s.success_rate() > self.config.confidence_threshold
            })
            .max_by(|a, b| {
                a.success_rate()
                    .total_cmp(&b.success_rate())
                    .then(a.total.cmp(&b.total))
            })
            .map(|s| s.strategy);
        Ok(best)
    }

    pub fn pattern(&self, action: &str, error: &str) -> Result<Option<FailurePattern>> {
        self.store.load_pattern(&signature_hash(action, error))
    }

    pub fn patterns(&self) -> Result<Vec<FailurePattern>> {
        self.store.patterns()
    }

    pub fn stats(&self) -> Result<Vec<StrategyStats>> {
        self.store.all_stats()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

// Applicable strategies for one failure, best first
struct Ranked {
    kind: ErrorKind,
    category: FailureCategory,
    candidates: Vec<RemediationStrategy>,
}

impl Ranked {
    fn select(&self, strategy: &RemediationStrategy, context: &FailureContext) -> RemediationStrategy {
        debug!(
            kind = %self.kind,
            category = ?self.category,
            action = %context.action,
            strategy = %strategy,
            "Selected remediation strategy"
        );
        strategy.clone()
    }

    fn exhausted(self, error: &str, context: &FailureContext) -> RemediationStrategy {
        info!(
            kind = %self.kind,
            category = ?self.category,
            action = %context.action,
            "Remediation ladder exhausted"
        );
        RemediationStrategy::Exhausted(DiagnosticReport {
            category: self.category,
            error_kind: self.kind,
            error: error.to_string(),
            strategies_tried: self.candidates.iter().filter_map(|s| s.kind()).collect(),
            suggestions: self.category.suggestions(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn learner() -> StrategyLearner {
        StrategyLearner::new(Arc::new(MemoryStrategyStore::new()), LearnerConfig::default())
    }

    fn click_context() -> FailureContext {
        FailureContext::new(
            "click add to cart",
            "browser_click",
            json!({"selector": "ul.items > li:nth-child(2) button"}),
        )
    }

    #[test]
    fn test_selector_ladder_progression() {
        let learner = learner();
        let context = click_context();
        let error = "No node found for selector";
        let kinds: Vec<_> = (0..4)
            .map(|n| learner.analyze_failure(error, &context, n).kind().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec![
                StrategyKind::ScreenshotFirst,
                StrategyKind::GeneralizeSelector,
                StrategyKind::WaitForLoad,
                StrategyKind::ScanPage
            ]
        );

        match learner.analyze_failure(error, &context, 4) {
            RemediationStrategy::Exhausted(report) => {
                assert_eq!(report.category, FailureCategory::Selector);
                assert_eq!(report.strategies_tried.len(), 4);
                assert!(!report.suggestions.is_empty());
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_captcha_is_immediately_exhausted() {
        let learner = learner();
        let context = FailureContext::new("open", "navigate", json!({"url": "https://x.test"}));
        let strategy = learner.analyze_failure("Please solve the captcha", &context, 0);
        match strategy {
            RemediationStrategy::Exhausted(report) => {
                assert_eq!(report.category, FailureCategory::HumanRequired);
                assert!(report.strategies_tried.is_empty());
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_best_strategy_needs_three_observations() {
        let learner = learner();
        let context = click_context();
        let error = "No node found for selector";
        let wait = RemediationStrategy::WaitForLoad {
            timeout: std::time::Duration::from_secs(10),
        };

        learner.record_outcome(error, &context, &wait, true).unwrap();
        learner.record_outcome(error, &context, &wait, true).unwrap();
        assert_eq!(learner.best_strategy(ErrorKind::SelectorNotFound).unwrap(), None);

        learner.record_outcome(error, &context, &wait, true).unwrap();
        assert_eq!(
            learner.best_strategy(ErrorKind::SelectorNotFound).unwrap(),
            Some(StrategyKind::WaitForLoad)
        );

        // promoted to the front of the ladder
        assert_eq!(
            learner.analyze_failure(error, &context, 0).kind(),
            Some(StrategyKind::WaitForLoad)
        );
        assert_eq!(
            learner.analyze_failure(error, &context, 1).kind(),
            Some(StrategyKind::ScreenshotFirst)
        );
    }

    #[test]
    fn test_next_strategy_is_stable_under_promotion() {
        let learner = learner();
        let context = click_context();
        let error = "No node found for selector";

        let first = learner.next_strategy(error, &context, &[]);
        assert_eq!(first.kind(), Some(StrategyKind::ScreenshotFirst));

        // another task's wins promote wait_for_load while this one is mid-ladder
        let wait = RemediationStrategy::WaitForLoad {
            timeout: std::time::Duration::from_secs(10),
        };
        for _ in 0..3 {
            learner.record_outcome(error, &context, &wait, true).unwrap();
        }

        let mut tried = vec![StrategyKind::ScreenshotFirst];
        loop {
            match learner.next_strategy(error, &context, &tried) {
                RemediationStrategy::Exhausted(_) => break,
                next => {
                    let kind = next.kind().unwrap();
                    assert!(!tried.contains(&kind), "{kind} repeated");
                    tried.push(kind);
                }
            }
        }
        assert_eq!(
            tried,
            vec![
                StrategyKind::ScreenshotFirst,
                StrategyKind::WaitForLoad,
                StrategyKind::GeneralizeSelector,
                StrategyKind::ScanPage
            ]
        );
    }

    #[test]
    fn test_low_success_rate_is_not_trusted() {
        let learner = learner();
        let context = click_context();
        let scan = RemediationStrategy::ScanPage;
        for success in [true, false, true, false] {
            learner
                .record_outcome("selector missing", &context, &scan, success)
                .unwrap();
        }
        assert_eq!(learner.best_strategy(ErrorKind::SelectorNotFound).unwrap(), None);
    }

    #[test]
    fn test_failures_cluster_into_one_pattern() {
        let learner = learner();
        let context = click_context();
        learner
            .record_failure("selector #row-1 not found at line 42", &context)
            .unwrap();
        let pattern = learner
            .record_failure("selector #row-1 not found at line 99", &context)
            .unwrap();
        assert_eq!(pattern.occurrences, 2);
        assert_eq!(pattern.error_kind, ErrorKind::SelectorNotFound);
        assert_eq!(learner.patterns().unwrap().len(), 1);
        assert!(learner
            .pattern("click add to cart", "selector #row-1 not found at line 7")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_exhausted_outcome_is_not_recorded() {
        let learner = learner();
        let context = click_context();
        let exhausted = learner.analyze_failure("captcha", &context, 0);
        learner
            .record_outcome("captcha", &context, &exhausted, false)
            .unwrap();
        assert!(learner.stats().unwrap().is_empty());
    }
}
