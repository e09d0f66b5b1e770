// Engine: owns the shared resilience components and wires executors

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::escalation::EscalationHandler;
use crate::executor::{CheckpointStore, TaskGraphExecutor, ToolInvoker, ToolTimeouts};
use crate::healing::{SqliteStrategyStore, StrategyLearner, StrategyStore};
use crate::health::HealthMonitor;
use crate::ledger::AttemptLedger;
use crate::retry::RetryPolicyEngine;

/// Composition root.
///
/// Breaker state, the attempt ledger and learned strategy statistics are
/// shared by every executor built from one engine.
pub struct Engine {
    config: EngineConfig,
    data_dir: PathBuf,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<AttemptLedger>,
    retry: Arc<RetryPolicyEngine>,
    learner: Arc<StrategyLearner>,
    timeouts: Arc<ToolTimeouts>,
    checkpoints: Arc<CheckpointStore>,
    escalation_handler: Option<Arc<dyn EscalationHandler>>,
}

impl Engine {
    /// Open with the sqlite strategy store under the configured data dir
    pub fn open(config: EngineConfig) -> Result<Self> {
        let data_dir = config.storage.resolve_data_dir()?;
        let store = SqliteStrategyStore::open(&data_dir)?;
        info!(data_dir = %data_dir.display(), "Opened strategy store");
        Ok(Self::assemble(config, data_dir, Arc::new(store)))
    }

    /// Use a caller-provided store; checkpoints still go under the data dir
    pub fn with_store(config: EngineConfig, store: Arc<dyn StrategyStore>) -> Result<Self> {
        let data_dir = config.storage.resolve_data_dir()?;
        Ok(Self::assemble(config, data_dir, store))
    }

    fn assemble(config: EngineConfig, data_dir: PathBuf, store: Arc<dyn StrategyStore>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let ledger = Arc::new(AttemptLedger::new(config.ledger.capacity));
        let retry = Arc::new(RetryPolicyEngine::new(
            config.policy_table(),
            breaker.clone(),
            ledger.clone(),
        ));
        let learner = Arc::new(StrategyLearner::new(store, config.learner.clone()));
        let timeouts = Arc::new(ToolTimeouts::new(config.timeouts.clone()));
        let checkpoints = Arc::new(CheckpointStore::new(&data_dir));
        debug!(checkpoints = %checkpoints.root().display(), "Engine assembled");

        Self {
            config,
            data_dir,
            breaker,
            ledger,
            retry,
            learner,
            timeouts,
            checkpoints,
            escalation_handler: None,
        }
    }

    /// Operator layer used by every executor built afterwards
    pub fn with_escalation_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation_handler = Some(handler);
        self
    }

    pub fn executor(&self, invoker: Arc<dyn ToolInvoker>) -> TaskGraphExecutor {
        TaskGraphExecutor::new(
            self.config.executor.clone(),
            invoker,
            self.retry.clone(),
            self.learner.clone(),
            self.timeouts.clone(),
            self.checkpoints.clone(),
        )
        .with_escalation(self.config.escalation.clone(), self.escalation_handler.clone())
        .with_health_check(Arc::new(HealthMonitor::new(self.config.health.clone())))
        .with_loop_window(self.config.ledger.loop_window)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn ledger(&self) -> &Arc<AttemptLedger> {
        &self.ledger
    }

    pub fn retry(&self) -> &Arc<RetryPolicyEngine> {
        &self.retry
    }

    pub fn learner(&self) -> &Arc<StrategyLearner> {
        &self.learner
    }

    pub fn timeouts(&self) -> &Arc<ToolTimeouts> {
        &self.timeouts
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Flush learned statistics to durable storage
    pub fn shutdown(&self) -> Result<()> {
        self.learner.flush()?;
        info!("Engine shut down");
        Ok(())
    }
}
