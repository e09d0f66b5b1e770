// Rebound - library module
// Resilience core for browser automation agents: failure classification,
// retry policy, circuit breaking, self-healing and wave scheduling

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod healing;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod retry;

// Re-export main types for easier access
pub use backoff::BackoffStrategy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use classifier::{ErrorClassifier, ErrorKind, ToolCategory};
pub use config::{EngineConfig, LedgerConfig, StorageConfig};
pub use engine::Engine;
pub use error::{
    exit_codes, CheckpointError, CliError, ConfigError, EscalationError, ReboundError, Result,
    StorageError, ToolError, WorkflowError,
};
pub use escalation::{
    ChannelEscalationHandler, EscalationConfig, EscalationGate, EscalationHandler,
    EscalationPayload, EscalationResolution, OperatorChoice, ResolvedAction,
};
pub use executor::{
    Checkpoint, CheckpointStore, ExecutorConfig, ResultRecord, ResultStream, RunControl,
    RunStatus, SubTask, TaskDefinition, TaskGraphExecutor, TaskStatus, TimeoutConfig,
    ToolInvoker, ToolTimeouts, Workflow, WorkflowRun,
};
pub use healing::{
    FailureContext, FailurePattern, LearnerConfig, MemoryStrategyStore, RemediationStrategy,
    SqliteStrategyStore, StrategyKind, StrategyLearner, StrategyStats, StrategyStore,
};
pub use health::{HealthCheck, HealthConfig, HealthMonitor, HealthReport, Verification};
pub use ledger::{AttemptLedger, AttemptRecord};
pub use logging::{ColorConfig, LogConfig, LogFormat};
pub use retry::{
    EscalationReason, PolicyTable, RetryContext, RetryDecision, RetryPolicy, RetryPolicyEngine,
    RetryPolicyOverride,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

// Build information (set by build script)
pub const BUILD_DATE: &str = env!("BUILD_DATE");
pub const GIT_COMMIT: &str = env!("GIT_COMMIT");
pub const RUST_VERSION: &str = env!("RUST_VERSION");

/// Get formatted version string with build information
pub fn version_info() -> String {
    format!("{NAME} {VERSION} (commit: {GIT_COMMIT}, built: {BUILD_DATE}, rustc: {RUST_VERSION})")
}
