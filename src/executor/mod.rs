// Task graph executor: dependency waves, per-task retry and remediation,
// operator escalation, checkpoints and resume

pub mod checkpoint;
pub mod graph;
pub mod invoker;
pub mod results;
pub mod task;
pub mod timeout;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

use crate::classifier::ErrorKind;
use crate::error::{ReboundError, Result, ToolError, WorkflowError};
use crate::escalation::{EscalationConfig, EscalationGate, EscalationHandler, ResolvedAction};
use crate::healing::{FailureContext, RemediationStrategy, StrategyKind, StrategyLearner};
use crate::health::{HealthCheck, HealthMonitor, RunSnapshot};
use crate::ledger::{AttemptLedger, AttemptRecord};
use crate::logging::utils::{log_task_completion, task_span, workflow_span};
use crate::retry::{is_stuck_in_loop, RetryContext, RetryDecision, RetryPolicyEngine};

pub use checkpoint::{Checkpoint, CheckpointStore, RunLock, TaskCheckpoint};
pub use graph::{plan_waves, WavePlan};
pub use invoker::{RunControl, ToolInvoker};
use invoker::RunTokens;
pub use results::{ResultRecord, ResultSink, ResultStream, ResultSummary};
pub use task::{
    normalize_definitions, RunStatus, StuckReport, StuckTask, SubTask, TaskDefinition, TaskStatus,
    Workflow, WorkflowRun,
};
pub use timeout::{TimeoutConfig, ToolTimeouts};

pub const DEFAULT_LOOP_WINDOW: usize = 5;

const HALF_OPEN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Tasks dispatched at once within a wave
    pub concurrency: usize,
    /// Remediated re-runs of a task after its first policy-driven run
    pub task_retry_budget: u32,
    /// Checkpoint after this many task state transitions
    pub checkpoint_every: usize,
    /// Open-breaker waits tolerated per dispatch before the task is
    /// deferred to a later wave, and deferrals tolerated per run before the
    /// task fails
    pub max_cooloff_waits: u32,
    pub pulse_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().clamp(1, 4),
            task_retry_budget: 2,
            checkpoint_every: 10,
            max_cooloff_waits: 3,
            pulse_interval_ms: 30_000,
        }
    }
}

// Everything a spawned task needs, shared across one run
#[derive(Clone)]
struct Shared {
    config: ExecutorConfig,
    loop_window: usize,
    invoker: Arc<dyn ToolInvoker>,
    retry: Arc<RetryPolicyEngine>,
    learner: Arc<StrategyLearner>,
    timeouts: Arc<ToolTimeouts>,
    health: Arc<dyn HealthCheck>,
    handler: Option<Arc<dyn EscalationHandler>>,
    escalation: EscalationConfig,
}

/// Runs workflows of dependent tool calls.
///
/// Tasks whose dependencies have all completed form a wave and run with
/// bounded concurrency. Each task goes through the retry policy engine, then
/// through the remediation ladder, then optionally to an operator. Progress
/// is checkpointed so an interrupted run can be resumed by id.
pub struct TaskGraphExecutor {
    shared: Shared,
    checkpoints: Arc<CheckpointStore>,
    control: RunControl,
}

impl TaskGraphExecutor {
    pub fn new(
        config: ExecutorConfig,
        invoker: Arc<dyn ToolInvoker>,
        retry: Arc<RetryPolicyEngine>,
        learner: Arc<StrategyLearner>,
        timeouts: Arc<ToolTimeouts>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            shared: Shared {
                config,
                loop_window: DEFAULT_LOOP_WINDOW,
                invoker,
                retry,
                learner,
                timeouts,
                health: Arc::new(HealthMonitor::default()),
                handler: None,
                escalation: EscalationConfig::default(),
            },
            checkpoints,
            control: RunControl::new(),
        }
    }

    pub fn with_escalation(
        mut self,
        config: EscalationConfig,
        handler: Option<Arc<dyn EscalationHandler>>,
    ) -> Self {
        self.shared.escalation = config;
        self.shared.handler = handler;
        self
    }

    pub fn with_health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.shared.health = health;
        self
    }

    pub fn with_loop_window(mut self, window: usize) -> Self {
        self.shared.loop_window = window;
        self
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// Handle for pausing or cancelling the run in progress
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Run a new workflow under a generated id
    pub async fn execute_workflow(&self, definitions: Vec<TaskDefinition>) -> Result<WorkflowRun> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.execute_workflow_with_id(&run_id, definitions).await
    }

    pub async fn execute_workflow_with_id(
        &self,
        run_id: &str,
        definitions: Vec<TaskDefinition>,
    ) -> Result<WorkflowRun> {
        let definitions = normalize_definitions(definitions)?;
        let run = WorkflowRun::new(run_id, definitions);
        self.drive(run).await
    }

    /// Continue a paused or failed run from its last checkpoint.
    ///
    /// Completed tasks keep their state. Failed, skipped and interrupted
    /// tasks go back to pending with their attempt counts preserved.
    pub async fn resume(&self, run_id: &str) -> Result<WorkflowRun> {
        let checkpoint = self.checkpoints.find(run_id)?;
        if checkpoint.status == RunStatus::Completed {
            return Err(ReboundError::Workflow(Box::new(WorkflowError::AlreadyFinished {
                run_id: run_id.to_string(),
                status: checkpoint.status.to_string(),
            })));
        }
        let mut run = checkpoint.into_run(&self.checkpoints.checkpoint_path(run_id))?;
        for task in run.tasks.values_mut() {
            if task.status != TaskStatus::Completed && task.status != TaskStatus::Pending {
                task.status = TaskStatus::Pending;
                task.error = None;
                task.started_at = None;
                task.completed_at = None;
            }
        }
        run.recount();
        info!(
            run_id = %run_id,
            completed = run.completed,
            pending = run.pending_ids().len(),
            "Resuming workflow"
        );
        self.drive(run).await
    }

    async fn drive(&self, mut run: WorkflowRun) -> Result<WorkflowRun> {
        let _lock = self.checkpoints.lock(&run.id)?;
        let sink = ResultSink::open(&self.checkpoints.results_path(&run.id))?;
        let tokens = self.control.arm();
        let span = workflow_span(&run.id, run.total_tasks);
        self.run_waves(&mut run, &sink, &tokens).instrument(span).await?;
        Ok(run)
    }

    async fn run_waves(
        &self,
        run: &mut WorkflowRun,
        sink: &ResultSink,
        tokens: &RunTokens,
    ) -> Result<()> {
        let shared = Arc::new(self.shared.clone());
        let gate = Arc::new(EscalationGate::new(shared.escalation.clone()));
        let semaphore = Arc::new(Semaphore::new(shared.config.concurrency.max(1)));
        let checkpoint_every = shared.config.checkpoint_every.max(1);
        let pulse_every = Duration::from_millis(shared.config.pulse_interval_ms.max(1));
        let started = Instant::now();

        run.status = RunStatus::Running;
        run.stuck = None;
        run.recount();
        self.checkpoints.save(&Checkpoint::from_run(run))?;
        info!(run_id = %run.id, total = run.total_tasks, "Starting workflow");

        let mut transitions = 0usize;
        let mut last_progress = Instant::now();
        let mut aborted = false;
        let mut wave = 0usize;
        let mut deferrals: HashMap<String, u32> = HashMap::new();

        loop {
            for (id, reason) in graph::blocked_by_failures(&run.tasks) {
                if let Some(task) = run.tasks.get_mut(&id) {
                    debug!(task_id = %id, reason = %reason, "Skipping task");
                    task.finish(TaskStatus::Skipped, Some(reason));
                    sink.append(&ResultRecord::from_task(task))?;
                    transitions += 1;
                }
            }
            run.recount();

            if aborted || tokens.is_paused() {
                break;
            }

            let ready = graph::ready_set(&run.tasks);
            if ready.is_empty() {
                if run.tasks.values().any(|t| t.status == TaskStatus::Pending) {
                    let report = graph::stuck_report(&run.tasks);
                    error!(run_id = %run.id, report = %report, "Workflow cannot make progress");
                    run.stuck = Some(report);
                }
                break;
            }

            wave += 1;
            debug!(wave, ready = ready.len(), "Dispatching wave");
            let mut queue: VecDeque<String> = ready.into();
            let mut in_flight: JoinSet<TaskOutcome> = JoinSet::new();
            let mut pulse = tokio::time::interval_at(
                tokio::time::Instant::now() + pulse_every,
                pulse_every,
            );

            loop {
                // fill free slots unless a pause or abort came in
                while !aborted && !tokens.is_paused() && !queue.is_empty() {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let Some(id) = queue.pop_front() else {
                        break;
                    };
                    let Some(task) = run.tasks.get_mut(&id) else {
                        continue;
                    };
                    task.status = TaskStatus::Running;
                    task.started_at = Some(chrono::Utc::now());

                    let span = task_span(&task.id, &task.tool_name);
                    let runner = TaskRunner::new(
                        shared.clone(),
                        gate.clone(),
                        tokens.clone(),
                        task.clone(),
                    );
                    in_flight.spawn(
                        async move {
                            let _permit = permit;
                            runner.run_guarded().await
                        }
                        .instrument(span),
                    );
                }

                if in_flight.is_empty() {
                    break;
                }

                tokio::select! {
                    Some(joined) = in_flight.join_next() => {
                        let mut outcome = match joined {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                // tasks are never aborted, so this is unexpected
                                error!(error = %e, "Task join failed");
                                continue;
                            }
                        };
                        if let Some(message) =
                            outcome.deferral_exhausted(&mut deferrals, shared.config.max_cooloff_waits)
                        {
                            outcome.verdict = Verdict::Failed(message);
                        }
                        let Some(task) = run.tasks.get_mut(&outcome.id) else {
                            continue;
                        };
                        if outcome.apply(task) {
                            aborted = true;
                        }
                        if task.status == TaskStatus::Pending {
                            continue;
                        }
                        log_task_completion(&task.id, task.status, task.attempts);
                        sink.append(&ResultRecord::from_task(task))?;
                        last_progress = Instant::now();
                        transitions += 1;
                        run.recount();
                        if transitions >= checkpoint_every {
                            self.checkpoints.save(&Checkpoint::from_run(run))?;
                            transitions = 0;
                        }
                        if aborted && !in_flight.is_empty() {
                            warn!(run_id = %run.id, "Run aborted by operator, draining in-flight tasks");
                        }
                    }
                    _ = pulse.tick() => {
                        shared.health.pulse(&RunSnapshot {
                            run_id: run.id.clone(),
                            total: run.total_tasks,
                            completed: run.completed,
                            failed: run.failed,
                            skipped: run.skipped,
                            in_flight: in_flight.len(),
                            since_last_progress: last_progress.elapsed(),
                        });
                    }
                }
            }

            // tasks never dispatched in a paused wave stay pending
            let report = shared.health.pulse(&RunSnapshot {
                run_id: run.id.clone(),
                total: run.total_tasks,
                completed: run.completed,
                failed: run.failed,
                skipped: run.skipped,
                in_flight: 0,
                since_last_progress: last_progress.elapsed(),
            });
            if !report.is_healthy() {
                debug!(wave, failure_ratio = report.failure_ratio, "Wave finished unhealthy");
            }
        }

        run.recount();
        run.status = if aborted || run.stuck.is_some() {
            RunStatus::Failed
        } else if run.is_finished() {
            if run.failed > 0 {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            }
        } else {
            RunStatus::Paused
        };
        self.checkpoints.save(&Checkpoint::from_run(run))?;
        if run.status == RunStatus::Completed {
            self.checkpoints.archive(&run.id)?;
        }

        info!(
            run_id = %run.id,
            status = %run.status,
            completed = run.completed,
            failed = run.failed,
            skipped = run.skipped,
            duration_ms = started.elapsed().as_millis() as u64,
            "Workflow finished"
        );
        Ok(())
    }
}

#[derive(Debug)]
enum Verdict {
    Completed(Value),
    Failed(String),
    Skipped(String),
    Aborted(String),
    /// Interrupted by cancellation; goes back to pending
    Abandoned,
    /// Breaker stayed open; goes back to pending for a later wave
    Deferred {
        key: String,
        last_error: Option<String>,
    },
}

#[derive(Debug)]
struct TaskOutcome {
    id: String,
    attempts: u32,
    verdict: Verdict,
}

impl TaskOutcome {
    /// Count a deferral; past `max` the task fails with the last tool error
    /// and the open circuit as the reason
    fn deferral_exhausted(&self, deferrals: &mut HashMap<String, u32>, max: u32) -> Option<String> {
        let Verdict::Deferred { key, last_error } = &self.verdict else {
            return None;
        };
        let count = deferrals.entry(self.id.clone()).or_insert(0);
        *count += 1;
        if *count <= max {
            debug!(task_id = %self.id, key = %key, deferrals = *count, "Circuit open, deferring task");
            return None;
        }
        Some(match last_error {
            Some(error) => format!("{error} (circuit open for {key})"),
            None => format!("circuit open for {key}"),
        })
    }

    /// Apply to the run's copy of the task; true if the run must abort
    fn apply(self, task: &mut SubTask) -> bool {
        task.attempts += self.attempts;
        match self.verdict {
            Verdict::Completed(value) => {
                task.result = Some(value);
                task.finish(TaskStatus::Completed, None);
            }
            Verdict::Failed(error) => task.finish(TaskStatus::Failed, Some(error)),
            Verdict::Skipped(reason) => task.finish(TaskStatus::Skipped, Some(reason)),
            Verdict::Aborted(error) => {
                task.finish(TaskStatus::Failed, Some(error));
                return true;
            }
            Verdict::Abandoned | Verdict::Deferred { .. } => {
                task.status = TaskStatus::Pending;
                task.started_at = None;
            }
        }
        false
    }
}

#[derive(Debug)]
struct CallFailure {
    message: String,
    kind: ErrorKind,
}

enum CallError {
    Failed(CallFailure),
    /// Breaker refused past the tolerated waits; not a task failure
    CoolOff {
        key: String,
        last_error: Option<String>,
    },
    Cancelled,
}

/// Breaker key: `host:tool` when the call targets a URL, else the tool name
pub fn breaker_key(tool_name: &str, args: &Value) -> String {
    args.get("url")
        .and_then(Value::as_str)
        .and_then(|raw| Url::parse(raw).ok())
        .and_then(|url| url.host_str().map(str::to_string))
        .map(|host| format!("{host}:{tool_name}"))
        .unwrap_or_else(|| tool_name.to_string())
}

struct TaskRunner {
    shared: Arc<Shared>,
    gate: Arc<EscalationGate>,
    control: RunTokens,
    task: SubTask,
    context: FailureContext,
    attempts: u32,
    /// One record per failed round, for loop detection
    rounds: AttemptLedger,
}

impl TaskRunner {
    fn new(shared: Arc<Shared>, gate: Arc<EscalationGate>, control: RunTokens, task: SubTask) -> Self {
        let context = FailureContext::new(&task.action, &task.tool_name, task.args.clone());
        let rounds = AttemptLedger::new(shared.loop_window);
        Self {
            shared,
            gate,
            control,
            task,
            context,
            attempts: 0,
            rounds,
        }
    }

    async fn run_guarded(mut self) -> TaskOutcome {
        let verdict = match AssertUnwindSafe(self.run()).catch_unwind().await {
            Ok(verdict) => verdict,
            Err(_) => {
                error!(task_id = %self.task.id, "Task panicked");
                Verdict::Failed("task panicked".to_string())
            }
        };
        TaskOutcome {
            id: self.task.id.clone(),
            attempts: self.attempts,
            verdict,
        }
    }

    async fn run(&mut self) -> Verdict {
        let shared = self.shared.clone();
        let mut args = self.task.args.clone();
        let mut budget = shared.config.task_retry_budget;
        let mut rounds = 0u32;
        let mut guidance: Option<String> = None;
        // strategy in use and the error that prompted it
        let mut current: Option<(RemediationStrategy, String)> = None;
        let mut tried: Vec<StrategyKind> = Vec::new();

        loop {
            let strategy_kind = current.as_ref().and_then(|(s, _)| s.kind());
            let failure = match self.call_with_policy(&args, strategy_kind).await {
                Ok(value) => {
                    if let Some((strategy, prompted_by)) = &current {
                        self.learn(prompted_by, strategy, true);
                    }
                    return Verdict::Completed(value);
                }
                Err(CallError::Cancelled) => return Verdict::Abandoned,
                Err(CallError::CoolOff { key, last_error }) => {
                    return Verdict::Deferred { key, last_error }
                }
                Err(CallError::Failed(failure)) => failure,
            };

            if let Err(e) = shared.learner.record_failure(&failure.message, &self.context) {
                warn!(error = %e, "Could not record failure pattern");
            }
            if let Some((strategy, prompted_by)) = current.take() {
                self.learn(&prompted_by, &strategy, false);
            }

            let record = AttemptRecord::failure(&self.task.action, &args, &failure.message, 0);
            self.rounds.record(tag(record, strategy_kind));
            let looping = is_stuck_in_loop(&self.rounds, shared.loop_window);
            if looping {
                warn!(task_id = %self.task.id, action = %self.task.action, "Attempts are looping");
            }

            let mut next = None;
            if rounds < budget && !looping {
                let proposed = shared
                    .learner
                    .next_strategy(&failure.message, &self.context, &tried);
                if !proposed.is_exhausted() {
                    next = Some(proposed);
                }
            }

            if next.is_none() || self.gate.should_escalate(self.attempts, tried.len()) {
                match self.escalate(&failure, &tried).await {
                    Some(Ok(ResolvedAction::RetryDifferently)) => {
                        budget += 1;
                        if next.is_none() {
                            let proposed = shared.learner.next_strategy(
                                &failure.message,
                                &self.context,
                                &tried,
                            );
                            next = Some(if proposed.is_exhausted() {
                                RemediationStrategy::RetryAsIs
                            } else {
                                proposed
                            });
                        }
                    }
                    Some(Ok(ResolvedAction::RetryWithGuidance(text))) => {
                        budget += 1;
                        guidance = Some(text);
                    }
                    Some(Ok(ResolvedAction::Skip)) => {
                        return Verdict::Skipped(format!("skipped by operator: {}", failure.message));
                    }
                    Some(Ok(ResolvedAction::Abort)) => {
                        return Verdict::Aborted(format!("aborted by operator: {}", failure.message));
                    }
                    Some(Err(e)) => {
                        warn!(task_id = %self.task.id, error = %e, "Escalation failed");
                        if next.is_none() {
                            return self.give_up(failure, &tried);
                        }
                    }
                    None if self.control.is_cancelled() => return Verdict::Abandoned,
                    None => {
                        if next.is_none() {
                            return self.give_up(failure, &tried);
                        }
                    }
                }
            }

            rounds += 1;
            args = match &next {
                Some(strategy) => {
                    if let Some(kind) = strategy.kind() {
                        if !tried.contains(&kind) {
                            tried.push(kind);
                        }
                    }
                    if self.sleep(strategy.pre_delay()).await.is_err() {
                        return Verdict::Abandoned;
                    }
                    info!(
                        task_id = %self.task.id,
                        strategy = %strategy,
                        round = rounds,
                        "Retrying with remediation"
                    );
                    strategy.apply_to_args(&self.task.args)
                }
                None => self.task.args.clone(),
            };
            if let (Some(text), Some(map)) = (&guidance, args.as_object_mut()) {
                map.insert("_guidance".into(), Value::String(text.clone()));
            }
            current = next.map(|strategy| (strategy, failure.message));
        }
    }

    /// One policy-driven run: retries with backoff until success or the
    /// policy escalates.
    async fn call_with_policy(
        &mut self,
        args: &Value,
        strategy: Option<StrategyKind>,
    ) -> std::result::Result<Value, CallError> {
        let shared = self.shared.clone();
        let tool = self.task.tool_name.clone();
        let key = breaker_key(&tool, args);
        let context = RetryContext::new(&key, &self.task.action);
        let breaker = shared.retry.breaker();
        let mut attempt_index = 0u32;
        let mut cooloff_waits = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            if !breaker.can_execute(&key) {
                // half-open with another caller's trial call outstanding
                let remaining = breaker.remaining(&key).unwrap_or(HALF_OPEN_POLL);
                self.cool_off(&key, remaining, &mut cooloff_waits, &last_error)
                    .await?;
                continue;
            }

            self.attempts += 1;
            let limit = shared.timeouts.timeout_for(&tool);
            let started = Instant::now();
            let call = tokio::time::timeout(limit, shared.invoker.invoke(&tool, args));
            let outcome = tokio::select! {
                biased;
                _ = self.control.cancel_token().cancelled() => return Err(CallError::Cancelled),
                outcome = call => outcome,
            };
            let elapsed = started.elapsed();
            let duration_ms = elapsed.as_millis() as u64;

            let result = match outcome {
                Ok(Ok(value)) => shared
                    .health
                    .verify(&self.task, &value)
                    .into_result(&tool)
                    .map(|_| value),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ToolError::Timeout {
                    tool: tool.clone(),
                    after: limit,
                }),
            };

            match result {
                Ok(value) => {
                    shared.timeouts.observe(&tool, elapsed);
                    let record = AttemptRecord::success(&self.task.action, args, duration_ms);
                    shared.retry.record_attempt(&key, tag(record, strategy));
                    return Ok(value);
                }
                Err(e) => {
                    let message = e.to_string();
                    let record =
                        AttemptRecord::failure(&self.task.action, args, &message, duration_ms);
                    shared.retry.record_attempt(&key, tag(record, strategy));

                    match shared.retry.decide(&message, attempt_index, &context) {
                        RetryDecision::Retry { delay, kind } => {
                            debug!(
                                attempt = attempt_index,
                                kind = %kind,
                                delay_ms = delay.as_millis() as u64,
                                "Retrying call"
                            );
                            attempt_index += 1;
                            self.sleep(delay).await?;
                        }
                        RetryDecision::CoolOff { remaining } => {
                            last_error = Some(message);
                            self.cool_off(&key, remaining, &mut cooloff_waits, &last_error)
                                .await?;
                            continue;
                        }
                        RetryDecision::Escalate(reason) => {
                            debug!(reason = %reason, "Retry policy gave up");
                            let kind = shared.retry.classifier().classify(&message);
                            return Err(CallError::Failed(CallFailure { message, kind }));
                        }
                    }
                    last_error = Some(message);
                }
            }
        }
    }

    async fn cool_off(
        &self,
        key: &str,
        remaining: Duration,
        waits: &mut u32,
        last_error: &Option<String>,
    ) -> std::result::Result<(), CallError> {
        *waits += 1;
        if *waits > self.shared.config.max_cooloff_waits {
            return Err(CallError::CoolOff {
                key: key.to_string(),
                last_error: last_error.clone(),
            });
        }
        debug!(
            key = %key,
            remaining_ms = remaining.as_millis() as u64,
            "Circuit open, cooling off"
        );
        self.sleep(remaining).await
    }

    async fn sleep(&self, duration: Duration) -> std::result::Result<(), CallError> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.control.cancel_token().cancelled() => Err(CallError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// `None` when no operator is reachable or the run budget is spent
    async fn escalate(
        &self,
        failure: &CallFailure,
        tried: &[StrategyKind],
    ) -> Option<Result<ResolvedAction>> {
        let handler = self.shared.handler.as_ref()?;
        let payload = self.gate.escalate(
            &self.task.id,
            &self.task.action,
            &failure.message,
            failure.kind,
            tried.iter().map(|k| k.as_str().to_string()).collect(),
            self.attempts,
        )?;
        tokio::select! {
            biased;
            _ = self.control.cancel_token().cancelled() => None,
            resolution = handler.resolve(payload) => {
                Some(resolution.and_then(|r| r.into_action()))
            }
        }
    }

    fn give_up(&self, failure: CallFailure, tried: &[StrategyKind]) -> Verdict {
        if tried.is_empty() {
            return Verdict::Failed(failure.message);
        }
        let names: Vec<&str> = tried.iter().map(|k| k.as_str()).collect();
        Verdict::Failed(format!(
            "{} (strategies tried: {})",
            failure.message,
            names.join(", ")
        ))
    }

    fn learn(&self, error: &str, strategy: &RemediationStrategy, success: bool) {
        if let Err(e) = self
            .shared
            .learner
            .record_outcome(error, &self.context, strategy, success)
        {
            warn!(error = %e, "Could not record remediation outcome");
        }
    }
}

fn tag(record: AttemptRecord, strategy: Option<StrategyKind>) -> AttemptRecord {
    match strategy {
        Some(kind) => record.with_strategy(kind.as_str()),
        None => record,
    }
}
