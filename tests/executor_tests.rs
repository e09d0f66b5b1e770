// End-to-end workflow execution: waves, failures, escalation, pause and resume

use async_trait::async_trait;
use parking_lot::Mutex;
use rebound::config::StorageConfig;
use rebound::executor::{ResultStream, TaskStatus};
use rebound::{
    ChannelEscalationHandler, CircuitState, Engine, EngineConfig, EscalationResolution, ErrorKind,
    ExecutorConfig, MemoryStrategyStore, ReboundError, RunControl, RunStatus, TaskDefinition,
    ToolError, ToolInvoker, WorkflowError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

fn engine(dir: &TempDir, concurrency: usize) -> Engine {
    let config = EngineConfig {
        executor: ExecutorConfig {
            concurrency,
            ..ExecutorConfig::default()
        },
        storage: StorageConfig {
            data_dir: Some(dir.path().to_path_buf()),
        },
        ..EngineConfig::default()
    };
    Engine::with_store(config, Arc::new(MemoryStrategyStore::new())).expect("engine")
}

fn engine_with(dir: &TempDir, yaml: &str) -> Engine {
    let config = EngineConfig {
        storage: StorageConfig {
            data_dir: Some(dir.path().to_path_buf()),
        },
        ..EngineConfig::from_yaml(yaml).expect("config")
    };
    Engine::with_store(config, Arc::new(MemoryStrategyStore::new())).expect("engine")
}

fn task(id: &str) -> TaskDefinition {
    TaskDefinition::new(id, format!("step {id}"), "click").with_args(json!({"id": id}))
}

fn task_id(args: &Value) -> String {
    args["id"].as_str().unwrap_or_default().to_string()
}

/// Succeeds after a short delay, recording start/end order and peak concurrency
#[derive(Default)]
struct RecordingInvoker {
    events: Mutex<Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    failing: Mutex<HashMap<String, String>>,
}

impl RecordingInvoker {
    fn failing(id: &str, error: &str) -> Self {
        let invoker = Self::default();
        invoker.failing.lock().insert(id.to_string(), error.to_string());
        invoker
    }

    fn position(&self, event: &str) -> usize {
        self.events
            .lock()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {event}"))
    }

    fn calls(&self, id: &str) -> usize {
        self.calls.lock().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ToolInvoker for RecordingInvoker {
    async fn invoke(&self, tool_name: &str, args: &Value) -> Result<Value, ToolError> {
        let id = task_id(args);
        *self.calls.lock().entry(id.clone()).or_default() += 1;
        self.events.lock().push(format!("start {id}"));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().push(format!("end {id}"));
        match self.failing.lock().get(&id) {
            Some(error) => Err(ToolError::failed(tool_name, error.clone())),
            None => Ok(json!({"done": id})),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_ten_task_graph_respects_dependencies_and_concurrency() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 3);
    let invoker = Arc::new(RecordingInvoker::default());

    let deps: &[(&str, &[&str])] = &[
        ("t1", &[]),
        ("t2", &[]),
        ("t3", &[]),
        ("t4", &[]),
        ("t5", &["t1", "t2"]),
        ("t6", &["t3"]),
        ("t7", &["t5", "t6"]),
        ("t8", &["t4"]),
        ("t9", &["t7"]),
        ("t10", &["t8", "t9"]),
    ];
    let definitions = deps
        .iter()
        .map(|(id, on)| task(id).depends_on(on.iter().copied()))
        .collect();

    let run = engine
        .executor(invoker.clone())
        .execute_workflow(definitions)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed, 10);
    assert_eq!(invoker.peak.load(Ordering::SeqCst), 3);

    for (id, on) in deps {
        for dep in on.iter() {
            assert!(
                invoker.position(&format!("end {dep}")) < invoker.position(&format!("start {id}")),
                "{id} started before {dep} finished"
            );
        }
    }

    let records = ResultStream::read_all(&engine.checkpoints().results_path(&run.id)).unwrap();
    assert_eq!(records.len(), 10);
    let summary = ResultStream::summarize(&records);
    assert_eq!(summary.completed, 10);

    let archived = engine.checkpoints().find(&run.id).unwrap();
    assert_eq!(archived.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_failure_skips_dependents_and_fails_run() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 2);
    let invoker = Arc::new(RecordingInvoker::failing("login", "404 Not Found"));

    let run = engine
        .executor(invoker.clone())
        .execute_workflow(vec![
            task("login"),
            task("cart").depends_on(["login"]),
            task("pay").depends_on(["cart"]),
            task("news"),
        ])
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.completed, 1);
    assert_eq!(run.failed, 1);
    assert_eq!(run.skipped, 2);
    assert_eq!(run.task("pay").unwrap().status, TaskStatus::Skipped);
    assert!(run.task("cart").unwrap().error.as_deref().unwrap().contains("login"));
    // plain run plus one retry-as-is remediation
    assert_eq!(invoker.calls("login"), 2);
    assert_eq!(invoker.calls("cart"), 0);

    let records = ResultStream::read_all(&engine.checkpoints().results_path(&run.id)).unwrap();
    let summary = ResultStream::summarize(&records);
    assert_eq!((summary.failed, summary.skipped, summary.completed), (1, 2, 1));
}

/// Pauses the run as soon as a given task has been served
struct PausingInvoker {
    control: RunControl,
    pause_after: String,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolInvoker for PausingInvoker {
    async fn invoke(&self, _tool_name: &str, args: &Value) -> Result<Value, ToolError> {
        let id = task_id(args);
        self.calls.lock().push(id.clone());
        if id == self.pause_after {
            self.control.pause();
        }
        Ok(json!({"done": id}))
    }
}

#[tokio::test(start_paused = true)]
async fn test_pause_then_resume_with_fresh_executor() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 1);
    let control = RunControl::new();
    let invoker = Arc::new(PausingInvoker {
        control: control.clone(),
        pause_after: "s3".to_string(),
        calls: Mutex::new(Vec::new()),
    });
    let definitions: Vec<TaskDefinition> = ["s1", "s2", "s3", "s4", "s5"].iter().map(|id| task(id)).collect();

    let paused = engine
        .executor(invoker.clone())
        .with_control(control)
        .execute_workflow(definitions)
        .await
        .unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.completed, 3);
    assert_eq!(paused.pending_ids(), vec!["s4".to_string(), "s5".to_string()]);

    let checkpoint = engine.checkpoints().load(&paused.id).unwrap();
    assert_eq!(checkpoint.status, RunStatus::Paused);
    assert_eq!(checkpoint.completed, 3);

    // a new executor knows nothing but the run id
    let resumed = engine
        .executor(invoker.clone())
        .resume(&paused.id)
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.completed, 5);
    assert_eq!(*invoker.calls.lock(), vec!["s1", "s2", "s3", "s4", "s5"]);

    let records = ResultStream::read_all(&engine.checkpoints().results_path(&paused.id)).unwrap();
    assert_eq!(records.len(), 5);

    let again = engine.executor(invoker).resume(&paused.id).await;
    assert!(matches!(
        again,
        Err(ReboundError::Workflow(e)) if matches!(*e, WorkflowError::AlreadyFinished { .. })
    ));
}

/// Cancels the run from inside the first call, then hangs
struct CancellingInvoker {
    control: RunControl,
    cancelled_once: AtomicBool,
}

#[async_trait]
impl ToolInvoker for CancellingInvoker {
    async fn invoke(&self, _tool_name: &str, args: &Value) -> Result<Value, ToolError> {
        if !self.cancelled_once.swap(true, Ordering::SeqCst) {
            self.control.cancel();
            std::future::pending::<()>().await;
        }
        Ok(json!({"done": task_id(args)}))
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_in_flight_task() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 1);
    let control = RunControl::new();
    let invoker = Arc::new(CancellingInvoker {
        control: control.clone(),
        cancelled_once: AtomicBool::new(false),
    });

    let run = engine
        .executor(invoker.clone())
        .with_control(control)
        .execute_workflow(vec![task("slow"), task("after").depends_on(["slow"])])
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Paused);
    let slow = run.task("slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Pending);
    assert_eq!(slow.attempts, 1);

    let checkpoint = engine.checkpoints().load(&run.id).unwrap();
    assert_eq!(checkpoint.tasks["slow"].status, TaskStatus::Pending);
    assert_eq!(checkpoint.tasks["slow"].attempts, 1);

    let resumed = engine.executor(invoker).resume(&run.id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.task("slow").unwrap().attempts, 2);
}

/// Blocked by a captcha until an operator provides guidance
struct CaptchaInvoker;

#[async_trait]
impl ToolInvoker for CaptchaInvoker {
    async fn invoke(&self, tool_name: &str, args: &Value) -> Result<Value, ToolError> {
        match args.get("_guidance") {
            Some(guidance) => Ok(json!({"done": task_id(args), "guidance": guidance})),
            None => Err(ToolError::failed(
                tool_name,
                "Please complete the CAPTCHA to continue",
            )),
        }
    }
}

fn spawn_operator(
    mut requests: tokio::sync::mpsc::Receiver<rebound::escalation::EscalationRequest>,
    answer: EscalationResolution,
) -> tokio::task::JoinHandle<Vec<rebound::EscalationPayload>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some((payload, reply)) = requests.recv().await {
            seen.push(payload);
            let _ = reply.send(answer.clone());
        }
        seen
    })
}

#[tokio::test(start_paused = true)]
async fn test_operator_guidance_unblocks_task() {
    let dir = TempDir::new().unwrap();
    let (handler, requests) = ChannelEscalationHandler::new(4);
    let engine = engine(&dir, 1).with_escalation_handler(Arc::new(handler));
    let operator = spawn_operator(requests, EscalationResolution::guidance("solved it manually"));

    let run = engine
        .executor(Arc::new(CaptchaInvoker))
        .execute_workflow(vec![task("checkout")])
        .await
        .unwrap();
    drop(engine);

    assert_eq!(run.status, RunStatus::Completed);
    let checkout = run.task("checkout").unwrap();
    assert_eq!(checkout.attempts, 2);
    assert_eq!(checkout.result.as_ref().unwrap()["guidance"], "solved it manually");

    let payloads = operator.await.unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].error_kind, ErrorKind::Captcha);
    assert_eq!(payloads[0].task_id, "checkout");
    assert_eq!(payloads[0].options.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_operator_skip_and_abort() {
    let dir = TempDir::new().unwrap();

    let (handler, requests) = ChannelEscalationHandler::new(4);
    let engine_skip = engine(&dir, 1).with_escalation_handler(Arc::new(handler));
    let operator = spawn_operator(requests, EscalationResolution::skip());
    let run = engine_skip
        .executor(Arc::new(CaptchaInvoker))
        .execute_workflow(vec![task("checkout"), task("receipt").depends_on(["checkout"])])
        .await
        .unwrap();
    drop(engine_skip);
    operator.await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.skipped, 2);
    assert!(run.task("checkout").unwrap().error.as_deref().unwrap().contains("operator"));

    let (handler, requests) = ChannelEscalationHandler::new(4);
    let engine_abort = engine(&dir, 1).with_escalation_handler(Arc::new(handler));
    let operator = spawn_operator(requests, EscalationResolution::abort());
    let executor = engine_abort.executor(Arc::new(CaptchaInvoker));
    let run = executor
        .execute_workflow(vec![task("checkout"), task("other")])
        .await
        .unwrap();
    // the abort ends this run only
    assert!(!executor.control().is_paused());
    drop(executor);
    drop(engine_abort);
    operator.await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.task("checkout").unwrap().status, TaskStatus::Failed);
    assert_eq!(run.task("other").unwrap().status, TaskStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_without_operator_captcha_fails_fast() {
    let dir = TempDir::new().unwrap();
    let run = engine(&dir, 1)
        .executor(Arc::new(CaptchaInvoker))
        .execute_workflow(vec![task("checkout")])
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.task("checkout").unwrap().attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_successful_remediation_is_learned() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        storage: StorageConfig {
            data_dir: Some(dir.path().to_path_buf()),
        },
        ..EngineConfig::from_yaml("policies:\n  selector_not_found:\n    retryable: false\n")
            .unwrap()
    };
    let engine = Engine::with_store(config, Arc::new(MemoryStrategyStore::new())).unwrap();

    struct FlakySelector;

    #[async_trait]
    impl ToolInvoker for FlakySelector {
        async fn invoke(&self, tool_name: &str, args: &Value) -> Result<Value, ToolError> {
            if args.get("_remediation").is_some() {
                Ok(json!({"clicked": true}))
            } else {
                Err(ToolError::failed(tool_name, "No node found for selector: #buy"))
            }
        }
    }

    let run = engine
        .executor(Arc::new(FlakySelector))
        .execute_workflow(vec![TaskDefinition::new("buy", "click buy", "click")
            .with_args(json!({"selector": "#buy"}))])
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let stats = engine.learner().stats().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].error_kind, ErrorKind::SelectorNotFound);
    assert_eq!(stats[0].successes, 1);
    let patterns = engine.learner().patterns().unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].occurrences, 1);
    assert_eq!(patterns[0].successful_strategy.as_deref(), Some("screenshot_first"));
}

#[tokio::test(start_paused = true)]
async fn test_same_executor_resumes_and_runs_again_after_pause() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir, 1);
    let control = RunControl::new();
    let invoker = Arc::new(PausingInvoker {
        control: control.clone(),
        pause_after: "s2".to_string(),
        calls: Mutex::new(Vec::new()),
    });
    let executor = engine.executor(invoker.clone()).with_control(control.clone());

    let paused = executor
        .execute_workflow(["s1", "s2", "s3", "s4"].iter().map(|id| task(id)).collect())
        .await
        .unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.completed, 2);

    let resumed = executor.resume(&paused.id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.completed, 4);

    let next = executor.execute_workflow(vec![task("n1"), task("n2")]).await.unwrap();
    assert_eq!(next.status, RunStatus::Completed);
    assert_eq!(
        *invoker.calls.lock(),
        vec!["s1", "s2", "s3", "s4", "n1", "n2"]
    );
    assert!(!control.is_paused());
}

/// Hangs on the first call to one task, standing in for a process crash
struct CrashingInvoker {
    crash_on: String,
    crashed: AtomicBool,
    reached: Arc<Notify>,
    calls: Mutex<HashMap<String, usize>>,
}

#[async_trait]
impl ToolInvoker for CrashingInvoker {
    async fn invoke(&self, _tool_name: &str, args: &Value) -> Result<Value, ToolError> {
        let id = task_id(args);
        *self.calls.lock().entry(id.clone()).or_default() += 1;
        if id == self.crash_on && !self.crashed.swap(true, Ordering::SeqCst) {
            self.reached.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(json!({"done": id}))
    }
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_periodic_checkpoint_after_crash() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, "executor:\n  concurrency: 1\n  checkpoint_every: 2\n");
    let reached = Arc::new(Notify::new());
    let invoker = Arc::new(CrashingInvoker {
        crash_on: "s4".to_string(),
        crashed: AtomicBool::new(false),
        reached: reached.clone(),
        calls: Mutex::new(HashMap::new()),
    });
    let definitions: Vec<TaskDefinition> =
        ["s1", "s2", "s3", "s4", "s5"].iter().map(|id| task(id)).collect();

    let executor = engine.executor(invoker.clone());
    let handle = tokio::spawn(async move {
        executor.execute_workflow_with_id("crash-run", definitions).await
    });
    reached.notified().await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    // last snapshot was taken after the second transition; s3 finished later
    let checkpoint = engine.checkpoints().load("crash-run").unwrap();
    assert_eq!(checkpoint.status, RunStatus::Running);
    assert_eq!(checkpoint.completed, 2);
    assert_eq!(checkpoint.tasks["s2"].status, TaskStatus::Completed);
    assert_eq!(checkpoint.tasks["s3"].status, TaskStatus::Pending);

    let resumed = engine.executor(invoker.clone()).resume("crash-run").await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.completed, 5);

    let calls = invoker.calls.lock().clone();
    assert_eq!(calls["s1"], 1);
    assert_eq!(calls["s2"], 1);
    // completed after the last snapshot, so it runs again
    assert_eq!(calls["s3"], 2);
    assert_eq!(calls["s4"], 2);
    assert_eq!(calls["s5"], 1);

    let records = ResultStream::read_all(&engine.checkpoints().results_path("crash-run")).unwrap();
    assert_eq!(records.len(), 6);
}

/// Fails every call with the same error
struct AlwaysFailing {
    error: String,
    calls: AtomicUsize,
}

impl AlwaysFailing {
    fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ToolInvoker for AlwaysFailing {
    async fn invoke(&self, tool_name: &str, _args: &Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::failed(tool_name, self.error.clone()))
    }
}

fn buy_task() -> TaskDefinition {
    TaskDefinition::new("buy", "click buy", "click").with_args(json!({"selector": "#buy"}))
}

#[tokio::test(start_paused = true)]
async fn test_selector_failures_spend_the_whole_task_budget() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(
        &dir,
        "policies:\n  selector_not_found:\n    base_delay_ms: 1\n    max_delay_ms: 5\n",
    );
    let invoker = Arc::new(AlwaysFailing::new("No node found for selector: #buy"));

    let run = engine
        .executor(invoker.clone())
        .execute_workflow(vec![buy_task()])
        .await
        .unwrap();

    // three rounds (plain plus a budget of two) of four policy-driven calls
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 12);
    let buy = run.task("buy").unwrap();
    assert_eq!(buy.status, TaskStatus::Failed);
    assert_eq!(buy.attempts, 12);
    let error = buy.error.as_deref().unwrap();
    assert!(error.starts_with("No node found for selector: #buy"), "{error}");
    assert!(error.contains("screenshot_first"), "{error}");
    assert!(!error.contains("circuit open"), "{error}");

    // a missing selector says nothing about the tool's health
    assert_eq!(engine.breaker().consecutive_failures("click"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_looping_task_goes_to_the_operator() {
    let dir = TempDir::new().unwrap();
    let (handler, requests) = ChannelEscalationHandler::new(4);
    let engine = engine_with(
        &dir,
        r#"
executor:
  task_retry_budget: 10
ledger:
  loop_window: 3
escalation:
  attempt_threshold: 100
  strategy_threshold: 10
policies:
  selector_not_found:
    retryable: false
"#,
    )
    .with_escalation_handler(Arc::new(handler));
    let operator = spawn_operator(requests, EscalationResolution::skip());
    let invoker = Arc::new(AlwaysFailing::new("No node found for selector: #buy"));

    let run = engine
        .executor(invoker.clone())
        .execute_workflow(vec![buy_task()])
        .await
        .unwrap();
    drop(engine);

    // three failed rounds fill the loop window; the ladder had more to offer
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    assert_eq!(run.task("buy").unwrap().status, TaskStatus::Skipped);

    let payloads = operator.await.unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].error, "No node found for selector: #buy");
    assert_eq!(payloads[0].error_kind, ErrorKind::SelectorNotFound);
    assert_eq!(payloads[0].strategies_tried.len(), 2);
    assert_eq!(payloads[0].strategies_tried[0], "screenshot_first");
    assert_eq!(payloads[0].attempts, 3);
}

fn shop_task(id: &str) -> TaskDefinition {
    TaskDefinition::new(id, format!("open {id}"), "navigate")
        .with_args(json!({"id": id, "url": "https://shop.example.com/cart"}))
}

const SHOP_KEY: &str = "shop.example.com:navigate";

#[tokio::test(start_paused = true)]
async fn test_open_breaker_waits_without_consuming_attempts() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(&dir, "circuit_breaker:\n  threshold: 1\n  cooloff_ms: 5000\n");
    engine.breaker().record_failure(SHOP_KEY);
    let invoker = Arc::new(RecordingInvoker::default());

    let started = tokio::time::Instant::now();
    let run = engine
        .executor(invoker.clone())
        .execute_workflow(vec![shop_task("open")])
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(run.task("open").unwrap().attempts, 1);
    assert_eq!(invoker.calls("open"), 1);
    assert_eq!(engine.breaker().snapshot(SHOP_KEY).unwrap().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_refusal_keeps_the_tool_error() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(
        &dir,
        "executor:\n  max_cooloff_waits: 0\ncircuit_breaker:\n  threshold: 2\n  cooloff_ms: 1000\n",
    );
    let invoker = Arc::new(RecordingInvoker::failing("open", "503 Service Unavailable"));

    let run = engine
        .executor(invoker.clone())
        .execute_workflow(vec![shop_task("open")])
        .await
        .unwrap();

    // the second failure trips the breaker; the refusal is not a third attempt
    assert_eq!(invoker.calls("open"), 2);
    let open = run.task("open").unwrap();
    assert_eq!(open.status, TaskStatus::Failed);
    assert_eq!(open.attempts, 2);
    assert_eq!(
        open.error.as_deref(),
        Some("503 Service Unavailable (circuit open for shop.example.com:navigate)")
    );
    // refusals never reach the learner
    assert!(engine.learner().patterns().unwrap().is_empty());
    assert!(engine.learner().stats().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_half_open_trial_call_defers_sibling_task() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(
        &dir,
        r#"
executor:
  concurrency: 2
  max_cooloff_waits: 1
circuit_breaker:
  threshold: 1
  cooloff_ms: 5000
"#,
    );
    engine.breaker().record_failure(SHOP_KEY);
    let invoker = Arc::new(RecordingInvoker::default());

    let run = engine
        .executor(invoker.clone())
        .execute_workflow(vec![shop_task("a"), shop_task("b")])
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    // one trial call at a time, then the deferred task runs in a later wave
    assert_eq!(invoker.peak.load(Ordering::SeqCst), 1);
    for id in ["a", "b"] {
        assert_eq!(run.task(id).unwrap().attempts, 1);
        assert_eq!(invoker.calls(id), 1);
    }
}
