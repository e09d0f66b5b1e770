// Run health: stall detection, failure-ratio alarms and common-sense result checks

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::classifier::ToolCategory;
use crate::error::ToolError;
use crate::executor::SubTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// No task finished for this long while work is in flight
    pub stall_after_ms: u64,
    /// Alarm once this share of finished tasks has failed
    pub failure_ratio_alarm: f64,
    /// Finished tasks needed before the failure ratio is judged
    pub min_sample: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stall_after_ms: 120_000,
            failure_ratio_alarm: 0.5,
            min_sample: 4,
        }
    }
}

/// Point-in-time view of a run for health checks
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub in_flight: usize,
    pub since_last_progress: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub stalled: bool,
    pub failure_ratio: f64,
    pub failure_alarm: bool,
    pub warnings: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        !self.stalled && !self.failure_alarm
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Ok,
    Suspicious(String),
}

impl Verification {
    pub fn into_result(self, tool: &str) -> Result<(), ToolError> {
        match self {
            Verification::Ok => Ok(()),
            Verification::Suspicious(reason) => Err(ToolError::VerificationFailed {
                tool: tool.to_string(),
                reason,
            }),
        }
    }
}

/// Capability interface composed into the executor
pub trait HealthCheck: Send + Sync {
    fn pulse(&self, snapshot: &RunSnapshot) -> HealthReport;

    fn verify(&self, task: &SubTask, result: &Value) -> Verification;
}

#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty() || map.values().all(is_empty_payload),
        _ => false,
    }
}

impl HealthCheck for HealthMonitor {
    fn pulse(&self, snapshot: &RunSnapshot) -> HealthReport {
        let mut report = HealthReport::default();

        let stall_after = Duration::from_millis(self.config.stall_after_ms);
        if snapshot.in_flight > 0 && snapshot.since_last_progress >= stall_after {
            report.stalled = true;
            report.warnings.push(format!(
                "no task finished in {}s with {} in flight",
                snapshot.since_last_progress.as_secs(),
                snapshot.in_flight
            ));
        }

        let finished = snapshot.completed + snapshot.failed;
        if finished > 0 {
            report.failure_ratio = snapshot.failed as f64 / finished as f64;
        }
        if finished >= self.config.min_sample
            && report.failure_ratio >= self.config.failure_ratio_alarm
        {
            report.failure_alarm = true;
            report.warnings.push(format!(
                "{} of {} finished tasks failed",
                snapshot.failed, finished
            ));
        }

        for warning in &report.warnings {
            warn!(run_id = %snapshot.run_id, "{}", warning);
        }
        report
    }

    fn verify(&self, task: &SubTask, result: &Value) -> Verification {
        let extracting = matches!(
            ToolCategory::of(&task.tool_name),
            ToolCategory::Extraction | ToolCategory::Bulk
        );
        // extracted data may legitimately contain a page's own error text
        if !extracting {
            if let Some(message) = result.get("error").and_then(Value::as_str) {
                return Verification::Suspicious(format!("tool reported an error: {message}"));
            }
        }
        if extracting && is_empty_payload(result) {
            return Verification::Suspicious("extraction returned no data".to_string());
        }
        Verification::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskDefinition;
    use serde_json::json;

    fn task(tool: &str) -> SubTask {
        SubTask::from_definition(TaskDefinition::new("t", "do it", tool))
    }

    fn snapshot(completed: usize, failed: usize, in_flight: usize, idle_secs: u64) -> RunSnapshot {
        RunSnapshot {
            run_id: "r".to_string(),
            total: 20,
            completed,
            failed,
            skipped: 0,
            in_flight,
            since_last_progress: Duration::from_secs(idle_secs),
        }
    }

    #[test]
    fn test_stall_detection() {
        let monitor = HealthMonitor::default();
        assert!(monitor.pulse(&snapshot(2, 0, 3, 300)).stalled);
        assert!(!monitor.pulse(&snapshot(2, 0, 0, 300)).stalled);
        assert!(monitor.pulse(&snapshot(2, 0, 3, 5)).is_healthy());
    }

    #[test]
    fn test_failure_ratio_alarm_needs_sample() {
        let monitor = HealthMonitor::default();
        assert!(!monitor.pulse(&snapshot(1, 2, 0, 0)).failure_alarm);
        let report = monitor.pulse(&snapshot(2, 3, 0, 0));
        assert!(report.failure_alarm);
        assert!((report.failure_ratio - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_verify_extraction_results() {
        let monitor = HealthMonitor::default();
        let extract = task("extract_prices");
        assert_eq!(
            monitor.verify(&extract, &json!({"prices": []})),
            Verification::Suspicious("extraction returned no data".to_string())
        );
        assert_eq!(monitor.verify(&extract, &Value::Null), monitor.verify(&extract, &json!("")));
        assert_eq!(monitor.verify(&extract, &json!({"prices": ["9.99"]})), Verification::Ok);

        // interactions may legitimately return nothing
        assert_eq!(monitor.verify(&task("click"), &Value::Null), Verification::Ok);
        assert!(matches!(
            monitor.verify(&task("click"), &json!({"error": "element hidden"})),
            Verification::Suspicious(_)
        ));
    }

    #[test]
    fn test_extracted_error_text_is_data() {
        let monitor = HealthMonitor::default();
        let banner = json!({"error": "Service temporarily unavailable", "title": "Status"});
        assert_eq!(monitor.verify(&task("extract_text"), &banner), Verification::Ok);
        assert!(matches!(
            monitor.verify(&task("navigate"), &banner),
            Verification::Suspicious(_)
        ));
    }

    #[test]
    fn test_suspicious_becomes_tool_error() {
        let error = Verification::Suspicious("empty".to_string())
            .into_result("extract")
            .unwrap_err();
        assert!(matches!(error, ToolError::VerificationFailed { .. }));
    }
}
