// Sub-task and workflow run model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::error::{ConfigError, ReboundError, Result, WorkflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Immutable description of one sub-task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default, alias = "sequenceNumber")]
    pub step: u64,
    pub action: String,
    #[serde(alias = "toolName")]
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, action: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step: 0,
            action: action.into(),
            tool: tool.into(),
            args: Value::Object(Default::default()),
            depends_on: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A workflow file: an optional id plus its task list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: Option<String>,
    pub tasks: Vec<TaskDefinition>,
}

impl Workflow {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let workflow: Workflow = serde_yaml::from_str(content).map_err(Box::<ConfigError>::from)?;
        Ok(workflow)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReboundError::Config(Box::new(ConfigError::NotFound {
                    path: path.to_path_buf(),
                    suggestion: Some("Check the workflow file path".to_string()),
                }))
            } else {
                ReboundError::Io(e)
            }
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            let location = e.location();
            ReboundError::Config(Box::new(ConfigError::InvalidYaml {
                message: e.to_string(),
                line: location.as_ref().map(|l| l.line() as u32),
                column: location.as_ref().map(|l| l.column() as u32),
                file_path: Some(path.to_path_buf()),
            }))
        })
    }
}

/// Reject empty task lists and duplicate ids; numbers unset steps in order
pub fn normalize_definitions(mut definitions: Vec<TaskDefinition>) -> Result<Vec<TaskDefinition>> {
    if definitions.is_empty() {
        return Err(ReboundError::Workflow(Box::new(WorkflowError::EmptyWorkflow)));
    }
    let mut seen = HashSet::new();
    for (index, definition) in definitions.iter_mut().enumerate() {
        if !seen.insert(definition.id.clone()) {
            return Err(ReboundError::Workflow(Box::new(WorkflowError::DuplicateTask {
                task_id: definition.id.clone(),
            })));
        }
        if definition.step == 0 {
            definition.step = index as u64 + 1;
        }
    }
    Ok(definitions)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    pub sequence_number: u64,
    pub action: String,
    pub tool_name: String,
    pub args: Value,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    pub fn from_definition(definition: TaskDefinition) -> Self {
        Self {
            id: definition.id,
            sequence_number: definition.step,
            action: definition.action,
            tool_name: definition.tool,
            args: definition.args,
            depends_on: definition.depends_on,
            status: TaskStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn definition(&self) -> TaskDefinition {
        TaskDefinition {
            id: self.id.clone(),
            step: self.sequence_number,
            action: self.action.clone(),
            tool: self.tool_name.clone(),
            args: self.args.clone(),
            depends_on: self.depends_on.clone(),
        }
    }

    pub(crate) fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

/// A pending task that can never become ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckTask {
    pub id: String,
    pub unmet_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckReport {
    pub pending: Vec<StuckTask>,
    pub cycles: Vec<Vec<String>>,
}

impl fmt::Display for StuckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) can never run:", self.pending.len())?;
        for task in &self.pending {
            write!(f, " {} (waiting on {})", task.id, task.unmet_dependencies.join(", "))?;
        }
        for cycle in &self.cycles {
            write!(f, "; cycle: {}", cycle.join(" -> "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub tasks: BTreeMap<String, SubTask>,
    #[serde(default)]
    pub stuck: Option<StuckReport>,
}

impl WorkflowRun {
    pub fn new(id: impl Into<String>, definitions: Vec<TaskDefinition>) -> Self {
        let tasks: BTreeMap<String, SubTask> = definitions
            .into_iter()
            .map(|d| (d.id.clone(), SubTask::from_definition(d)))
            .collect();
        let mut run = Self {
            id: id.into(),
            total_tasks: tasks.len(),
            completed: 0,
            failed: 0,
            skipped: 0,
            status: RunStatus::Running,
            started_at: Utc::now(),
            tasks,
            stuck: None,
        };
        run.recount();
        run
    }

    pub fn recount(&mut self) {
        let count = |status| self.tasks.values().filter(|t| t.status == status).count();
        self.total_tasks = self.tasks.len();
        self.completed = count(TaskStatus::Completed);
        self.failed = count(TaskStatus::Failed);
        self.skipped = count(TaskStatus::Skipped);
    }

    pub fn task(&self, id: &str) -> Option<&SubTask> {
        self.tasks.get(id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }
}
