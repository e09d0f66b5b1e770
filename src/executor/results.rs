// Append-only NDJSON result stream

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::task::{SubTask, TaskStatus};
use crate::error::{CheckpointError, ReboundError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub step: u64,
    pub action: String,
    pub tool: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    pub fn from_task(task: &SubTask) -> Self {
        Self {
            id: task.id.clone(),
            step: task.sequence_number,
            action: task.action.clone(),
            tool: task.tool_name.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            attempts: task.attempts,
            timestamp: task.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Serialized appender; each record is written and flushed as one line
#[derive(Debug)]
pub struct ResultSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResultSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| append_failed(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ResultRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|e| append_failed(&self.path, e))
    }
}

fn append_failed(path: &Path, error: std::io::Error) -> ReboundError {
    ReboundError::Checkpoint(Box::new(CheckpointError::AppendFailed {
        path: path.to_path_buf(),
        error: error.to_string(),
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub records: usize,
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Reader for result stream files
pub struct ResultStream;

impl ResultStream {
    /// All records in order. A torn final line from a crash mid-append is
    /// dropped; corruption anywhere else is an error.
    pub fn read_all(path: &Path) -> Result<Vec<ResultRecord>> {
        let content = fs::read_to_string(path)?;
        let lines: Vec<&str> = content.lines().collect();
        let terminated = content.ends_with('\n');
        let mut records = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ResultRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if index + 1 == lines.len() && !terminated => {
                    warn!(path = %path.display(), error = %e, "Ignoring torn final result line");
                }
                Err(e) => {
                    return Err(ReboundError::Checkpoint(Box::new(CheckpointError::Corrupt {
                        path: path.to_path_buf(),
                        error: format!("line {}: {e}", index + 1),
                    })));
                }
            }
        }
        Ok(records)
    }

    /// Counts by final status; a task retried on resume counts once
    pub fn summarize(records: &[ResultRecord]) -> ResultSummary {
        let mut latest: HashMap<&str, TaskStatus> = HashMap::new();
        for record in records {
            latest.insert(record.id.as_str(), record.status);
        }
        let count = |status| latest.values().filter(|s| **s == status).count();
        ResultSummary {
            records: records.len(),
            tasks: latest.len(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
        }
    }
}
