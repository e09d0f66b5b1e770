// Durable run checkpoints and per-run locking
// Layout under the data directory:
//   runs/<run-id>/checkpoint.json   latest snapshot
//   runs/<run-id>/results.ndjson    streamed task results
//   runs/<run-id>/run.lock          advisory lock held by the driving process
//   archive/<run-id>.json           checkpoint of a completed run

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::task::{RunStatus, SubTask, TaskDefinition, TaskStatus, WorkflowRun};
use crate::error::{CheckpointError, ReboundError, Result, WorkflowError};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const RESULTS_FILE: &str = "results.ndjson";
const LOCK_FILE: &str = "run.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCheckpoint {
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub definition: Option<TaskDefinition>,
}

/// Snapshot of run progress; unknown fields are ignored on load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub workflow_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(default)]
    pub skipped: usize,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub checkpoint_at: DateTime<Utc>,
    pub tasks: BTreeMap<String, TaskCheckpoint>,
}

impl Checkpoint {
    /// In-flight tasks are recorded as pending so a resume re-runs them
    pub fn from_run(run: &WorkflowRun) -> Self {
        let tasks = run
            .tasks
            .values()
            .map(|task| {
                let status = match task.status {
                    TaskStatus::Running => TaskStatus::Pending,
                    other => other,
                };
                (
                    task.id.clone(),
                    TaskCheckpoint {
                        status,
                        attempts: task.attempts,
                        error: task.error.clone(),
                        definition: Some(task.definition()),
                    },
                )
            })
            .collect();
        Self {
            workflow_id: run.id.clone(),
            total: run.total_tasks,
            completed: run.completed,
            failed: run.failed,
            skipped: run.skipped,
            status: run.status,
            started_at: run.started_at,
            checkpoint_at: Utc::now(),
            tasks,
        }
    }

    /// Rebuild the run; every task must carry its definition
    pub fn into_run(self, path: &Path) -> Result<WorkflowRun> {
        let mut tasks = BTreeMap::new();
        for (id, saved) in self.tasks {
            let definition = saved.definition.ok_or_else(|| {
                ReboundError::Checkpoint(Box::new(CheckpointError::Corrupt {
                    path: path.to_path_buf(),
                    error: format!("task {id} has no definition"),
                }))
            })?;
            let mut task = SubTask::from_definition(definition);
            task.status = saved.status;
            task.attempts = saved.attempts;
            task.error = saved.error;
            tasks.insert(id, task);
        }
        let mut run = WorkflowRun {
            id: self.workflow_id,
            total_tasks: tasks.len(),
            completed: 0,
            failed: 0,
            skipped: 0,
            status: self.status,
            started_at: self.started_at,
            tasks,
            stuck: None,
        };
        run.recount();
        Ok(run)
    }
}

/// Held while a process drives a run; released on drop
#[derive(Debug)]
pub struct RunLock {
    file: fs::File,
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Filesystem home of checkpoints and result streams
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    pub fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(CHECKPOINT_FILE)
    }

    pub fn results_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(RESULTS_FILE)
    }

    pub fn archive_path(&self, run_id: &str) -> PathBuf {
        self.root.join("archive").join(format!("{run_id}.json"))
    }

    fn ensure_dir(path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| {
            ReboundError::Checkpoint(Box::new(CheckpointError::WriteFailed {
                path: path.to_path_buf(),
                error: e.to_string(),
            }))
        })
    }

    /// Take the per-run advisory lock without blocking
    pub fn lock(&self, run_id: &str) -> Result<RunLock> {
        let dir = self.run_dir(run_id);
        Self::ensure_dir(&dir)?;
        let path = dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            ReboundError::Workflow(Box::new(WorkflowError::RunLocked {
                run_id: run_id.to_string(),
                lock_path: path.clone(),
            }))
        })?;
        debug!(run_id = %run_id, "Acquired run lock");
        Ok(RunLock { file, path })
    }

    /// Write a snapshot atomically (temp file then rename)
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let _guard = self.write_lock.lock();
        let dir = self.run_dir(&checkpoint.workflow_id);
        Self::ensure_dir(&dir)?;
        let path = dir.join(CHECKPOINT_FILE);
        let write_failed = |error: String| {
            ReboundError::Checkpoint(Box::new(CheckpointError::WriteFailed {
                path: path.clone(),
                error,
            }))
        };

        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| write_failed(e.to_string()))?;
        serde_json::to_writer_pretty(&mut temp, checkpoint)?;
        temp.flush().map_err(|e| write_failed(e.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| write_failed(e.to_string()))?;
        temp.persist(&path)
            .map_err(|e| write_failed(e.error.to_string()))?;

        debug!(
            run_id = %checkpoint.workflow_id,
            completed = checkpoint.completed,
            status = %checkpoint.status,
            "Checkpoint written"
        );
        Ok(path)
    }

    fn read(path: &Path) -> Result<Checkpoint> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            ReboundError::Checkpoint(Box::new(CheckpointError::Corrupt {
                path: path.to_path_buf(),
                error: e.to_string(),
            }))
        })
    }

    /// Active checkpoint only
    pub fn load(&self, run_id: &str) -> Result<Checkpoint> {
        let path = self.checkpoint_path(run_id);
        if !path.exists() {
            return Err(ReboundError::Checkpoint(Box::new(CheckpointError::NotFound {
                run_id: run_id.to_string(),
                path,
            })));
        }
        Self::read(&path)
    }

    /// Active checkpoint, falling back to the archive
    pub fn find(&self, run_id: &str) -> Result<Checkpoint> {
        let archived = self.archive_path(run_id);
        if !self.checkpoint_path(run_id).exists() && archived.exists() {
            return Self::read(&archived);
        }
        self.load(run_id)
    }

    pub fn load_run(&self, run_id: &str) -> Result<WorkflowRun> {
        let path = self.checkpoint_path(run_id);
        self.load(run_id)?.into_run(&path)
    }

    /// Move a finished run's checkpoint into `archive/`
    pub fn archive(&self, run_id: &str) -> Result<PathBuf> {
        let _guard = self.write_lock.lock();
        let from = self.checkpoint_path(run_id);
        let to = self.archive_path(run_id);
        if let Some(parent) = to.parent() {
            Self::ensure_dir(parent)?;
        }
        fs::rename(&from, &to).map_err(|e| {
            ReboundError::Checkpoint(Box::new(CheckpointError::WriteFailed {
                path: to.clone(),
                error: e.to_string(),
            }))
        })?;
        info!(run_id = %run_id, path = %to.display(), "Archived completed run");
        Ok(to)
    }

    /// Ids of runs with an active checkpoint
    pub fn list_runs(&self) -> Result<Vec<String>> {
        let runs_dir = self.root.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if entry.path().join(CHECKPOINT_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
