// Error handling framework for Rebound
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReboundError>;

/// Main error type for Rebound
#[derive(Debug, Error)]
pub enum ReboundError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<ConfigError>),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] Box<StorageError>),

    #[error("Workflow error: {0}")]
    Workflow(#[from] Box<WorkflowError>),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] Box<CheckpointError>),

    #[error("Escalation error: {0}")]
    Escalation(#[from] Box<EscalationError>),

    #[error("CLI argument error: {0}")]
    Cli(#[from] Box<CliError>),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid YAML syntax: {message}")]
    InvalidYaml {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
        file_path: Option<PathBuf>,
    },

    #[error("Configuration file not found: {path}")]
    NotFound {
        path: PathBuf,
        suggestion: Option<String>,
    },

    #[error("Invalid configuration value: {message}")]
    InvalidValue {
        message: String,
        field: String,
        value: String,
        expected: String,
    },

    #[error("Data directory unavailable: {message}")]
    DataDirectory { message: String },
}

/// Strategy store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    ConnectionFailed {
        message: String,
        database_path: Option<PathBuf>,
    },

    #[error("Database query failed: {query}")]
    QueryFailed {
        query: String,
        error: String,
        database_path: Option<PathBuf>,
    },

    #[error("Store directory creation failed: {path}")]
    DirectoryFailed { path: PathBuf, error: String },

    #[error("Store lock poisoned: {operation}")]
    LockPoisoned { operation: String },
}

/// Task graph and workflow scheduling errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Duplicate task id: {task_id}")]
    DuplicateTask { task_id: String },

    #[error("Workflow is empty")]
    EmptyWorkflow,

    #[error("Workflow file could not be parsed: {message}")]
    InvalidDefinition {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Run {run_id} is already active in another process")]
    RunLocked { run_id: String, lock_path: PathBuf },

    #[error("Run {run_id} already finished with status {status}")]
    AlreadyFinished { run_id: String, status: String },
}

/// Checkpoint and result stream persistence errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found for run {run_id}")]
    NotFound { run_id: String, path: PathBuf },

    #[error("Checkpoint is corrupt: {path}")]
    Corrupt { path: PathBuf, error: String },

    #[error("Checkpoint write failed: {path}")]
    WriteFailed { path: PathBuf, error: String },

    #[error("Result stream append failed: {path}")]
    AppendFailed { path: PathBuf, error: String },
}

/// Operator escalation errors
#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("Guidance choice requires guidance text")]
    MissingGuidance,

    #[error("Operator channel closed before a resolution arrived: {action}")]
    ChannelClosed { action: String },
}

/// CLI argument and command-line interface errors
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid argument: {argument}")]
    InvalidArgument {
        argument: String,
        message: String,
        suggestion: Option<String>,
    },

    #[error("Conflicting arguments: {first} and {second}")]
    ConflictingArguments {
        first: String,
        second: String,
        suggestion: String,
    },
}

/// Typed failure returned by a tool invoker.
///
/// The `Display` text is what the classifier sees, so variants keep the
/// underlying browser/tool message intact.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("{message}")]
    Failed { tool: String, message: String },

    #[error("{tool} call cancelled")]
    Cancelled { tool: String },

    #[error("result verification failed for {tool}: {reason}")]
    VerificationFailed { tool: String, reason: String },
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        ToolError::Failed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn tool(&self) -> &str {
        match self {
            ToolError::Timeout { tool, .. }
            | ToolError::Failed { tool, .. }
            | ToolError::Cancelled { tool }
            | ToolError::VerificationFailed { tool, .. } => tool,
        }
    }
}

/// Format errors with colors and context
pub struct ErrorFormatter {
    use_colors: bool,
}

impl ErrorFormatter {
    pub fn new(use_colors: bool) -> Self {
        Self { use_colors }
    }

    /// Format an error with context and colors
    pub fn format_error(&self, error: &ReboundError) -> String {
        use tracing::error;

        let error_type = match error {
            ReboundError::Config(_) => "config",
            ReboundError::Storage(_) => "storage",
            ReboundError::Workflow(_) => "workflow",
            ReboundError::Checkpoint(_) => "checkpoint",
            ReboundError::Escalation(_) => "escalation",
            ReboundError::Cli(_) => "cli",
            ReboundError::Io(_) => "io",
            ReboundError::Json(_) => "json",
        };
        error!(error_type = error_type, error = %error, "Operation failed");

        let mut output = String::new();
        if self.use_colors {
            output.push_str("\x1b[31m");
        }
        output.push_str("Error: ");
        if self.use_colors {
            output.push_str("\x1b[0m");
        }
        output.push_str(&error.to_string());

        match error {
            ReboundError::Config(config_err) => match config_err.as_ref() {
                ConfigError::InvalidYaml {
                    file_path: Some(path),
                    line: Some(line),
                    ..
                } => output.push_str(&format!("\n  --> {}:{}", path.display(), line)),
                ConfigError::NotFound {
                    suggestion: Some(suggestion),
                    ..
                } => output.push_str(&format!("\n  Help: {suggestion}")),
                ConfigError::InvalidValue {
                    field, expected, ..
                } => output.push_str(&format!("\n  Help: {field} must be {expected}")),
                _ => {}
            },
            ReboundError::Storage(storage_err) => {
                if let StorageError::QueryFailed { error, .. } = storage_err.as_ref() {
                    output.push_str(&format!("\n  SQLite: {error}"));
                }
            }
            ReboundError::Workflow(workflow_err) => {
                if let WorkflowError::RunLocked { lock_path, .. } = workflow_err.as_ref() {
                    output.push_str(&format!(
                        "\n  Help: another process holds {}",
                        lock_path.display()
                    ));
                }
            }
            ReboundError::Checkpoint(checkpoint_err) => match checkpoint_err.as_ref() {
                CheckpointError::NotFound { path, .. } => {
                    output.push_str(&format!("\n  Looked in: {}", path.display()))
                }
                CheckpointError::Corrupt { error, .. } => {
                    output.push_str(&format!("\n  Parse error: {error}"))
                }
                _ => {}
            },
            ReboundError::Cli(cli_err) => match cli_err.as_ref() {
                CliError::InvalidArgument {
                    suggestion: Some(suggestion),
                    ..
                }
                | CliError::ConflictingArguments { suggestion, .. } => {
                    output.push_str(&format!("\n  Help: {suggestion}"))
                }
                _ => {}
            },
            _ => {}
        }

        output
    }
}

/// Process exit codes
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const WORKFLOW_FAILED: i32 = 3;
    pub const STORAGE_ERROR: i32 = 4;
    pub const CHECKPOINT_ERROR: i32 = 5;
    pub const ESCALATION_ERROR: i32 = 6;
    pub const CLI_ERROR: i32 = 7;
    pub const LOCK_ERROR: i32 = 8;
}

impl ReboundError {
    /// Get the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ReboundError::Config(_) => exit_codes::CONFIG_ERROR,
            ReboundError::Storage(_) => exit_codes::STORAGE_ERROR,
            ReboundError::Workflow(workflow_err) => match workflow_err.as_ref() {
                WorkflowError::RunLocked { .. } => exit_codes::LOCK_ERROR,
                _ => exit_codes::WORKFLOW_FAILED,
            },
            ReboundError::Checkpoint(_) => exit_codes::CHECKPOINT_ERROR,
            ReboundError::Escalation(_) => exit_codes::ESCALATION_ERROR,
            ReboundError::Cli(_) => exit_codes::CLI_ERROR,
            ReboundError::Io(_) | ReboundError::Json(_) => exit_codes::GENERAL_ERROR,
        }
    }

    /// Create a user-friendly error message with context
    pub fn user_message(&self, use_colors: bool) -> String {
        ErrorFormatter::new(use_colors).format_error(self)
    }
}

impl From<serde_yaml::Error> for Box<ConfigError> {
    fn from(error: serde_yaml::Error) -> Self {
        let location = error.location();
        Box::new(ConfigError::InvalidYaml {
            message: error.to_string(),
            line: location.as_ref().map(|l| l.line() as u32),
            column: location.as_ref().map(|l| l.column() as u32),
            file_path: None,
        })
    }
}

impl From<rusqlite::Error> for Box<StorageError> {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::SqliteFailure(sqlite_error, message) => {
                Box::new(StorageError::QueryFailed {
                    query: "SQLite operation".to_string(),
                    error: message.unwrap_or_else(|| format!("SQLite error: {sqlite_error:?}")),
                    database_path: None,
                })
            }
            rusqlite::Error::InvalidPath(path) => Box::new(StorageError::ConnectionFailed {
                message: format!("Invalid database path: {}", path.display()),
                database_path: Some(path),
            }),
            _ => Box::new(StorageError::QueryFailed {
                query: "Database operation".to_string(),
                error: error.to_string(),
                database_path: None,
            }),
        }
    }
}

impl From<rusqlite::Error> for ReboundError {
    fn from(error: rusqlite::Error) -> Self {
        ReboundError::Storage(Box::<StorageError>::from(error))
    }
}
