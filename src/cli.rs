// CLI interface for rebound using clap
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde::Serialize;
use std::path::PathBuf;

use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::ErrorClassifier;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{exit_codes, CliError, ReboundError, Result};
use crate::executor::{plan_waves, normalize_definitions, CheckpointStore, ResultStream, Workflow};
use crate::ledger::AttemptLedger;
use crate::logging::{init_logging, LogConfig, LogFormat};
use crate::retry::{RetryContext, RetryDecision, RetryPolicyEngine};

#[derive(Parser)]
#[command(
    name = "rebound",
    about = "Rebound - retry, self-healing and wave scheduling for browser automation",
    version = crate::VERSION,
    long_about = "Rebound classifies tool failures, decides retries, learns which remediation strategies work, and inspects workflow runs and their checkpoints."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Engine configuration file (YAML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory holding strategies and runs
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Control color output (auto, always, never)
    #[arg(long, global = true, value_name = "WHEN")]
    pub color: Option<String>,

    /// Log format (pretty, json, compact)
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify an error message
    Classify {
        /// Raw error text as reported by the tool
        error: String,
    },

    /// Show the retry decision for an error at a given attempt
    Decide {
        error: String,

        /// Zero-based attempt index
        #[arg(long, default_value = "0")]
        attempt: u32,

        /// Circuit breaker key (domain or tool)
        #[arg(long, default_value = "cli")]
        key: String,
    },

    /// Validate a workflow file and print its dependency waves
    Plan {
        workflow: PathBuf,
    },

    /// Show a run's checkpoint
    Checkpoint {
        run_id: String,
    },

    /// Summarize a run's result stream
    Results {
        run_id: String,
    },

    /// List runs with a live checkpoint
    Runs,

    /// Show learned strategy statistics
    Stats,

    /// Generate shell completion scripts
    Completions {
        shell: Shell,
    },
}

#[derive(Serialize)]
struct Classification<'a> {
    error: &'a str,
    kind: crate::classifier::ErrorKind,
    permanent: bool,
    transient: bool,
}

impl Cli {
    pub fn run(&self) -> Result<i32> {
        self.init_logging()?;

        if self.verbose && self.quiet {
            return Err(ReboundError::Cli(Box::new(CliError::ConflictingArguments {
                first: "--verbose".to_string(),
                second: "--quiet".to_string(),
                suggestion: "Use either --verbose for more output or --quiet for less output, but not both".to_string(),
            })));
        }

        match &self.command {
            Commands::Classify { error } => self.classify(error),
            Commands::Decide {
                error,
                attempt,
                key,
            } => self.decide(error, *attempt, key),
            Commands::Plan { workflow } => self.plan(workflow),
            Commands::Checkpoint { run_id } => self.checkpoint(run_id),
            Commands::Results { run_id } => self.results(run_id),
            Commands::Runs => self.runs(),
            Commands::Stats => self.stats(),
            Commands::Completions { shell } => {
                let mut cmd = Self::command();
                let name = cmd.get_name().to_string();
                generate(*shell, &mut cmd, name, &mut std::io::stdout());
                Ok(exit_codes::SUCCESS)
            }
        }
    }

    fn init_logging(&self) -> Result<()> {
        let mut log_config = LogConfig::from_cli(self.verbose, self.quiet, self.color.clone());
        if let Some(format) = &self.log_format {
            let parsed = LogFormat::parse(format).ok_or_else(|| {
                ReboundError::Cli(Box::new(CliError::InvalidArgument {
                    argument: "--log-format".to_string(),
                    message: format!("unknown log format '{format}'"),
                    suggestion: Some("Use one of: pretty, json, compact".to_string()),
                }))
            })?;
            log_config = log_config.with_format(parsed);
        }
        init_logging(log_config);
        Ok(())
    }

    fn load_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.clone());
        }
        Ok(config)
    }

    fn checkpoint_store(&self) -> Result<CheckpointStore> {
        let config = self.load_config()?;
        Ok(CheckpointStore::new(config.storage.resolve_data_dir()?))
    }

    fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn classify(&self, error: &str) -> Result<i32> {
        let classifier = ErrorClassifier::new();
        let kind = classifier.classify(error);
        if self.json {
            self.print_json(&Classification {
                error,
                kind,
                permanent: kind.is_permanent(),
                transient: kind.is_transient(),
            })?;
        } else {
            let nature = if kind.is_permanent() {
                " (permanent)"
            } else if kind.is_transient() {
                " (transient)"
            } else {
                ""
            };
            println!("{kind}{nature}");
        }
        Ok(exit_codes::SUCCESS)
    }

    fn decide(&self, error: &str, attempt: u32, key: &str) -> Result<i32> {
        let config = self.load_config()?;
        let engine = RetryPolicyEngine::new(
            config.policy_table(),
            std::sync::Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            std::sync::Arc::new(AttemptLedger::new(config.ledger.capacity)),
        );
        let decision = engine.decide(error, attempt, &RetryContext::new(key, "cli"));

        if self.json {
            let value = match &decision {
                RetryDecision::Retry { delay, kind } => serde_json::json!({
                    "decision": "retry",
                    "kind": kind,
                    "delayMs": delay.as_millis() as u64,
                }),
                RetryDecision::Escalate(reason) => serde_json::json!({
                    "decision": "escalate",
                    "reason": reason,
                }),
                RetryDecision::CoolOff { remaining } => serde_json::json!({
                    "decision": "cool_off",
                    "remainingMs": remaining.as_millis() as u64,
                }),
            };
            self.print_json(&value)?;
        } else {
            match &decision {
                RetryDecision::Retry { delay, kind } => {
                    println!("retry after {}ms ({kind})", delay.as_millis())
                }
                RetryDecision::Escalate(reason) => println!("escalate: {reason}"),
                RetryDecision::CoolOff { remaining } => {
                    println!("cool off for {}ms", remaining.as_millis())
                }
            }
        }
        Ok(exit_codes::SUCCESS)
    }

    fn plan(&self, path: &std::path::Path) -> Result<i32> {
        let workflow = Workflow::from_file(path)?;
        let definitions = normalize_definitions(workflow.tasks)?;
        let plan = plan_waves(&definitions);

        if self.json {
            self.print_json(&plan)?;
        } else {
            for (index, wave) in plan.waves.iter().enumerate() {
                println!("wave {}: {}", index + 1, wave.join(", "));
            }
            if let Some(report) = &plan.unschedulable {
                eprintln!("{report}");
            }
        }

        Ok(if plan.unschedulable.is_some() {
            exit_codes::WORKFLOW_FAILED
        } else {
            exit_codes::SUCCESS
        })
    }

    fn checkpoint(&self, run_id: &str) -> Result<i32> {
        let checkpoint = self.checkpoint_store()?.find(run_id)?;
        if self.json {
            self.print_json(&checkpoint)?;
        } else {
            println!("run:       {}", checkpoint.workflow_id);
            println!("status:    {}", checkpoint.status);
            println!(
                "progress:  {}/{} completed, {} failed, {} skipped",
                checkpoint.completed, checkpoint.total, checkpoint.failed, checkpoint.skipped
            );
            println!("saved at:  {}", checkpoint.checkpoint_at.to_rfc3339());
            for (id, task) in &checkpoint.tasks {
                match &task.error {
                    Some(error) => println!("  {id}: {} ({error})", task.status),
                    None => println!("  {id}: {}", task.status),
                }
            }
        }
        Ok(exit_codes::SUCCESS)
    }

    fn results(&self, run_id: &str) -> Result<i32> {
        let store = self.checkpoint_store()?;
        let records = ResultStream::read_all(&store.results_path(run_id))?;
        let summary = ResultStream::summarize(&records);
        if self.json {
            self.print_json(&summary)?;
        } else {
            println!(
                "{} records for {} tasks: {} completed, {} failed, {} skipped",
                summary.records, summary.tasks, summary.completed, summary.failed, summary.skipped
            );
        }
        Ok(exit_codes::SUCCESS)
    }

    fn runs(&self) -> Result<i32> {
        let runs = self.checkpoint_store()?.list_runs()?;
        if self.json {
            self.print_json(&runs)?;
        } else {
            for run in runs {
                println!("{run}");
            }
        }
        Ok(exit_codes::SUCCESS)
    }

    fn stats(&self) -> Result<i32> {
        let engine = Engine::open(self.load_config()?)?;
        let stats = engine.learner().stats()?;
        if self.json {
            self.print_json(&stats)?;
        } else if stats.is_empty() {
            println!("no strategy outcomes recorded yet");
        } else {
            for row in &stats {
                println!(
                    "{:<20} {:<24} {:>4}/{:<4} {:>5.1}%",
                    row.error_kind.as_str(),
                    row.strategy.as_str(),
                    row.successes,
                    row.total,
                    row.success_rate() * 100.0
                );
            }
        }
        engine.shutdown()?;
        Ok(exit_codes::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_version() {
        // clap handles --version internally
        assert!(Cli::try_parse_from(["rebound", "--version"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["rebound"]).is_err());
    }

    #[test]
    fn test_cli_decide_defaults() {
        let cli = Cli::try_parse_from(["rebound", "decide", "timeout"]).unwrap();
        match cli.command {
            Commands::Decide { attempt, key, .. } => {
                assert_eq!(attempt, 0);
                assert_eq!(key, "cli");
            }
            _ => panic!("Expected Decide command"),
        }
        assert!(cli.config.is_none());
        assert!(!cli.json);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rebound",
            "stats",
            "--data-dir",
            "/tmp/x",
            "--json",
            "--color",
            "never",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(cli.json);
        assert_eq!(cli.color.as_deref(), Some("never"));
    }

    #[test]
    fn test_conflicting_verbosity() {
        let cli = Cli::try_parse_from(["rebound", "-v", "-q", "classify", "x"]).unwrap();
        let error = cli.run().unwrap_err();
        assert_eq!(error.exit_code(), exit_codes::CLI_ERROR);
    }
}
