// Persistence for learned remediation statistics and failure patterns
// SQLite-backed store for production plus an in-memory store for tests

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::pattern::FailurePattern;
use super::strategy::StrategyKind;
use crate::classifier::ErrorKind;
use crate::error::{ReboundError, Result, StorageError};

/// Current database schema version
const SCHEMA_VERSION: u32 = 1;

pub const DATABASE_FILE: &str = "strategies.db";

/// Ground-truth counters for one (error kind, strategy) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub error_kind: ErrorKind,
    pub strategy: StrategyKind,
    pub successes: u64,
    pub failures: u64,
    pub total: u64,
}

impl StrategyStats {
    pub fn new(error_kind: ErrorKind, strategy: StrategyKind) -> Self {
        Self {
            error_kind,
            strategy,
            successes: 0,
            failures: 0,
            total: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }

    fn observe(&mut self, success: bool) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total += 1;
    }
}

/// Backing store for the strategy learner. Writes are per-row upserts.
pub trait StrategyStore: Send + Sync {
    /// Increment the counters for one outcome and return the updated row
    fn record_outcome(
        &self,
        kind: ErrorKind,
        strategy: StrategyKind,
        success: bool,
    ) -> Result<StrategyStats>;

    fn stats_for(&self, kind: ErrorKind) -> Result<Vec<StrategyStats>>;

    fn all_stats(&self) -> Result<Vec<StrategyStats>>;

    fn upsert_pattern(&self, pattern: &FailurePattern) -> Result<()>;

    fn load_pattern(&self, signature_hash: &str) -> Result<Option<FailurePattern>>;

    fn patterns(&self) -> Result<Vec<FailurePattern>>;

    /// Push buffered writes to durable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// SQLite store in WAL mode
pub struct SqliteStrategyStore {
    path: Option<PathBuf>,
    connection: Mutex<Connection>,
}

impl SqliteStrategyStore {
    /// Open (or create) `strategies.db` inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        if !data_dir.exists() {
            fs::create_dir_all(data_dir).map_err(|e| {
                ReboundError::Storage(Box::new(StorageError::DirectoryFailed {
                    path: data_dir.to_path_buf(),
                    error: e.to_string(),
                }))
            })?;
        }
        let db_path = data_dir.join(DATABASE_FILE);
        let connection = Connection::open(&db_path).map_err(|e| {
            ReboundError::Storage(Box::new(StorageError::ConnectionFailed {
                message: e.to_string(),
                database_path: Some(db_path.clone()),
            }))
        })?;

        // journal_mode answers with the resulting mode
        let _mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        connection.pragma_update(None, "temp_store", "MEMORY")?;
        connection.busy_timeout(Duration::from_secs(30))?;
        Self::create_schema(&connection)?;

        debug!(path = %db_path.display(), "Opened strategy store");
        Ok(Self {
            path: Some(db_path),
            connection: Mutex::new(connection),
        })
    }

    /// In-memory SQLite database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().map_err(|e| {
            ReboundError::Storage(Box::new(StorageError::ConnectionFailed {
                message: e.to_string(),
                database_path: None,
            }))
        })?;
        Self::create_schema(&connection)?;
        Ok(Self {
            path: None,
            connection: Mutex::new(connection),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn create_schema(connection: &Connection) -> Result<()> {
        connection.execute(
            "CREATE TABLE IF NOT EXISTS strategy_stats (
                error_kind TEXT NOT NULL,
                strategy TEXT NOT NULL,
                successes INTEGER NOT NULL DEFAULT 0,
                failures INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT (cast(strftime('%s', 'now') as integer)),
                PRIMARY KEY (error_kind, strategy)
            )",
            [],
        )?;

        connection.execute(
            "CREATE TABLE IF NOT EXISTS failure_patterns (
                signature_hash TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                error_kind TEXT NOT NULL,
                normalized_error TEXT NOT NULL,
                occurrences INTEGER NOT NULL,
                strategies_tried TEXT NOT NULL DEFAULT '[]',
                successful_strategy TEXT,
                success_rate REAL NOT NULL DEFAULT 0,
                last_seen TEXT NOT NULL
            )",
            [],
        )?;

        connection.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL,
                applied_at INTEGER NOT NULL DEFAULT (cast(strftime('%s', 'now') as integer))
            )",
            [],
        )?;

        let existing: Option<u32> = connection
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .optional()?
            .flatten();
        if existing.is_none() {
            connection.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_failure_patterns_last_seen
             ON failure_patterns(last_seen)",
            [],
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32> {
        let connection = self.connection.lock();
        let version: Option<u32> = connection
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(version.unwrap_or(0))
    }

    fn row_to_stats(row: &Row) -> rusqlite::Result<Option<StrategyStats>> {
        let kind: String = row.get(0)?;
        let strategy: String = row.get(1)?;
        let (Some(error_kind), Some(strategy)) =
            (ErrorKind::parse(&kind), StrategyKind::parse(&strategy))
        else {
            warn!(kind = %kind, strategy = %strategy, "Ignoring unknown strategy stats row");
            return Ok(None);
        };
        Ok(Some(StrategyStats {
            error_kind,
            strategy,
            successes: row.get::<_, i64>(2)? as u64,
            failures: row.get::<_, i64>(3)? as u64,
            total: row.get::<_, i64>(4)? as u64,
        }))
    }

    fn row_to_pattern(row: &Row) -> rusqlite::Result<Option<FailurePattern>> {
        let kind: String = row.get(2)?;
        let Some(error_kind) = ErrorKind::parse(&kind) else {
            return Ok(None);
        };
        let tried: String = row.get(5)?;
        let last_seen: String = row.get(8)?;
        Ok(Some(FailurePattern {
            signature_hash: row.get(0)?,
            action: row.get(1)?,
            error_kind,
            normalized_error: row.get(3)?,
            occurrences: row.get::<_, i64>(4)? as u64,
            strategies_tried: serde_json::from_str(&tried).unwrap_or_default(),
            successful_strategy: row.get(6)?,
            success_rate: row.get(7)?,
            last_seen: DateTime::parse_from_rfc3339(&last_seen)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    fn query_stats(&self, sql: &str, kind: Option<ErrorKind>) -> Result<Vec<StrategyStats>> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare(sql)?;
        let rows = match kind {
            Some(kind) => stmt
                .query_map(params![kind.as_str()], Self::row_to_stats)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], Self::row_to_stats)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows.into_iter().flatten().collect())
    }
}

const PATTERN_COLUMNS: &str = "signature_hash, action, error_kind, normalized_error, occurrences, \
     strategies_tried, successful_strategy, success_rate, last_seen";

impl StrategyStore for SqliteStrategyStore {
    fn record_outcome(
        &self,
        kind: ErrorKind,
        strategy: StrategyKind,
        success: bool,
    ) -> Result<StrategyStats> {
        let (successes, failures) = if success { (1, 0) } else { (0, 1) };
        let connection = self.connection.lock();
        connection.execute(
            "INSERT INTO strategy_stats (error_kind, strategy, successes, failures, total, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, cast(strftime('%s', 'now') as integer))
             ON CONFLICT(error_kind, strategy) DO UPDATE SET
                successes = successes + excluded.successes,
                failures = failures + excluded.failures,
                total = total + 1,
                updated_at = excluded.updated_at",
            params![kind.as_str(), strategy.as_str(), successes, failures],
        )?;
        let stats = connection
            .query_row(
                "SELECT error_kind, strategy, successes, failures, total
                 FROM strategy_stats WHERE error_kind = ?1 AND strategy = ?2",
                params![kind.as_str(), strategy.as_str()],
                Self::row_to_stats,
            )?
            .unwrap_or_else(|| StrategyStats::new(kind, strategy));
        Ok(stats)
    }

    fn stats_for(&self, kind: ErrorKind) -> Result<Vec<StrategyStats>> {
        self.query_stats(
            "SELECT error_kind, strategy, successes, failures, total
             FROM strategy_stats WHERE error_kind = ?1 ORDER BY strategy",
            Some(kind),
        )
    }

    fn all_stats(&self) -> Result<Vec<StrategyStats>> {
        self.query_stats(
            "SELECT error_kind, strategy, successes, failures, total
             FROM strategy_stats ORDER BY error_kind, strategy",
            None,
        )
    }

    fn upsert_pattern(&self, pattern: &FailurePattern) -> Result<()> {
        let tried = serde_json::to_string(&pattern.strategies_tried)?;
        let connection = self.connection.lock();
        connection.execute(
            "INSERT INTO failure_patterns (signature_hash, action, error_kind, normalized_error,
                occurrences, strategies_tried, successful_strategy, success_rate, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(signature_hash) DO UPDATE SET
                occurrences = excluded.occurrences,
                strategies_tried = excluded.strategies_tried,
                successful_strategy = excluded.successful_strategy,
                success_rate = excluded.success_rate,
                last_seen = excluded.last_seen",
            params![
                pattern.signature_hash,
                pattern.action,
                pattern.error_kind.as_str(),
                pattern.normalized_error,
                pattern.occurrences as i64,
                tried,
                pattern.successful_strategy,
                pattern.success_rate,
                pattern.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_pattern(&self, signature_hash: &str) -> Result<Option<FailurePattern>> {
        let connection = self.connection.lock();
        let pattern = connection
            .query_row(
                &format!("SELECT {PATTERN_COLUMNS} FROM failure_patterns WHERE signature_hash = ?1"),
                params![signature_hash],
                Self::row_to_pattern,
            )
            .optional()?
            .flatten();
        Ok(pattern)
    }

    fn patterns(&self) -> Result<Vec<FailurePattern>> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM failure_patterns ORDER BY last_seen DESC"
        ))?;
        let rows = stmt
            .query_map([], Self::row_to_pattern)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    fn flush(&self) -> Result<()> {
        if self.path.is_none() {
            return Ok(());
        }
        let connection = self.connection.lock();
        // wal_checkpoint returns a row, so it cannot go through execute()
        connection.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Process-local store; contents are lost on drop
#[derive(Debug, Default)]
pub struct MemoryStrategyStore {
    stats: Mutex<HashMap<(ErrorKind, StrategyKind), StrategyStats>>,
    patterns: Mutex<HashMap<String, FailurePattern>>,
}

impl MemoryStrategyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StrategyStore for MemoryStrategyStore {
    fn record_outcome(
        &self,
        kind: ErrorKind,
        strategy: StrategyKind,
        success: bool,
    ) -> Result<StrategyStats> {
        let mut stats = self.stats.lock();
        let entry = stats
            .entry((kind, strategy))
            .or_insert_with(|| StrategyStats::new(kind, strategy));
        entry.observe(success);
        Ok(entry.clone())
    }

    fn stats_for(&self, kind: ErrorKind) -> Result<Vec<StrategyStats>> {
        let mut rows: Vec<_> = self
            .stats
            .lock()
            .values()
            .filter(|s| s.error_kind == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.strategy.as_str());
        Ok(rows)
    }

    fn all_stats(&self) -> Result<Vec<StrategyStats>> {
        let mut rows: Vec<_> = self.stats.lock().values().cloned().collect();
        rows.sort_by_key(|s| (s.error_kind.as_str(), s.strategy.as_str()));
        Ok(rows)
    }

    fn upsert_pattern(&self, pattern: &FailurePattern) -> Result<()> {
        self.patterns
            .lock()
            .insert(pattern.signature_hash.clone(), pattern.clone());
        Ok(())
    }

    fn load_pattern(&self, signature_hash: &str) -> Result<Option<FailurePattern>> {
        Ok(self.patterns.lock().get(signature_hash).cloned())
    }

    fn patterns(&self) -> Result<Vec<FailurePattern>> {
        let mut rows: Vec<_> = self.patterns.lock().values().cloned().collect();
        rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn StrategyStore) {
        store
            .record_outcome(ErrorKind::SelectorNotFound, StrategyKind::WaitForLoad, true)
            .unwrap();
        store
            .record_outcome(ErrorKind::SelectorNotFound, StrategyKind::WaitForLoad, false)
            .unwrap();
        let stats = store
            .record_outcome(ErrorKind::SelectorNotFound, StrategyKind::WaitForLoad, true)
            .unwrap();
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total, 3);

        store
            .record_outcome(ErrorKind::NetworkTimeout, StrategyKind::ShortWait, true)
            .unwrap();
        assert_eq!(store.stats_for(ErrorKind::SelectorNotFound).unwrap().len(), 1);
        assert_eq!(store.all_stats().unwrap().len(), 2);

        let mut pattern = FailurePattern::new("click", ErrorKind::SelectorNotFound, "no node 42");
        pattern.observe_occurrence();
        store.upsert_pattern(&pattern).unwrap();
        pattern.observe_outcome("wait_for_load", true, 0.2);
        store.upsert_pattern(&pattern).unwrap();

        let loaded = store.load_pattern(&pattern.signature_hash).unwrap().unwrap();
        assert_eq!(loaded.occurrences, 1);
        assert_eq!(loaded.strategies_tried, vec!["wait_for_load".to_string()]);
        assert!((loaded.success_rate - 0.2).abs() < 1e-9);
        assert_eq!(store.patterns().unwrap().len(), 1);
        assert!(store.load_pattern("missing").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStrategyStore::new());
    }

    #[test]
    fn test_sqlite_in_memory_store() {
        let store = SqliteStrategyStore::in_memory().unwrap();
        exercise(&store);
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SqliteStrategyStore::open(temp_dir.path()).unwrap();
            store
                .record_outcome(ErrorKind::NotFound, StrategyKind::ForceHttps, true)
                .unwrap();
            store.flush().unwrap();
        }
        let store = SqliteStrategyStore::open(temp_dir.path()).unwrap();
        let stats = store.stats_for(ErrorKind::NotFound).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].strategy, StrategyKind::ForceHttps);
        assert_eq!(stats[0].total, 1);
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }
}
