//! SQLite-backed ledger.

use super::traits::{LedgerRecord, LedgerStatus, LedgerStore, RunInfo};
use crate::error::{MigrateError, Result};
use crate::model::{Entity, EntityKind};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const RECORD_COLUMNS: &str = "run_id, source_id, kind, label, parent_source_id, status, \
     destination_id, last_error, attempt_count, updated_at";

type RawRecord = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    i64,
    String,
);

type RawRun = (String, String, String, Option<String>, Option<String>);

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MigrateError::Database {
            message: format!("Invalid timestamp '{}' in ledger: {}", value, e),
            source: None,
        })
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn into_record(raw: RawRecord) -> Result<LedgerRecord> {
    let (
        run_id,
        source_id,
        kind,
        label,
        parent_source_id,
        status,
        destination_id,
        last_error,
        attempt_count,
        updated_at,
    ) = raw;
    let kind = EntityKind::parse(&kind).ok_or_else(|| MigrateError::Database {
        message: format!("Unknown entity kind '{}' in ledger", kind),
        source: None,
    })?;
    let status = LedgerStatus::parse(&status).ok_or_else(|| MigrateError::Database {
        message: format!("Unknown status '{}' in ledger", status),
        source: None,
    })?;
    Ok(LedgerRecord {
        run_id,
        source_id,
        kind,
        label,
        parent_source_id,
        status,
        destination_id,
        last_error,
        attempt_count: attempt_count.max(0) as u32,
        updated_at: parse_time(&updated_at)?,
    })
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_run(raw: RawRun) -> Result<RunInfo> {
    let (run_id, projects, started_at, finished_at, outcome) = raw;
    let projects: Vec<String> = serde_json::from_str(&projects)?;
    Ok(RunInfo {
        run_id,
        projects,
        started_at: parse_time(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_time).transpose()?,
        outcome,
    })
}

/// Ledger persisted in a SQLite database.
///
/// Thread-safe via an internal mutex on the connection; every statement is
/// committed before the call returns.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create the ledger at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| MigrateError::Io {
                    message: format!("Failed to create ledger directory: {}", e),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| MigrateError::Database {
            message: format!("Failed to open ledger database: {}", e),
            source: Some(e),
        })?;
        Self::with_connection(conn)
    }

    /// Ledger in a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| MigrateError::Database {
            message: format!("Failed to open in-memory ledger: {}", e),
            source: Some(e),
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // WAL keeps readers off the writer's back; FULL makes each commit durable
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| MigrateError::Database {
            message: format!("Failed to lock ledger: {}", e),
            source: None,
        })
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                projects TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                outcome TEXT
            );

            CREATE TABLE IF NOT EXISTS entities (
                run_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                label TEXT NOT NULL,
                parent_source_id TEXT,
                status TEXT NOT NULL,
                destination_id TEXT,
                last_error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (run_id, source_id)
            );

            CREATE INDEX IF NOT EXISTS idx_entities_status
                ON entities(run_id, status);
            "#,
        )
        .map_err(|e| MigrateError::Database {
            message: format!("Failed to initialize ledger schema: {}", e),
            source: Some(e),
        })
    }

    fn get_locked(conn: &Connection, run_id: &str, source_id: &str) -> Result<Option<LedgerRecord>> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM entities WHERE run_id = ?1 AND source_id = ?2",
                    RECORD_COLUMNS
                ),
                params![run_id, source_id],
                read_record,
            )
            .optional()
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to query ledger record: {}", e),
                source: Some(e),
            })?;
        raw.map(into_record).transpose()
    }

    fn unknown(run_id: &str, source_id: &str) -> MigrateError {
        MigrateError::Database {
            message: format!("No ledger record for {} in run {}", source_id, run_id),
            source: None,
        }
    }
}

impl LedgerStore for SqliteLedger {
    fn begin_run(&self, run: &RunInfo) -> Result<()> {
        let conn = self.lock()?;
        let projects = serde_json::to_string(&run.projects)?;
        conn.execute(
            "INSERT OR IGNORE INTO runs (run_id, projects, started_at) VALUES (?1, ?2, ?3)",
            params![run.run_id, projects, run.started_at.to_rfc3339()],
        )
        .map_err(|e| MigrateError::Database {
            message: format!("Failed to record run: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn finish_run(&self, run_id: &str, outcome: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET finished_at = ?1, outcome = ?2 WHERE run_id = ?3",
            params![Utc::now().to_rfc3339(), outcome, run_id],
        )
        .map_err(|e| MigrateError::Database {
            message: format!("Failed to finish run: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    fn run(&self, run_id: &str) -> Result<Option<RunInfo>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT run_id, projects, started_at, finished_at, outcome FROM runs WHERE run_id = ?1",
                params![run_id],
                read_run,
            )
            .optional()
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to query run: {}", e),
                source: Some(e),
            })?;
        raw.map(into_run).transpose()
    }

    fn latest_run(&self) -> Result<Option<RunInfo>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                r#"
                SELECT run_id, projects, started_at, finished_at, outcome
                FROM runs
                ORDER BY started_at DESC, rowid DESC
                LIMIT 1
                "#,
                [],
                read_run,
            )
            .optional()
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to query latest run: {}", e),
                source: Some(e),
            })?;
        raw.map(into_run).transpose()
    }

    fn get(&self, run_id: &str, source_id: &str) -> Result<Option<LedgerRecord>> {
        let conn = self.lock()?;
        Self::get_locked(&conn, run_id, source_id)
    }

    fn register(&self, run_id: &str, entity: &Entity) -> Result<LedgerRecord> {
        let conn = self.lock()?;
        let record = LedgerRecord::pending(run_id, entity);
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO entities ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    RECORD_COLUMNS
                ),
                params![
                    record.run_id,
                    record.source_id,
                    record.kind.as_str(),
                    record.label,
                    record.parent_source_id,
                    record.status.as_str(),
                    record.destination_id,
                    record.last_error,
                    record.attempt_count,
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to register {}: {}", entity.source_id, e),
                source: Some(e),
            })?;

        if inserted > 0 {
            debug!("Registered {} as pending", entity.describe());
            return Ok(record);
        }
        Self::get_locked(&conn, run_id, &entity.source_id)?
            .ok_or_else(|| Self::unknown(run_id, &entity.source_id))
    }

    fn mark(
        &self,
        run_id: &str,
        source_id: &str,
        status: LedgerStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let increment = i64::from(status == LedgerStatus::InProgress);
        let updated = conn
            .execute(
                r#"
                UPDATE entities
                SET status = ?1, last_error = ?2, attempt_count = attempt_count + ?3, updated_at = ?4
                WHERE run_id = ?5 AND source_id = ?6
                "#,
                params![
                    status.as_str(),
                    error,
                    increment,
                    Utc::now().to_rfc3339(),
                    run_id,
                    source_id
                ],
            )
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to mark {} {}: {}", source_id, status, e),
                source: Some(e),
            })?;
        if updated == 0 {
            return Err(Self::unknown(run_id, source_id));
        }
        Ok(())
    }

    fn complete(&self, run_id: &str, source_id: &str, destination_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                r#"
                UPDATE entities
                SET status = ?1, destination_id = ?2, last_error = NULL, updated_at = ?3
                WHERE run_id = ?4 AND source_id = ?5
                "#,
                params![
                    LedgerStatus::Done.as_str(),
                    destination_id,
                    Utc::now().to_rfc3339(),
                    run_id,
                    source_id
                ],
            )
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to complete {}: {}", source_id, e),
                source: Some(e),
            })?;
        if updated == 0 {
            return Err(Self::unknown(run_id, source_id));
        }
        Ok(())
    }

    fn snapshot(&self, run_id: &str) -> Result<Vec<LedgerRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM entities WHERE run_id = ?1 ORDER BY rowid",
                RECORD_COLUMNS
            ))
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to prepare snapshot query: {}", e),
                source: Some(e),
            })?;
        let rows = stmt
            .query_map(params![run_id], read_record)
            .map_err(|e| MigrateError::Database {
                message: format!("Failed to read ledger: {}", e),
                source: Some(e),
            })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(into_record(row?)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_ledger() -> (TempDir, SqliteLedger) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = SqliteLedger::open(temp_dir.path().join("ledger.sqlite")).unwrap();
        (temp_dir, ledger)
    }

    fn subject() -> Entity {
        Entity::child(EntityKind::Subject, "XNAT_S1", "S1", "P1")
    }

    #[test]
    fn test_register_is_idempotent() {
        let (_temp, ledger) = create_test_ledger();
        let first = ledger.register("run1", &subject()).unwrap();
        assert_eq!(first.status, LedgerStatus::Pending);

        ledger.mark("run1", "XNAT_S1", LedgerStatus::InProgress, None).unwrap();
        let again = ledger.register("run1", &subject()).unwrap();
        assert_eq!(again.status, LedgerStatus::InProgress);
        assert_eq!(again.attempt_count, 1);
        assert_eq!(ledger.snapshot("run1").unwrap().len(), 1);
    }

    #[test]
    fn test_complete_records_destination() {
        let (_temp, ledger) = create_test_ledger();
        ledger.register("run1", &subject()).unwrap();
        ledger
            .mark("run1", "XNAT_S1", LedgerStatus::InProgress, Some("retrying"))
            .unwrap();
        ledger.complete("run1", "XNAT_S1", "DEST_S1").unwrap();

        let record = ledger.get("run1", "XNAT_S1").unwrap().unwrap();
        assert_eq!(record.status, LedgerStatus::Done);
        assert_eq!(record.destination_id.as_deref(), Some("DEST_S1"));
        assert!(record.last_error.is_none());
        assert_eq!(record.parent_source_id.as_deref(), Some("P1"));
    }

    #[test]
    fn test_runs_are_isolated() {
        let (_temp, ledger) = create_test_ledger();
        ledger.register("run1", &subject()).unwrap();
        ledger.complete("run1", "XNAT_S1", "DEST_S1").unwrap();

        assert!(ledger.get("run2", "XNAT_S1").unwrap().is_none());
        assert!(ledger.mark("run2", "XNAT_S1", LedgerStatus::Failed, None).is_err());
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.sqlite");
        {
            let ledger = SqliteLedger::open(&path).unwrap();
            ledger.begin_run(&RunInfo::new("run1", vec!["P1:P1".into()])).unwrap();
            ledger.register("run1", &subject()).unwrap();
            ledger.complete("run1", "XNAT_S1", "DEST_S1").unwrap();
        }

        let ledger = SqliteLedger::open(&path).unwrap();
        let run = ledger.latest_run().unwrap().unwrap();
        assert_eq!(run.run_id, "run1");
        assert_eq!(run.projects, vec!["P1:P1".to_string()]);
        assert_eq!(
            ledger.get("run1", "XNAT_S1").unwrap().unwrap().status,
            LedgerStatus::Done
        );
    }

    #[test]
    fn test_finish_run_and_counts() {
        let (_temp, ledger) = create_test_ledger();
        ledger.begin_run(&RunInfo::new("run1", vec![])).unwrap();
        ledger.register("run1", &Entity::project("P1", "P1")).unwrap();
        ledger.register("run1", &subject()).unwrap();
        ledger.complete("run1", "P1", "P1").unwrap();
        ledger.finish_run("run1", "succeeded").unwrap();

        let run = ledger.run("run1").unwrap().unwrap();
        assert_eq!(run.outcome.as_deref(), Some("succeeded"));
        assert!(run.finished_at.is_some());

        let counts = ledger.counts("run1").unwrap();
        assert_eq!(counts.get(&LedgerStatus::Done), Some(&1));
        assert_eq!(counts.get(&LedgerStatus::Pending), Some(&1));

        // Snapshot keeps registration order
        let ids: Vec<_> = ledger
            .snapshot("run1")
            .unwrap()
            .into_iter()
            .map(|r| r.source_id)
            .collect();
        assert_eq!(ids, vec!["P1".to_string(), "XNAT_S1".to_string()]);
    }
}
