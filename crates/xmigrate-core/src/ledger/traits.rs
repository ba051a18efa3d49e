//! Ledger store trait and record types.

use crate::error::Result;
use crate::model::{Entity, EntityKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Progress of one entity within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Conflict,
    Skipped,
}

impl LedgerStatus {
    pub const ALL: [LedgerStatus; 6] = [
        LedgerStatus::Pending,
        LedgerStatus::InProgress,
        LedgerStatus::Done,
        LedgerStatus::Failed,
        LedgerStatus::Conflict,
        LedgerStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::InProgress => "in_progress",
            LedgerStatus::Done => "done",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Conflict => "conflict",
            LedgerStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// Whether no further transition is expected within the run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LedgerStatus::Pending | LedgerStatus::InProgress)
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of one source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub run_id: String,
    pub source_id: String,
    pub kind: EntityKind,
    pub label: String,
    pub parent_source_id: Option<String>,
    pub status: LedgerStatus,
    pub destination_id: Option<String>,
    pub last_error: Option<String>,
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// Fresh `Pending` record for `entity`.
    pub fn pending(run_id: &str, entity: &Entity) -> Self {
        Self {
            run_id: run_id.to_string(),
            source_id: entity.source_id.clone(),
            kind: entity.kind,
            label: entity.label.clone(),
            parent_source_id: entity.parent_source_id.clone(),
            status: LedgerStatus::Pending,
            destination_id: None,
            last_error: None,
            attempt_count: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Metadata about one run, for `--resume` and `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    /// Source projects, as `SRC:DST`.
    pub projects: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Final outcome once the run returned (`succeeded`, `failed`, `cancelled`).
    pub outcome: Option<String>,
}

impl RunInfo {
    pub fn new(run_id: impl Into<String>, projects: Vec<String>) -> Self {
        Self {
            run_id: run_id.into(),
            projects,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        }
    }
}

/// Durable per-run progress store.
///
/// Keyed by `(run_id, source_id)`. Every mutation is durable before it
/// returns. All operations are synchronous to match rusqlite's API; the
/// orchestrator calls them from its dispatch loop only.
pub trait LedgerStore: Send + Sync {
    /// Record a run, or refresh nothing if it already exists.
    fn begin_run(&self, run: &RunInfo) -> Result<()>;

    /// Record how a run ended.
    fn finish_run(&self, run_id: &str, outcome: &str) -> Result<()>;

    fn run(&self, run_id: &str) -> Result<Option<RunInfo>>;

    /// Most recently started run.
    fn latest_run(&self) -> Result<Option<RunInfo>>;

    fn get(&self, run_id: &str, source_id: &str) -> Result<Option<LedgerRecord>>;

    /// Insert a `Pending` record for `entity` if none exists; return the
    /// current record either way.
    fn register(&self, run_id: &str, entity: &Entity) -> Result<LedgerRecord>;

    /// Set the status and last error of a registered entity. Moving to
    /// `InProgress` increments the attempt count.
    fn mark(
        &self,
        run_id: &str,
        source_id: &str,
        status: LedgerStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Mark an entity `Done` together with its destination identifier.
    fn complete(&self, run_id: &str, source_id: &str, destination_id: &str) -> Result<()>;

    /// Every record of a run, in registration order.
    fn snapshot(&self, run_id: &str) -> Result<Vec<LedgerRecord>>;

    /// Record count per status.
    fn counts(&self, run_id: &str) -> Result<BTreeMap<LedgerStatus, usize>> {
        let mut counts = BTreeMap::new();
        for record in self.snapshot(run_id)? {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
