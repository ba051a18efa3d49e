//! End-of-run summary.

use crate::engine::planner::PlannedAction;
use crate::metadata::atomic_write_json;
use crate::model::{Entity, EntityKind};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Units per terminal outcome.
///
/// In a dry run the counts describe the plan rather than what happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped_existing: usize,
    pub already_migrated: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Vanished from the source between listing and transfer.
    pub skipped_missing: usize,
    /// Registered but never finished, because the run stopped early.
    pub pending: usize,
}

impl UnitCounts {
    pub fn total(&self) -> usize {
        self.created
            + self.updated
            + self.skipped_existing
            + self.already_migrated
            + self.conflicts
            + self.failed
            + self.skipped_missing
            + self.pending
    }

    /// Count a planned action, for dry runs.
    pub fn add_planned(&mut self, action: PlannedAction) {
        match action {
            PlannedAction::Create => self.created += 1,
            PlannedAction::Update => self.updated += 1,
            PlannedAction::SkipExisting => self.skipped_existing += 1,
            PlannedAction::Conflict => self.conflicts += 1,
            PlannedAction::AlreadyMigrated => self.already_migrated += 1,
        }
    }
}

/// An entity and what went wrong with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitIssue {
    pub kind: EntityKind,
    pub label: String,
    pub source_id: String,
    /// Destination entity involved, e.g. the one a conflict was found on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    /// Error class, e.g. `transfer_integrity`.
    pub class: String,
    pub cause: String,
}

impl UnitIssue {
    pub fn new(entity: &Entity, class: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            kind: entity.kind,
            label: entity.label.clone(),
            source_id: entity.source_id.clone(),
            destination_id: entity.destination_id.clone(),
            class: class.into(),
            cause: cause.into(),
        }
    }
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub kind: EntityKind,
    pub label: String,
    pub source_id: String,
    pub parent_source_id: Option<String>,
    pub action: PlannedAction,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub counts: UnitCounts,
    pub failures: Vec<UnitIssue>,
    pub conflicts: Vec<UnitIssue>,
    /// Entities that vanished from the source.
    pub missing: Vec<UnitIssue>,
    /// Roots of subtrees that were never planned because their parent failed
    /// or could not be listed.
    pub blocked: Vec<UnitIssue>,
    /// Planned actions in dispatch order; filled for dry runs.
    pub plan: Vec<PlanEntry>,
    pub cancelled: bool,
    /// Why the run stopped before finishing, if it did.
    pub aborted: Option<String>,
    /// ID-map exports written after the run.
    pub id_map_files: Vec<PathBuf>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            dry_run,
            started_at: now,
            finished_at: now,
            duration_secs: 0.0,
            counts: UnitCounts::default(),
            failures: Vec::new(),
            conflicts: Vec::new(),
            missing: Vec::new(),
            blocked: Vec::new(),
            plan: Vec::new(),
            cancelled: false,
            aborted: None,
            id_map_files: Vec::new(),
        }
    }

    /// Stamp the end time.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_secs = (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }

    /// True when every unit reached Done, Skipped or Conflict.
    pub fn is_success(&self) -> bool {
        self.counts.failed == 0
            && self.counts.pending == 0
            && self.blocked.is_empty()
            && self.aborted.is_none()
            && !self.cancelled
    }

    /// Process exit code: 0 on success, 130 when cancelled, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else if self.cancelled {
            130
        } else {
            1
        }
    }

    /// Label for the ledger's run table.
    pub fn outcome(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.is_success() {
            "succeeded"
        } else {
            "failed"
        }
    }

    /// Write the report as JSON, keeping the previous one as a backup.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self, true)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "Run {}{} finished in {:.1}s",
            self.run_id,
            if self.dry_run { " (dry run)" } else { "" },
            self.duration_secs
        )?;
        writeln!(f, "  created:          {}", c.created)?;
        writeln!(f, "  updated:          {}", c.updated)?;
        writeln!(f, "  skipped existing: {}", c.skipped_existing)?;
        writeln!(f, "  already migrated: {}", c.already_migrated)?;
        writeln!(f, "  conflicts:        {}", c.conflicts)?;
        writeln!(f, "  missing:          {}", c.skipped_missing)?;
        writeln!(f, "  failed:           {}", c.failed)?;
        if c.pending > 0 {
            writeln!(f, "  not finished:     {}", c.pending)?;
        }

        for (title, issues) in [
            ("Failed", &self.failures),
            ("Conflicts", &self.conflicts),
            ("Blocked subtrees", &self.blocked),
        ] {
            if issues.is_empty() {
                continue;
            }
            writeln!(f, "{}:", title)?;
            for issue in issues {
                writeln!(
                    f,
                    "  {} '{}' ({}): [{}] {}",
                    issue.kind, issue.label, issue.source_id, issue.class, issue.cause
                )?;
            }
        }

        if self.cancelled {
            writeln!(f, "Run was cancelled; resume with --resume {}", self.run_id)?;
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "Run aborted: {}", reason)?;
        }
        Ok(())
    }
}
