//! Volatile ledger for tests and dry runs.

use super::traits::{LedgerRecord, LedgerStatus, LedgerStore, RunInfo};
use crate::error::{MigrateError, Result};
use crate::model::Entity;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    runs: Vec<RunInfo>,
    records: HashMap<(String, String), LedgerRecord>,
    order: Vec<(String, String)>,
}

/// Ledger held in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|e| MigrateError::Database {
            message: format!("Failed to lock ledger: {}", e),
            source: None,
        })
    }

    fn record_mut<'a>(
        inner: &'a mut Inner,
        run_id: &str,
        source_id: &str,
    ) -> Result<&'a mut LedgerRecord> {
        inner
            .records
            .get_mut(&(run_id.to_string(), source_id.to_string()))
            .ok_or_else(|| MigrateError::Database {
                message: format!("No ledger record for {} in run {}", source_id, run_id),
                source: None,
            })
    }
}

impl LedgerStore for MemoryLedger {
    fn begin_run(&self, run: &RunInfo) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.runs.iter().any(|r| r.run_id == run.run_id) {
            inner.runs.push(run.clone());
        }
        Ok(())
    }

    fn finish_run(&self, run_id: &str, outcome: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(run) = inner.runs.iter_mut().find(|r| r.run_id == run_id) {
            run.finished_at = Some(Utc::now());
            run.outcome = Some(outcome.to_string());
        }
        Ok(())
    }

    fn run(&self, run_id: &str) -> Result<Option<RunInfo>> {
        Ok(self.lock()?.runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    fn latest_run(&self) -> Result<Option<RunInfo>> {
        Ok(self.lock()?.runs.last().cloned())
    }

    fn get(&self, run_id: &str, source_id: &str) -> Result<Option<LedgerRecord>> {
        Ok(self
            .lock()?
            .records
            .get(&(run_id.to_string(), source_id.to_string()))
            .cloned())
    }

    fn register(&self, run_id: &str, entity: &Entity) -> Result<LedgerRecord> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let key = (run_id.to_string(), entity.source_id.clone());
        if let Some(existing) = inner.records.get(&key) {
            return Ok(existing.clone());
        }
        let record = LedgerRecord::pending(run_id, entity);
        inner.order.push(key.clone());
        inner.records.insert(key, record.clone());
        Ok(record)
    }

    fn mark(
        &self,
        run_id: &str,
        source_id: &str,
        status: LedgerStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let record = Self::record_mut(&mut inner, run_id, source_id)?;
        record.status = status;
        record.last_error = error.map(str::to_string);
        if status == LedgerStatus::InProgress {
            record.attempt_count += 1;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    fn complete(&self, run_id: &str, source_id: &str, destination_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let record = Self::record_mut(&mut inner, run_id, source_id)?;
        record.status = LedgerStatus::Done;
        record.destination_id = Some(destination_id.to_string());
        record.last_error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    fn snapshot(&self, run_id: &str) -> Result<Vec<LedgerRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .order
            .iter()
            .filter(|(run, _)| run == run_id)
            .filter_map(|key| inner.records.get(key).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;

    #[test]
    fn test_status_transitions() {
        let ledger = MemoryLedger::new();
        let scan = Entity::child(EntityKind::Scan, "scan-1", "1", "E1");
        ledger.register("r", &scan).unwrap();

        ledger.mark("r", "scan-1", LedgerStatus::InProgress, None).unwrap();
        ledger
            .mark("r", "scan-1", LedgerStatus::Failed, Some("503"))
            .unwrap();
        ledger.mark("r", "scan-1", LedgerStatus::InProgress, None).unwrap();

        let record = ledger.get("r", "scan-1").unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
        assert!(record.last_error.is_none());

        ledger.complete("r", "scan-1", "dst-scan-1").unwrap();
        let record = ledger.get("r", "scan-1").unwrap().unwrap();
        assert!(record.status.is_terminal());
        assert_eq!(record.destination_id.as_deref(), Some("dst-scan-1"));
    }

    #[test]
    fn test_unknown_record_is_an_error() {
        let ledger = MemoryLedger::new();
        assert!(ledger.complete("r", "missing", "x").is_err());
    }
}
