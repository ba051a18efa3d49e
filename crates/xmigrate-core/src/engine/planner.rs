//! Decides what each source entity needs on the destination.

use crate::client::{EntityPayload, RemoteEntity};
use crate::engine::writer::DestinationWriter;
use crate::ledger::{LedgerStatus, LedgerStore};
use crate::metadata::{diff_fields, ACCESSION_FIELD};
use crate::model::Entity;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Action planned for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Create,
    /// Exists but differs; reconcile because `force_update` is set.
    Update,
    /// Exists and is equivalent.
    SkipExisting,
    /// Exists and differs; surfaced, never overwritten.
    Conflict,
    /// Done in the ledger for this run.
    AlreadyMigrated,
}

impl PlannedAction {
    /// Whether carrying out the action mutates the destination.
    pub fn writes(&self) -> bool {
        matches!(self, PlannedAction::Create | PlannedAction::Update)
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlannedAction::Create => "create",
            PlannedAction::Update => "update",
            PlannedAction::SkipExisting => "skip",
            PlannedAction::Conflict => "conflict",
            PlannedAction::AlreadyMigrated => "already-migrated",
        };
        f.write_str(name)
    }
}

/// One planned action together with everything needed to carry it out.
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    /// The entity as read from the source.
    pub entity: Entity,
    /// The entity as it should look on the destination.
    pub payload: EntityPayload,
    pub action: PlannedAction,
    /// Destination identifier of the parent; `None` for projects and for
    /// children of not-yet-created parents in a dry run.
    pub parent_destination_id: Option<String>,
    /// Destination identifier when the entity already exists there.
    pub existing_id: Option<String>,
    /// Accession number of the existing destination entity.
    pub existing_accession: Option<String>,
    /// Fields that differ, for `Conflict` and `Update`.
    pub differing_fields: Vec<String>,
}

/// Compares source and destination state to pick an action per entity.
#[derive(Clone)]
pub struct Planner {
    writer: DestinationWriter,
    ledger: Arc<dyn LedgerStore>,
    run_id: String,
    force_update: bool,
}

impl Planner {
    pub fn new(
        writer: DestinationWriter,
        ledger: Arc<dyn LedgerStore>,
        run_id: impl Into<String>,
        force_update: bool,
    ) -> Self {
        Self {
            writer,
            ledger,
            run_id: run_id.into(),
            force_update,
        }
    }

    /// Plan one entity whose parent is already resolved.
    ///
    /// `parent_is_new` marks a parent that a dry run predicted to be
    /// created: nothing can exist under it, so the destination isn't asked.
    pub async fn plan(
        &self,
        entity: Entity,
        payload: EntityPayload,
        parent_destination_id: Option<&str>,
        parent_is_new: bool,
    ) -> Result<MigrationUnit> {
        let mut unit = MigrationUnit {
            entity,
            payload,
            action: PlannedAction::Create,
            parent_destination_id: parent_destination_id.map(str::to_string),
            existing_id: None,
            existing_accession: None,
            differing_fields: Vec::new(),
        };

        if let Some(record) = self.ledger.get(&self.run_id, &unit.entity.source_id)? {
            if record.status == LedgerStatus::Done {
                if let Some(destination_id) = record.destination_id {
                    unit.action = PlannedAction::AlreadyMigrated;
                    unit.existing_id = Some(destination_id);
                    return Ok(unit);
                }
            }
        }

        if parent_is_new {
            return Ok(unit);
        }

        let key = unit.payload.natural_key(parent_destination_id);
        if let Some(existing) = self.writer.find_existing(&key).await? {
            let differing = self.compare(&unit, &existing);
            unit.existing_accession = existing
                .metadata
                .get(ACCESSION_FIELD)
                .filter(|id| !id.is_empty())
                .cloned();
            unit.existing_id = Some(existing.id);
            unit.action = match (differing.is_empty(), self.force_update) {
                (true, _) => PlannedAction::SkipExisting,
                (false, true) => PlannedAction::Update,
                (false, false) => PlannedAction::Conflict,
            };
            unit.differing_fields = differing;
        }

        debug!("Planned {} for {}", unit.action, unit.entity.describe());
        Ok(unit)
    }

    /// Fields in which the destination entity differs from the wanted one.
    fn compare(&self, unit: &MigrationUnit, existing: &RemoteEntity) -> Vec<String> {
        if unit.entity.kind.has_content() {
            let same = match (&unit.entity.content, &existing.content) {
                (Some(source), Some(destination)) if source.comparable_with(destination) => {
                    source.matches(destination)
                }
                _ => {
                    warn!(
                        "No size or digest to compare for {}; keeping the destination copy",
                        unit.entity.describe()
                    );
                    true
                }
            };
            return if same {
                Vec::new()
            } else {
                vec!["content".to_string()]
            };
        }
        diff_fields(&unit.payload.metadata, &existing.metadata)
    }
}
