//! Runs a migration end to end.
//!
//! The dispatch loop owns the ledger and the work queue. Workers carry out
//! one unit each: the write it needs (if any), then listing and planning its
//! children. The loop settles each finished unit into the ledger and the
//! report, and queues the children, so a child is dispatched only once its
//! parent has a destination identifier.
//!
//! Units are queued depth-first with siblings in source order. At most
//! `concurrency` units are in flight at once.

use crate::cancel::CancellationToken;
use crate::client::{DynRestClient, EntityPayload};
use crate::config::MigrationConfig;
use crate::engine::planner::{MigrationUnit, PlannedAction, Planner};
use crate::engine::preflight::check_datatypes;
use crate::engine::reader::SourceReader;
use crate::engine::report::{PlanEntry, RunReport, UnitIssue};
use crate::engine::writer::{DestinationWriter, EnsureOutcome, WriteEffect};
use crate::ledger::{LedgerStatus, LedgerStore, RunInfo};
use crate::metadata::MetadataMapper;
use crate::model::{Entity, EntityKind, IdMapping};
use crate::{Attempt, MigrateError, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Result of planning one source entity.
enum Planned {
    Unit(MigrationUnit),
    /// Disappeared from the source before it could be planned.
    Vanished(Entity),
    Failed(Entity, MigrateError),
}

/// A unit waiting for a worker.
struct Queued {
    unit: MigrationUnit,
    mapper: Arc<MetadataMapper>,
    /// Attempts already made in this run.
    attempt: u32,
    /// Backoff to wait before the next attempt.
    delay: Duration,
}

struct Executed {
    destination_id: Option<String>,
    effect: Option<WriteEffect>,
    /// Children planned under the unit, or why they couldn't be listed.
    children: Result<Vec<Planned>>,
}

struct Finished {
    queued: Queued,
    outcome: Result<Executed>,
}

/// Everything a worker needs. Shared read-only between workers, except for
/// the ID mapping.
struct Worker {
    reader: SourceReader,
    writer: DestinationWriter,
    planner: Planner,
    mapping: Arc<RwLock<IdMapping>>,
    dry_run: bool,
    force_update: bool,
}

impl Worker {
    async fn execute(self: Arc<Self>, queued: Queued) -> Finished {
        if !queued.delay.is_zero() {
            tokio::time::sleep(queued.delay).await;
        }
        let outcome = self.carry_out(&queued).await;
        Finished { queued, outcome }
    }

    async fn carry_out(&self, queued: &Queued) -> Result<Executed> {
        let unit = &queued.unit;
        let (destination_id, effect, accession) = if unit.action.writes() && !self.dry_run {
            let written = self.write(unit, queued.attempt).await?;
            (Some(written.destination_id), Some(written.effect), written.accession)
        } else {
            (unit.existing_id.clone(), None, unit.existing_accession.clone())
        };

        if let Some(id) = &destination_id {
            let mut mapping = self.mapping.write().await;
            mapping.record(&unit.entity.source_id, id, unit.entity.kind)?;
            if let (Some(source), Some(destination)) = (unit.entity.accession(), &accession) {
                // Some accession numbers (scan IDs) are only unique per parent
                if let Err(e) = mapping.record_accession(source, destination, unit.entity.kind) {
                    warn!("Not remapping references to {}: {}", unit.entity.describe(), e);
                }
            }
        }

        let children = if unit.entity.kind.child_kinds().is_empty() {
            Ok(Vec::new())
        } else {
            self.expand(unit, destination_id.as_deref(), &queued.mapper)
                .await
        };

        Ok(Executed {
            destination_id,
            effect,
            children,
        })
    }

    async fn write(&self, unit: &MigrationUnit, attempt: u32) -> Result<EnsureOutcome> {
        let parent = unit.parent_destination_id.as_deref();

        if unit.entity.kind.has_content() {
            let Some(resource) = parent else {
                return Err(MigrateError::Other(format!(
                    "{} has no destination resource",
                    unit.entity.describe()
                )));
            };
            // A previous attempt may have left a partial file behind
            let overwrite = unit.action == PlannedAction::Update || attempt > 0;
            let content = self.reader.fetch_content(&unit.entity).await?;
            let confirmation = self
                .writer
                .upload_content(
                    resource,
                    &unit.payload.label,
                    unit.entity.content.as_ref(),
                    content,
                    overwrite,
                )
                .await?;
            let effect = if unit.action == PlannedAction::Update {
                WriteEffect::Updated
            } else {
                WriteEffect::Created
            };
            return Ok(EnsureOutcome {
                destination_id: confirmation.destination_id,
                accession: None,
                effect,
            });
        }

        self.writer
            .ensure_entity(&unit.payload, parent, self.force_update)
            .await
    }

    /// List and plan the children of a finished unit.
    async fn expand(
        &self,
        unit: &MigrationUnit,
        destination_id: Option<&str>,
        mapper: &MetadataMapper,
    ) -> Result<Vec<Planned>> {
        let parent_is_new = self.dry_run && unit.action == PlannedAction::Create;
        let children = self.reader.collect_children(&unit.entity).await?;
        let mut planned = Vec::with_capacity(children.len());
        for child in children {
            planned.push(
                self.plan_entity(child, destination_id, parent_is_new, mapper)
                    .await,
            );
        }
        Ok(planned)
    }

    async fn plan_entity(
        &self,
        mut entity: Entity,
        parent_destination_id: Option<&str>,
        parent_is_new: bool,
        mapper: &MetadataMapper,
    ) -> Planned {
        match self.reader.hydrate(&mut entity).await {
            Ok(()) => {}
            Err(MigrateError::SourceNotFound { .. }) => return Planned::Vanished(entity),
            Err(e) => return Planned::Failed(entity, e),
        }

        let payload = self.payload_for(&entity, mapper).await;
        let fallback = entity.clone();
        match self
            .planner
            .plan(entity, payload, parent_destination_id, parent_is_new)
            .await
        {
            Ok(unit) => Planned::Unit(unit),
            Err(e) => Planned::Failed(fallback, e),
        }
    }

    async fn payload_for(&self, entity: &Entity, mapper: &MetadataMapper) -> EntityPayload {
        let label = if entity.kind == EntityKind::Project {
            mapper.project().destination.clone()
        } else {
            entity.label.clone()
        };
        let mapping = self.mapping.read().await;
        EntityPayload {
            kind: entity.kind,
            label,
            metadata: mapper.map_for_destination(entity, &mapping),
        }
    }
}

/// A migration between one source and one destination server.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use xmigrate_core::{
///     config::{MigrationConfig, ProjectMapping},
///     client::XnatClient,
///     engine::Migration,
///     ledger::SqliteLedger,
///     network::ServerRole,
/// };
///
/// # async fn example() -> xmigrate_core::Result<()> {
/// let source = XnatClient::connect("https://old.example.org", ServerRole::Source, "admin", "secret")?;
/// let destination =
///     XnatClient::connect("https://new.example.org", ServerRole::Destination, "admin", "secret")?;
/// let ledger = SqliteLedger::open("xmigrate-ledger.sqlite")?;
///
/// let config = MigrationConfig::new(vec![ProjectMapping::parse("OLD:NEW")?]);
/// let migration = Migration::new(Arc::new(source), Arc::new(destination), Arc::new(ledger), config);
/// let report = migration.run(None).await?;
/// println!("{}", report);
/// # Ok(())
/// # }
/// ```
pub struct Migration {
    source: DynRestClient,
    destination: DynRestClient,
    ledger: Arc<dyn LedgerStore>,
    config: MigrationConfig,
    cancel: CancellationToken,
}

impl Migration {
    pub fn new(
        source: DynRestClient,
        destination: DynRestClient,
        ledger: Arc<dyn LedgerStore>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops this migration when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run the migration, or continue run `resume` from its ledger.
    ///
    /// Errors that stop the run before any unit is dispatched (invalid
    /// configuration, missing datatypes, a missing source project, an
    /// unreadable ledger) are returned as `Err`. Everything that happens to
    /// individual units is in the report.
    pub async fn run(&self, resume: Option<&str>) -> Result<RunReport> {
        self.config.validate()?;
        let config = &self.config;

        let run_id = match resume {
            Some(run_id) => {
                if self.ledger.run(run_id)?.is_none() {
                    return Err(MigrateError::Config {
                        message: format!("No run '{}' in the ledger to resume", run_id),
                    });
                }
                info!("Resuming run {}", run_id);
                run_id.to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        if config.check_datatypes {
            check_datatypes(self.source.as_ref(), self.destination.as_ref()).await?;
        }

        let reader = SourceReader::new(
            self.source.clone(),
            config.retry.clone(),
            config.request_timeout,
        );
        let writer = DestinationWriter::new(
            self.destination.clone(),
            config.retry.clone(),
            config.request_timeout,
            config.transfer_timeout,
        );
        let planner = Planner::new(
            writer.clone(),
            self.ledger.clone(),
            run_id.clone(),
            config.force_update,
        );
        let worker = Arc::new(Worker {
            reader,
            writer,
            planner,
            mapping: Arc::new(RwLock::new(IdMapping::new())),
            dry_run: config.dry_run,
            force_update: config.force_update,
        });

        let roots = worker.reader.list_roots(&config.projects).await?;

        if !config.dry_run {
            let projects = config
                .projects
                .iter()
                .map(|p| format!("{}:{}", p.source, p.destination))
                .collect();
            self.ledger.begin_run(&RunInfo::new(run_id.clone(), projects))?;
        }
        info!(
            "Starting run {} for {} project(s){}",
            run_id,
            roots.len(),
            if config.dry_run { " (dry run)" } else { "" }
        );

        let mut dispatch = Dispatch {
            migration: self,
            run_id: run_id.clone(),
            queue: VecDeque::new(),
            report: RunReport::new(run_id.clone(), config.dry_run),
            stopping: false,
        };

        for (root, project) in roots.into_iter().zip(&config.projects) {
            let mapper = Arc::new(MetadataMapper::new(project.clone()));
            let planned = worker.plan_entity(root, None, false, &mapper).await;
            dispatch.accept(vec![planned], &mapper)?;
        }

        dispatch.drive(&worker).await?;
        let mut report = dispatch.finish();

        if let (Some(dir), false) = (&config.id_map_dir, config.dry_run) {
            let mapping = worker.mapping.read().await;
            match mapping.export_json(dir) {
                Ok(written) => report.id_map_files = written,
                Err(e) => warn!("Failed to export ID maps to {:?}: {}", dir, e),
            }
        }

        report.finish();
        if !config.dry_run {
            self.ledger.finish_run(&run_id, report.outcome())?;
        }
        info!(
            "Run {} {}: {} created, {} updated, {} skipped, {} conflicts, {} failed",
            run_id,
            report.outcome(),
            report.counts.created,
            report.counts.updated,
            report.counts.skipped_existing + report.counts.already_migrated,
            report.counts.conflicts,
            report.counts.failed
        );
        Ok(report)
    }
}

/// State of the dispatch loop; the only writer of the ledger.
struct Dispatch<'a> {
    migration: &'a Migration,
    run_id: String,
    queue: VecDeque<Queued>,
    report: RunReport,
    stopping: bool,
}

impl Dispatch<'_> {
    fn config(&self) -> &MigrationConfig {
        &self.migration.config
    }

    fn ledger(&self) -> &dyn LedgerStore {
        self.migration.ledger.as_ref()
    }

    fn dry_run(&self) -> bool {
        self.migration.config.dry_run
    }

    async fn drive(&mut self, worker: &Arc<Worker>) -> Result<()> {
        let cancel = self.migration.cancel.clone();
        let concurrency = self.config().concurrency;
        let mut in_flight = JoinSet::new();

        loop {
            if cancel.is_cancelled() && !self.stopping {
                self.cancel_requested();
            }

            while !self.stopping && in_flight.len() < concurrency {
                let Some(queued) = self.queue.pop_front() else {
                    break;
                };
                if queued.unit.action.writes() && !self.dry_run() {
                    self.ledger().mark(
                        &self.run_id,
                        &queued.unit.entity.source_id,
                        LedgerStatus::InProgress,
                        None,
                    )?;
                }
                in_flight.spawn(worker.clone().execute(queued));
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = in_flight.join_next() => joined,
                _ = cancel.cancelled(), if !self.stopping => {
                    self.cancel_requested();
                    continue;
                }
            };
            let Some(joined) = joined else {
                break;
            };
            let finished =
                joined.map_err(|e| MigrateError::Other(format!("Migration worker failed: {}", e)))?;
            self.settle(finished)?;
        }
        Ok(())
    }

    fn cancel_requested(&mut self) {
        warn!("Cancellation requested; waiting for in-flight units");
        self.stopping = true;
        self.report.cancelled = true;
    }

    fn abort(&mut self, reason: String) {
        if self.report.aborted.is_none() {
            error!("Aborting run: {}", reason);
            self.report.aborted = Some(reason);
        }
        self.stopping = true;
    }

    fn should_abort(&self, err: &MigrateError) -> bool {
        if self.config().continue_on_error {
            err.is_fatal() && !matches!(err, MigrateError::Authorization { .. })
        } else {
            true
        }
    }

    /// Register planned entities and queue their units, ahead of everything
    /// already queued so the walk stays depth-first.
    fn accept(&mut self, planned: Vec<Planned>, mapper: &Arc<MetadataMapper>) -> Result<()> {
        let mut units = Vec::with_capacity(planned.len());
        for planned in planned {
            match planned {
                Planned::Unit(unit) => {
                    if self.dry_run() {
                        self.report.counts.add_planned(unit.action);
                        self.report.plan.push(PlanEntry {
                            kind: unit.entity.kind,
                            label: unit.payload.label.clone(),
                            source_id: unit.entity.source_id.clone(),
                            parent_source_id: unit.entity.parent_source_id.clone(),
                            action: unit.action,
                        });
                    } else {
                        self.ledger().register(&self.run_id, &unit.entity)?;
                    }
                    units.push(unit);
                }
                Planned::Vanished(entity) => self.vanished(&entity)?,
                Planned::Failed(entity, err) => self.fail(&entity, err)?,
            }
        }

        for unit in units.into_iter().rev() {
            self.queue.push_front(Queued {
                unit,
                mapper: mapper.clone(),
                attempt: 0,
                delay: Duration::ZERO,
            });
        }
        Ok(())
    }

    fn settle(&mut self, finished: Finished) -> Result<()> {
        let Finished { mut queued, outcome } = finished;

        let attempts = queued.attempt + 1;
        let executed = match Attempt::from_result(outcome) {
            Attempt::Done(executed) => executed,
            Attempt::Retryable(err) if attempts < self.config().max_unit_attempts => {
                let delay = self.config().retry.calculate_delay(queued.attempt);
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    queued.unit.entity.describe(),
                    attempts,
                    self.config().max_unit_attempts,
                    err,
                    delay
                );
                if !self.dry_run() {
                    self.ledger().mark(
                        &self.run_id,
                        &queued.unit.entity.source_id,
                        LedgerStatus::Pending,
                        Some(&err.to_string()),
                    )?;
                }
                queued.attempt = attempts;
                queued.delay = delay;
                self.queue.push_front(queued);
                return Ok(());
            }
            Attempt::Fatal(MigrateError::SourceNotFound { .. }) => {
                return self.vanished(&queued.unit.entity);
            }
            Attempt::Retryable(err) | Attempt::Fatal(err) => {
                return self.fail(&queued.unit.entity, err);
            }
        };

        queued.unit.entity.destination_id = executed.destination_id.clone();
        let unit = &queued.unit;
        let source_id = unit.entity.source_id.as_str();
        if !self.dry_run() {
            match (unit.action, &unit.entity.destination_id) {
                (PlannedAction::AlreadyMigrated, _) => {
                    self.report.counts.already_migrated += 1;
                }
                (PlannedAction::Conflict, _) => {
                    let cause = conflict_cause(unit);
                    self.ledger()
                        .mark(&self.run_id, source_id, LedgerStatus::Conflict, Some(&cause))?;
                    self.report.counts.conflicts += 1;
                }
                (_, Some(destination_id)) => {
                    self.ledger().complete(&self.run_id, source_id, destination_id)?;
                    match executed.effect {
                        Some(WriteEffect::Created) => self.report.counts.created += 1,
                        Some(WriteEffect::Updated) => self.report.counts.updated += 1,
                        _ => self.report.counts.skipped_existing += 1,
                    }
                    debug!("{} -> {}", unit.entity.describe(), destination_id);
                }
                (action, None) => {
                    return Err(MigrateError::Other(format!(
                        "{} finished {} without a destination identifier",
                        unit.entity.describe(),
                        action
                    )));
                }
            }
        }

        if unit.action == PlannedAction::Conflict {
            let cause = conflict_cause(unit);
            warn!("{}", cause);
            self.report
                .conflicts
                .push(UnitIssue::new(&unit.entity, "conflict", cause));
        }

        match executed.children {
            Ok(children) => self.accept(children, &queued.mapper)?,
            Err(err) => {
                error!(
                    "Could not list children of {}: {}",
                    unit.entity.describe(),
                    err
                );
                self.report.blocked.push(UnitIssue::new(
                    &unit.entity,
                    err.class(),
                    format!("children not listed: {}", err),
                ));
                if self.should_abort(&err) {
                    self.abort(format!("listing {} failed: {}", unit.entity.describe(), err));
                }
            }
        }
        Ok(())
    }

    fn vanished(&mut self, entity: &Entity) -> Result<()> {
        info!("{} vanished from the source; skipping", entity.describe());
        if !self.dry_run() {
            self.ledger().register(&self.run_id, entity)?;
            self.ledger().mark(
                &self.run_id,
                &entity.source_id,
                LedgerStatus::Skipped,
                Some("not found on source"),
            )?;
        }
        self.report.counts.skipped_missing += 1;
        self.report
            .missing
            .push(UnitIssue::new(entity, "source_not_found", "not found on source"));
        Ok(())
    }

    fn fail(&mut self, entity: &Entity, err: MigrateError) -> Result<()> {
        error!("Failed {}: {}", entity.describe(), err);
        let cause = err.to_string();
        if !self.dry_run() {
            self.ledger().register(&self.run_id, entity)?;
            self.ledger()
                .mark(&self.run_id, &entity.source_id, LedgerStatus::Failed, Some(&cause))?;
        }
        self.report.counts.failed += 1;
        self.report
            .failures
            .push(UnitIssue::new(entity, err.class(), cause.clone()));
        if !entity.kind.child_kinds().is_empty() {
            self.report.blocked.push(UnitIssue::new(
                entity,
                err.class(),
                "subtree not migrated",
            ));
        }
        if self.should_abort(&err) {
            self.abort(format!("{} failed: {}", entity.describe(), cause));
        }
        Ok(())
    }

    fn finish(mut self) -> RunReport {
        self.report.counts.pending = self.queue.len();
        self.report
    }
}

fn conflict_cause(unit: &MigrationUnit) -> String {
    MigrateError::Conflict {
        kind: unit.entity.kind,
        label: unit.payload.label.clone(),
        fields: unit.differing_fields.clone(),
    }
    .to_string()
}
