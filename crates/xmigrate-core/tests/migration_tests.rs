//! End-to-end migrations between in-memory servers.
//!
//! These tests drive the public `Migration` API against a seeded source
//! archive and check what ends up on the destination and in the ledger.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use xmigrate_core::client::{
    ByteStream, EntityPayload, Failure, InMemoryServer, Operation, RemoteEntity, RestClient,
    UploadReceipt,
};
use xmigrate_core::config::{MigrationConfig, ProjectMapping};
use xmigrate_core::engine::{Migration, PlannedAction};
use xmigrate_core::ledger::{LedgerStatus, LedgerStore, MemoryLedger, SqliteLedger};
use xmigrate_core::model::{EntityKind, Metadata};
use xmigrate_core::network::{RetryConfig, ServerRole};
use xmigrate_core::{CancellationToken, MigrateError};

const SCAN_BYTES: &[u8] = b"DICM pretend pixel data";

fn fields(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// P1 / {S1 / E1 / scan 1 / DICOM / 1.dcm, S2}: seven entities.
fn source_archive() -> Arc<InMemoryServer> {
    let source = Arc::new(InMemoryServer::new(ServerRole::Source, "XNAT"));
    let project = source
        .add_project("P1", fields(&[("description", "pilot study")]))
        .unwrap();
    let s1 = source
        .add_child(&project, EntityKind::Subject, "S1", fields(&[("group", "control")]))
        .unwrap();
    let e1 = source
        .add_child(
            &s1,
            EntityKind::Session,
            "E1",
            fields(&[("xsiType", "xnat:mrSessionData"), ("date", "2019-03-01")]),
        )
        .unwrap();
    let scan = source
        .add_child(
            &e1,
            EntityKind::Scan,
            "1",
            fields(&[("xsiType", "xnat:mrScanData"), ("type", "T1w")]),
        )
        .unwrap();
    let dicom = source
        .add_child(&scan, EntityKind::Resource, "DICOM", Metadata::new())
        .unwrap();
    source.add_file(&dicom, "1.dcm", SCAN_BYTES).unwrap();
    source
        .add_child(&project, EntityKind::Subject, "S2", fields(&[("group", "patient")]))
        .unwrap();
    source
}

fn empty_destination() -> Arc<InMemoryServer> {
    Arc::new(InMemoryServer::new(ServerRole::Destination, "DEST"))
}

fn config() -> MigrationConfig {
    MigrationConfig::new(vec![ProjectMapping::same("P1")])
        .with_retry(RetryConfig::immediate(1))
        .with_max_unit_attempts(2)
        .with_check_datatypes(false)
        .with_concurrency(1)
}

fn migration(
    source: &Arc<InMemoryServer>,
    destination: &Arc<InMemoryServer>,
    ledger: Arc<dyn LedgerStore>,
    config: MigrationConfig,
) -> Migration {
    Migration::new(source.clone(), destination.clone(), ledger, config)
}

fn status_of(ledger: &dyn LedgerStore, run_id: &str, label: &str) -> LedgerStatus {
    ledger
        .snapshot(run_id)
        .unwrap()
        .into_iter()
        .find(|r| r.label == label)
        .map(|r| r.status)
        .unwrap_or_else(|| panic!("no ledger record for {}", label))
}

#[tokio::test]
async fn test_full_migration_into_empty_destination() {
    let source = source_archive();
    let destination = empty_destination();
    let ledger = Arc::new(MemoryLedger::new());

    let report = migration(&source, &destination, ledger.clone(), config())
        .run(None)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.counts.created, 7);
    assert_eq!(destination.len(), 7);

    let file = destination
        .lookup(&["P1", "S1", "E1", "1", "DICOM", "1.dcm"])
        .unwrap();
    assert_eq!(destination.content(&file.id).unwrap().as_ref(), SCAN_BYTES);
    let session = destination.lookup(&["P1", "S1", "E1"]).unwrap();
    assert_eq!(session.metadata.get("date").map(String::as_str), Some("2019-03-01"));

    let records = ledger.snapshot(&report.run_id).unwrap();
    assert_eq!(records.len(), 7);
    assert!(records.iter().all(|r| r.status == LedgerStatus::Done));
    assert!(records.iter().all(|r| r.destination_id.is_some()));
    assert_eq!(
        ledger.run(&report.run_id).unwrap().unwrap().outcome.as_deref(),
        Some("succeeded")
    );
}

#[tokio::test]
async fn test_second_run_writes_nothing() {
    let source = source_archive();
    let destination = empty_destination();

    let first = migration(&source, &destination, Arc::new(MemoryLedger::new()), config())
        .run(None)
        .await
        .unwrap();
    assert!(first.is_success());
    let mutations_after_first = destination.mutations().len();

    // A fresh run with no ledger history must find everything in place
    let second = migration(&source, &destination, Arc::new(MemoryLedger::new()), config())
        .run(None)
        .await
        .unwrap();
    assert!(second.is_success(), "{}", second);
    assert_eq!(second.counts.created, 0);
    assert_eq!(second.counts.skipped_existing, 7);
    assert_eq!(destination.mutations().len(), mutations_after_first);
    assert_eq!(destination.len(), 7);
}

#[tokio::test]
async fn test_parents_are_written_before_children() {
    let source = source_archive();
    let destination = empty_destination();

    migration(
        &source,
        &destination,
        Arc::new(MemoryLedger::new()),
        config().with_concurrency(4),
    )
    .run(None)
    .await
    .unwrap();

    let order: Vec<String> = destination.mutations().into_iter().map(|m| m.label).collect();
    let position = |label: &str| order.iter().position(|l| l == label).unwrap();
    for (parent, child) in [
        ("P1", "S1"),
        ("P1", "S2"),
        ("S1", "E1"),
        ("E1", "1"),
        ("1", "DICOM"),
        ("DICOM", "1.dcm"),
    ] {
        assert!(position(parent) < position(child), "{} after {}", parent, child);
    }
}

#[tokio::test]
async fn test_resume_skips_confirmed_units() {
    let tmp = TempDir::new().unwrap();
    let ledger_path = tmp.path().join("ledger.sqlite");
    let source = source_archive();
    let destination = empty_destination();

    // Both unit attempts of the upload fail, and the run stops there
    destination.inject(Operation::Upload, Some("1.dcm"), Failure::Unavailable, 2);
    let run_id = {
        let ledger = Arc::new(SqliteLedger::open(&ledger_path).unwrap());
        let report = migration(&source, &destination, ledger.clone(), config())
            .run(None)
            .await
            .unwrap();
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.counts.created, 5);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.failures[0].label, "1.dcm");
        assert_eq!(report.failures[0].class, "destination_unavailable");
        assert!(report.aborted.is_some());
        assert_eq!(report.counts.pending, 1);

        let file = ledger
            .snapshot(&report.run_id)
            .unwrap()
            .into_iter()
            .find(|r| r.label == "1.dcm")
            .unwrap();
        assert_eq!(file.status, LedgerStatus::Failed);
        assert_eq!(file.attempt_count, 2);
        report.run_id
    };
    assert_eq!(destination.calls(Operation::Create), 5);

    // Reopen the ledger as a new process would
    let ledger = Arc::new(SqliteLedger::open(&ledger_path).unwrap());
    assert_eq!(ledger.latest_run().unwrap().unwrap().run_id, run_id);

    let lists_before = destination.calls(Operation::List);
    let report = migration(&source, &destination, ledger.clone(), config())
        .run(Some(&run_id))
        .await
        .unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.run_id, run_id);
    assert_eq!(report.counts.already_migrated, 5);
    assert_eq!(report.counts.created, 2);

    // Only S2 was created; the confirmed units saw no writer calls at all
    assert_eq!(destination.calls(Operation::Create), 6);
    assert_eq!(destination.mutations_of("S1"), 1);
    assert_eq!(destination.mutations_of("E1"), 1);
    // Planner lookups for the file and S2, plus the create-time lookup of S2
    assert_eq!(destination.calls(Operation::List) - lists_before, 3);

    assert_eq!(status_of(ledger.as_ref(), &run_id, "1.dcm"), LedgerStatus::Done);
    assert_eq!(status_of(ledger.as_ref(), &run_id, "S2"), LedgerStatus::Done);
    assert_eq!(
        ledger.run(&run_id).unwrap().unwrap().outcome.as_deref(),
        Some("succeeded")
    );
}

#[tokio::test]
async fn test_short_receipt_is_retried() {
    let source = source_archive();
    let destination = empty_destination();
    let ledger = Arc::new(MemoryLedger::new());
    destination.inject(Operation::Upload, Some("1.dcm"), Failure::ShortReceipt, 1);

    let report = migration(
        &source,
        &destination,
        ledger.clone(),
        config().with_max_unit_attempts(3),
    )
    .run(None)
    .await
    .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(destination.calls(Operation::Upload), 2);
    let file = ledger
        .snapshot(&report.run_id)
        .unwrap()
        .into_iter()
        .find(|r| r.label == "1.dcm")
        .unwrap();
    assert_eq!(file.status, LedgerStatus::Done);
    assert_eq!(file.attempt_count, 2);

    let stored = destination
        .lookup(&["P1", "S1", "E1", "1", "DICOM", "1.dcm"])
        .unwrap();
    assert_eq!(destination.content(&stored.id).unwrap().as_ref(), SCAN_BYTES);
}

#[tokio::test]
async fn test_integrity_failure_is_never_done() {
    let source = source_archive();
    let destination = empty_destination();
    let ledger = Arc::new(MemoryLedger::new());
    destination.inject(Operation::Upload, Some("1.dcm"), Failure::ShortReceipt, 10);

    let report = migration(
        &source,
        &destination,
        ledger.clone(),
        config().with_continue_on_error(true),
    )
    .run(None)
    .await
    .unwrap();

    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.failures[0].class, "transfer_integrity");
    assert_eq!(
        status_of(ledger.as_ref(), &report.run_id, "1.dcm"),
        LedgerStatus::Failed
    );
    // The rest of the tree is unaffected
    assert_eq!(status_of(ledger.as_ref(), &report.run_id, "S2"), LedgerStatus::Done);
    assert_eq!(report.exit_code(), 1);
}

fn destination_with_divergent_subject() -> Arc<InMemoryServer> {
    let destination = empty_destination();
    let project = destination
        .add_project("P1", fields(&[("description", "pilot study")]))
        .unwrap();
    destination
        .add_child(&project, EntityKind::Subject, "S1", fields(&[("group", "patient")]))
        .unwrap();
    destination
}

#[tokio::test]
async fn test_divergent_entity_is_reported_not_overwritten() {
    let source = source_archive();
    let destination = destination_with_divergent_subject();
    let ledger = Arc::new(MemoryLedger::new());

    let report = migration(&source, &destination, ledger.clone(), config())
        .run(None)
        .await
        .unwrap();

    assert_eq!(report.counts.conflicts, 1);
    assert_eq!(report.conflicts[0].label, "S1");
    assert!(report.conflicts[0].cause.contains("group"));
    assert_eq!(
        report.conflicts[0].destination_id,
        destination.lookup(&["P1", "S1"]).map(|s| s.id)
    );
    assert!(report.is_success(), "{}", report);

    let s1 = destination.lookup(&["P1", "S1"]).unwrap();
    assert_eq!(s1.metadata.get("group").map(String::as_str), Some("patient"));
    assert_eq!(destination.mutations_of("S1"), 0);
    assert_eq!(
        status_of(ledger.as_ref(), &report.run_id, "S1"),
        LedgerStatus::Conflict
    );

    // Children still land under the existing subject
    assert!(destination.lookup(&["P1", "S1", "E1"]).is_some());
}

#[tokio::test]
async fn test_force_update_reconciles_divergent_entity() {
    let source = source_archive();
    let destination = destination_with_divergent_subject();

    let report = migration(
        &source,
        &destination,
        Arc::new(MemoryLedger::new()),
        config().with_force_update(true),
    )
    .run(None)
    .await
    .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.counts.conflicts, 0);
    assert_eq!(report.counts.updated, 1);
    let s1 = destination.lookup(&["P1", "S1"]).unwrap();
    assert_eq!(s1.metadata.get("group").map(String::as_str), Some("control"));
    assert_eq!(destination.calls(Operation::Update), 1);
}

#[tokio::test]
async fn test_existing_equivalent_entities_are_skipped() {
    let s2_fields = fields(&[("group", "patient"), ("gender", "F"), ("handedness", "left")]);
    let source = Arc::new(InMemoryServer::new(ServerRole::Source, "XNAT"));
    let project = source
        .add_project("P1", fields(&[("description", "pilot study")]))
        .unwrap();
    source
        .add_child(&project, EntityKind::Subject, "S1", fields(&[("group", "control")]))
        .unwrap();
    source
        .add_child(&project, EntityKind::Subject, "S2", s2_fields.clone())
        .unwrap();

    // The destination already holds P1 and an identical S2, plus fields the
    // source never had
    let destination = empty_destination();
    let dest_project = destination
        .add_project("P1", fields(&[("description", "pilot study"), ("pi_lastname", "Smith")]))
        .unwrap();
    destination
        .add_child(&dest_project, EntityKind::Subject, "S2", s2_fields)
        .unwrap();
    let ledger = Arc::new(MemoryLedger::new());

    let report = migration(&source, &destination, ledger.clone(), config())
        .run(None)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.counts.created, 1);
    assert_eq!(report.counts.skipped_existing, 2);
    assert_eq!(report.counts.conflicts, 0);
    assert_eq!(destination.mutations_of("S1"), 1);
    assert_eq!(destination.mutations_of("S2"), 0);
    assert_eq!(destination.mutations_of("P1"), 0);
    assert_eq!(destination.calls(Operation::Update), 0);
    for label in ["P1", "S1", "S2"] {
        assert_eq!(
            status_of(ledger.as_ref(), &report.run_id, label),
            LedgerStatus::Done
        );
    }
    let s2 = destination.lookup(&["P1", "S2"]).unwrap();
    assert_eq!(s2.metadata.get("handedness").map(String::as_str), Some("left"));
}

/// P1 with `subjects` subjects, two sessions each, one resource per session
/// and three files per resource. Every label is unique. Returns the archive
/// and the (parent, child) label pairs.
fn wide_archive(subjects: usize) -> (Arc<InMemoryServer>, Vec<(String, String)>) {
    let source = Arc::new(InMemoryServer::new(ServerRole::Source, "XNAT"));
    let project = source.add_project("P1", Metadata::new()).unwrap();
    let mut edges = Vec::new();
    for s in 0..subjects {
        let subject_label = format!("S{}", s);
        let subject = source
            .add_child(&project, EntityKind::Subject, &subject_label, fields(&[("group", "control")]))
            .unwrap();
        edges.push(("P1".to_string(), subject_label.clone()));
        for e in 0..2 {
            let session_label = format!("{}_E{}", subject_label, e);
            let session = source
                .add_child(
                    &subject,
                    EntityKind::Session,
                    &session_label,
                    fields(&[("xsiType", "xnat:mrSessionData")]),
                )
                .unwrap();
            edges.push((subject_label.clone(), session_label.clone()));
            let resource_label = format!("{}_DICOM", session_label);
            let resource = source
                .add_child(&session, EntityKind::Resource, &resource_label, Metadata::new())
                .unwrap();
            edges.push((session_label.clone(), resource_label.clone()));
            for f in 0..3 {
                let name = format!("{}_{}.dcm", session_label, f);
                source
                    .add_file(&resource, &name, format!("pixels of {}", name).into_bytes())
                    .unwrap();
                edges.push((resource_label.clone(), name));
            }
        }
    }
    (source, edges)
}

#[tokio::test]
async fn test_concurrent_completions_keep_parents_first() {
    let (source, edges) = wide_archive(6);
    let destination = empty_destination();
    source.set_latency(Duration::from_millis(3));
    destination.set_latency(Duration::from_millis(2));

    let report = migration(
        &source,
        &destination,
        Arc::new(MemoryLedger::new()),
        config().with_concurrency(8),
    )
    .run(None)
    .await
    .unwrap();

    // 1 project, 6 subjects, 12 sessions, 12 resources, 36 files
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.counts.created, 67);
    assert_eq!(destination.len(), 67);

    let order: Vec<String> = destination.mutations().into_iter().map(|m| m.label).collect();
    let position = |label: &str| {
        order
            .iter()
            .position(|l| l == label)
            .unwrap_or_else(|| panic!("{} never written", label))
    };
    for (parent, child) in &edges {
        assert!(position(parent) < position(child), "{} written before {}", child, parent);
    }

    let second = migration(
        &source,
        &destination,
        Arc::new(MemoryLedger::new()),
        config().with_concurrency(8),
    )
    .run(None)
    .await
    .unwrap();
    assert!(second.is_success(), "{}", second);
    assert_eq!(second.counts.skipped_existing, 67);
    assert_eq!(destination.mutations().len(), order.len());
}

#[tokio::test]
async fn test_references_follow_accession_numbers() {
    let source = Arc::new(InMemoryServer::new(ServerRole::Source, "XNAT"));
    let project = source.add_project("P1", Metadata::new()).unwrap();
    let subject = source
        .add_child(
            &project,
            EntityKind::Subject,
            "S1",
            fields(&[("ID", "XNAT_S00001"), ("group", "control")]),
        )
        .unwrap();
    source
        .add_child(
            &subject,
            EntityKind::Session,
            "E1",
            fields(&[
                ("ID", "XNAT_E00001"),
                ("subject_ID", "XNAT_S00001"),
                ("xsiType", "xnat:mrSessionData"),
            ]),
        )
        .unwrap();
    // The server identifier is not what the session quotes
    assert_ne!(subject, "XNAT_S00001");
    let destination = empty_destination();

    let report = migration(&source, &destination, Arc::new(MemoryLedger::new()), config())
        .run(None)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    let dest_subject = destination.lookup(&["P1", "S1"]).unwrap();
    let dest_session = destination.lookup(&["P1", "S1", "E1"]).unwrap();
    assert_eq!(
        dest_session.metadata.get("subject_ID"),
        Some(&dest_subject.id)
    );
    assert_ne!(dest_session.metadata.get("ID").map(String::as_str), Some("XNAT_E00001"));
}

#[tokio::test]
async fn test_dry_run_reports_plan_only() {
    let source = source_archive();
    let destination = destination_with_divergent_subject();
    let ledger = Arc::new(MemoryLedger::new());

    let report = migration(
        &source,
        &destination,
        ledger.clone(),
        config().with_dry_run(true),
    )
    .run(None)
    .await
    .unwrap();

    assert!(report.dry_run);
    let actions: Vec<(String, PlannedAction)> = report
        .plan
        .iter()
        .map(|p| (p.label.clone(), p.action))
        .collect();
    assert_eq!(
        actions,
        vec![
            ("P1".to_string(), PlannedAction::SkipExisting),
            ("S1".to_string(), PlannedAction::Conflict),
            ("S2".to_string(), PlannedAction::Create),
            ("E1".to_string(), PlannedAction::Create),
            ("1".to_string(), PlannedAction::Create),
            ("DICOM".to_string(), PlannedAction::Create),
            ("1.dcm".to_string(), PlannedAction::Create),
        ]
    );
    assert!(destination.mutations().is_empty());
    assert!(ledger.latest_run().unwrap().is_none());
}

#[tokio::test]
async fn test_failure_policy() {
    // Fail-fast: the first failed unit stops dispatch
    let source = source_archive();
    let destination = empty_destination();
    destination.inject(Operation::Create, Some("S1"), Failure::Rejected, 1);
    let report = migration(&source, &destination, Arc::new(MemoryLedger::new()), config())
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.failures[0].class, "rejected");
    assert!(report.aborted.is_some());
    assert!(destination.lookup(&["P1", "S2"]).is_none());
    // Permanent errors are not retried
    assert_eq!(destination.calls(Operation::Create), 2);

    // Continue: the failed subtree is blocked, siblings still migrate
    let destination = empty_destination();
    destination.inject(Operation::Create, Some("S1"), Failure::Rejected, 1);
    let report = migration(
        &source,
        &destination,
        Arc::new(MemoryLedger::new()),
        config().with_continue_on_error(true),
    )
    .run(None)
    .await
    .unwrap();
    assert!(report.aborted.is_none());
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].label, "S1");
    assert!(destination.lookup(&["P1", "S1"]).is_none());
    assert!(destination.lookup(&["P1", "S2"]).is_some());
    // E1 and below were never planned
    assert_eq!(report.counts.total(), 3);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_authorization_error_aborts() {
    let source = source_archive();
    let destination = empty_destination();
    destination.inject(Operation::Create, Some("S1"), Failure::Unauthorized, 1);

    let report = migration(
        &source,
        &destination,
        Arc::new(MemoryLedger::new()),
        config().with_concurrency(1),
    )
    .run(None)
    .await
    .unwrap();

    assert_eq!(report.failures[0].class, "authorization");
    let reason = report.aborted.as_deref().unwrap();
    assert!(reason.contains("S1"), "{}", reason);
    assert!(destination.lookup(&["P1", "S2"]).is_none());
}

#[tokio::test]
async fn test_missing_datatype_stops_before_writing() {
    let source = source_archive();
    source.set_datatypes(&["xnat:mrSessionData", "xnat:mrScanData"]);
    let destination = empty_destination();
    destination.set_datatypes(&["xnat:mrSessionData"]);

    let err = migration(
        &source,
        &destination,
        Arc::new(MemoryLedger::new()),
        config().with_check_datatypes(true),
    )
    .run(None)
    .await
    .unwrap_err();

    match err {
        MigrateError::UnsupportedDatatype { missing } => {
            assert_eq!(missing, vec!["xnat:mrScanData".to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(destination.mutations().is_empty());
}

#[tokio::test]
async fn test_renamed_project_and_id_maps() {
    let tmp = TempDir::new().unwrap();
    let source = source_archive();
    let destination = empty_destination();
    let mapping = ProjectMapping::parse("P1:P1_COPY")
        .unwrap()
        .with_secondary_id("copy");
    let config = MigrationConfig::new(vec![mapping])
        .with_retry(RetryConfig::immediate(1))
        .with_check_datatypes(false)
        .with_id_map_dir(tmp.path());

    let report = migration(&source, &destination, Arc::new(MemoryLedger::new()), config)
        .run(None)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    let project = destination.lookup(&["P1_COPY"]).unwrap();
    assert_eq!(project.metadata.get("secondary_ID").map(String::as_str), Some("copy"));
    assert!(destination.lookup(&["P1_COPY", "S1", "E1"]).is_some());

    let subjects = std::fs::read_to_string(tmp.path().join("subject_id_map.json")).unwrap();
    let subjects: serde_json::Value = serde_json::from_str(&subjects).unwrap();
    assert_eq!(subjects.as_object().unwrap().len(), 2);
    assert!(report.id_map_files.iter().any(|p| p.ends_with("file_id_map.json")));
}

/// Source wrapper on which one entity disappears after listing.
struct Vanishing {
    inner: Arc<InMemoryServer>,
    label: String,
}

#[async_trait]
impl RestClient for Vanishing {
    fn role(&self) -> ServerRole {
        self.inner.role()
    }

    async fn list(
        &self,
        parent: Option<&str>,
        kind: EntityKind,
    ) -> xmigrate_core::Result<Vec<RemoteEntity>> {
        self.inner.list(parent, kind).await
    }

    async fn get(&self, id: &str, kind: EntityKind) -> xmigrate_core::Result<Option<RemoteEntity>> {
        let found = self.inner.get(id, kind).await?;
        Ok(found.filter(|e| e.label != self.label))
    }

    async fn create(
        &self,
        parent: Option<&str>,
        payload: &EntityPayload,
    ) -> xmigrate_core::Result<RemoteEntity> {
        self.inner.create(parent, payload).await
    }

    async fn update(&self, id: &str, kind: EntityKind, fields: &Metadata) -> xmigrate_core::Result<()> {
        self.inner.update(id, kind, fields).await
    }

    async fn upload(
        &self,
        resource_id: &str,
        name: &str,
        content: ByteStream,
        overwrite: bool,
    ) -> xmigrate_core::Result<UploadReceipt> {
        self.inner.upload(resource_id, name, content, overwrite).await
    }

    async fn download(&self, id: &str) -> xmigrate_core::Result<ByteStream> {
        self.inner.download(id).await
    }
}

#[tokio::test]
async fn test_vanished_entity_is_skipped() {
    let source = Arc::new(Vanishing {
        inner: source_archive(),
        label: "S2".to_string(),
    });
    let destination = empty_destination();
    let ledger = Arc::new(MemoryLedger::new());

    let report = Migration::new(source, destination.clone(), ledger.clone(), config())
        .run(None)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.counts.skipped_missing, 1);
    assert_eq!(report.missing[0].label, "S2");
    assert!(destination.lookup(&["P1", "S2"]).is_none());
    assert_eq!(
        status_of(ledger.as_ref(), &report.run_id, "S2"),
        LedgerStatus::Skipped
    );
}

#[tokio::test]
async fn test_cancelled_run_resumes_without_duplicates() {
    let source = source_archive();
    source.set_latency(Duration::from_millis(20));
    let destination = empty_destination();
    let ledger = Arc::new(MemoryLedger::new());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let report = migration(&source, &destination, ledger.clone(), config())
        .with_cancellation(cancel)
        .run(None)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.exit_code(), 130);
    assert!(report.counts.pending > 0);
    assert!(destination.len() < 7);
    assert_eq!(
        ledger.run(&report.run_id).unwrap().unwrap().outcome.as_deref(),
        Some("cancelled")
    );

    source.set_latency(Duration::ZERO);
    let resumed = migration(&source, &destination, ledger.clone(), config())
        .run(Some(&report.run_id))
        .await
        .unwrap();
    assert!(resumed.is_success(), "{}", resumed);
    assert_eq!(destination.len(), 7);

    let labels: Vec<String> = destination.mutations().into_iter().map(|m| m.label).collect();
    let unique: HashSet<&String> = labels.iter().collect();
    assert_eq!(labels.len(), unique.len(), "duplicate writes: {:?}", labels);
}
