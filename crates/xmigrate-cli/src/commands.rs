//! Subcommand implementations.

use crate::{MigrateArgs, StatusArgs};
use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use xmigrate_core::config::{LedgerConfig, MigrationConfig, ProjectMapping};
use xmigrate_core::ledger::{LedgerStatus, LedgerStore, SqliteLedger};
use xmigrate_core::{CancellationToken, Migration, ServerRole, XnatClient};

/// `--resume` value standing for the most recent run in the ledger.
pub(crate) const LATEST_RUN: &str = "latest";

fn ledger_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let dir = dirs::data_local_dir()
        .map(|d| d.join("xmigrate"))
        .ok_or_else(|| anyhow!("No data directory on this platform; pass --ledger"))?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir.join(LedgerConfig::DEFAULT_FILENAME))
}

fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// Project mappings from `--project` selectors and the descriptors given
/// for them by position.
fn project_mappings(
    selectors: &[String],
    secondary_ids: &[String],
    names: &[String],
) -> Result<Vec<ProjectMapping>> {
    if secondary_ids.len() > selectors.len() {
        bail!(
            "{} destination secondary IDs given for {} projects",
            secondary_ids.len(),
            selectors.len()
        );
    }
    if names.len() > selectors.len() {
        bail!(
            "{} destination project names given for {} projects",
            names.len(),
            selectors.len()
        );
    }

    let mut projects = Vec::with_capacity(selectors.len());
    for (index, selector) in selectors.iter().enumerate() {
        let mut project = ProjectMapping::parse(selector)?;
        if let Some(secondary_id) = secondary_ids.get(index).filter(|s| !s.is_empty()) {
            project = project.with_secondary_id(secondary_id.as_str());
        }
        if let Some(name) = names.get(index).filter(|n| !n.is_empty()) {
            project = project.with_name(name.as_str());
        }
        projects.push(project);
    }
    Ok(projects)
}

pub(crate) async fn migrate(args: MigrateArgs) -> Result<ExitCode> {
    let projects = project_mappings(
        &args.projects,
        &args.destination_secondary_ids,
        &args.destination_project_names,
    )?;

    let request_timeout = Duration::from_secs(args.timeout_secs);
    let source = XnatClient::connect(
        &args.source_url,
        ServerRole::Source,
        &args.source_user,
        &args.source_password,
    )?
    .with_request_timeout(request_timeout);
    let destination = XnatClient::connect(
        &args.destination_url,
        ServerRole::Destination,
        &args.destination_user,
        &args.destination_password,
    )?
    .with_request_timeout(request_timeout);

    let ledger_path = ledger_path(args.ledger)?;
    info!("Ledger: {}", ledger_path.display());
    let ledger = Arc::new(SqliteLedger::open(&ledger_path)?);

    let resume = match args.resume.as_deref() {
        None => None,
        Some(LATEST_RUN) => {
            let latest = ledger
                .latest_run()?
                .ok_or_else(|| anyhow!("Nothing to resume: {} has no runs", ledger_path.display()))?;
            Some(latest.run_id)
        }
        Some(run_id) => Some(run_id.to_string()),
    };

    let mut config = MigrationConfig::new(projects)
        .with_force_update(args.force_update)
        .with_concurrency(args.concurrency)
        .with_dry_run(args.dry_run)
        .with_continue_on_error(args.continue_on_error)
        .with_max_unit_attempts(args.max_attempts)
        .with_request_timeout(request_timeout)
        .with_check_datatypes(!args.skip_datatype_check);
    if let Some(dir) = args.id_map_dir {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        config = config.with_id_map_dir(dir);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight transfers before stopping");
            on_signal.cancel();
        }
    });

    let migration = Migration::new(Arc::new(source), Arc::new(destination), ledger, config)
        .with_cancellation(cancel);
    let report = migration.run(resume.as_deref()).await?;

    println!("{}", report);
    let report_path = args
        .report
        .unwrap_or_else(|| PathBuf::from(LedgerConfig::REPORT_FILENAME));
    report
        .write_json(&report_path)
        .with_context(|| format!("Failed to write report to {}", report_path.display()))?;
    info!("Report written to {}", report_path.display());

    Ok(ExitCode::from(exit_status(report.exit_code())))
}

pub(crate) fn status(args: StatusArgs) -> Result<ExitCode> {
    let ledger_path = ledger_path(args.ledger)?;
    if !ledger_path.exists() {
        bail!("No ledger at {}", ledger_path.display());
    }
    let ledger = SqliteLedger::open(&ledger_path)?;

    let run = match args.run {
        Some(run_id) => ledger
            .run(&run_id)?
            .ok_or_else(|| anyhow!("No run '{}' in {}", run_id, ledger_path.display()))?,
        None => ledger
            .latest_run()?
            .ok_or_else(|| anyhow!("{} has no runs", ledger_path.display()))?,
    };

    if args.json {
        let records = ledger.snapshot(&run.run_id)?;
        let out = serde_json::json!({ "run": run, "records": records });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Run {}", run.run_id);
    println!("  projects: {}", run.projects.join(", "));
    println!("  started:  {}", run.started_at.to_rfc3339());
    match (&run.finished_at, &run.outcome) {
        (Some(finished), Some(outcome)) => {
            println!("  finished: {} ({})", finished.to_rfc3339(), outcome)
        }
        _ => println!("  finished: not yet"),
    }

    let counts = ledger.counts(&run.run_id)?;
    for status in LedgerStatus::ALL {
        println!("  {:<12} {}", status.as_str(), counts.get(&status).copied().unwrap_or(0));
    }

    for record in ledger.snapshot(&run.run_id)? {
        if matches!(record.status, LedgerStatus::Failed | LedgerStatus::Conflict) {
            println!(
                "  {} {} '{}' ({}): {}",
                record.status,
                record.kind,
                record.label,
                record.source_id,
                record.last_error.as_deref().unwrap_or("")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xmigrate_core::ledger::RunInfo;
    use xmigrate_core::model::Entity;

    fn status_args(ledger: PathBuf, run: Option<&str>) -> StatusArgs {
        StatusArgs {
            ledger: Some(ledger),
            run: run.map(str::to_string),
            json: false,
        }
    }

    #[test]
    fn test_status_reads_ledger() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.sqlite");
        {
            let ledger = SqliteLedger::open(&path).unwrap();
            ledger.begin_run(&RunInfo::new("r1", vec!["P1:P1".into()])).unwrap();
            let project = Entity::project("P1", "P1");
            ledger.register("r1", &project).unwrap();
            ledger
                .mark("r1", "P1", LedgerStatus::Failed, Some("503"))
                .unwrap();
        }

        assert!(status(status_args(path.clone(), None)).is_ok());
        assert!(status(status_args(path.clone(), Some("r1"))).is_ok());
        assert!(status(status_args(path, Some("missing"))).is_err());
    }

    #[test]
    fn test_status_without_ledger_fails() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.sqlite");
        assert!(status(status_args(missing, None)).is_err());
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_project_descriptors_matched_by_position() {
        let projects = project_mappings(
            &strings(&["P1:NEW_P1", "P2", "P3"]),
            &strings(&["NEW PILOT", ""]),
            &strings(&["", "Second study"]),
        )
        .unwrap();

        assert_eq!(projects.len(), 3);
        assert_eq!(projects[0].destination, "NEW_P1");
        assert_eq!(projects[0].secondary_id.as_deref(), Some("NEW PILOT"));
        assert_eq!(projects[0].name, None);
        assert_eq!(projects[1].secondary_id, None);
        assert_eq!(projects[1].name.as_deref(), Some("Second study"));
        assert_eq!(projects[2].secondary_id, None);
        assert_eq!(projects[2].name, None);
    }

    #[test]
    fn test_more_descriptors_than_projects_is_an_error() {
        assert!(project_mappings(&strings(&["P1"]), &strings(&["A", "B"]), &[]).is_err());
        assert!(project_mappings(&strings(&["P1"]), &[], &strings(&["A", "B"])).is_err());
    }

    #[test]
    fn test_exit_status_clamps() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(130), 130);
        assert_eq!(exit_status(-1), 1);
    }
}
