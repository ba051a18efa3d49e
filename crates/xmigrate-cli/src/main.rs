//! xmigrate - migrate projects between XNAT-style imaging archives.
//!
//! `xmigrate migrate` copies one or more projects from a source server to a
//! destination server, recording progress in a SQLite ledger so that an
//! interrupted run can be resumed. `xmigrate status` summarizes a ledger.

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "xmigrate")]
#[command(about = "Resumable migration of imaging projects between XNAT servers")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, env = "XMIGRATE_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate projects from the source to the destination server
    Migrate(MigrateArgs),
    /// Show the progress recorded in a ledger
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Source server base URL
    #[arg(long, env = "XMIGRATE_SOURCE_URL")]
    source_url: String,

    /// Source user name (empty for anonymous access)
    #[arg(long, env = "XMIGRATE_SOURCE_USER", default_value = "")]
    source_user: String,

    /// Source password
    #[arg(long, env = "XMIGRATE_SOURCE_PASSWORD", default_value = "", hide_env_values = true)]
    source_password: String,

    /// Destination server base URL
    #[arg(long, env = "XMIGRATE_DESTINATION_URL")]
    destination_url: String,

    /// Destination user name
    #[arg(long, env = "XMIGRATE_DESTINATION_USER", default_value = "")]
    destination_user: String,

    /// Destination password
    #[arg(
        long,
        env = "XMIGRATE_DESTINATION_PASSWORD",
        default_value = "",
        hide_env_values = true
    )]
    destination_password: String,

    /// Project to migrate, as SOURCE or SOURCE:DESTINATION (repeatable)
    #[arg(
        short,
        long = "project",
        env = "XMIGRATE_PROJECTS",
        value_delimiter = ',',
        required = true
    )]
    projects: Vec<String>,

    /// Secondary ID of the destination project, matched to --project by
    /// position; an empty value keeps the source's (repeatable)
    #[arg(long = "destination-secondary-id", env = "XMIGRATE_DESTINATION_SECONDARY_ID")]
    destination_secondary_ids: Vec<String>,

    /// Name of the destination project, matched to --project by position;
    /// an empty value keeps the source's (repeatable)
    #[arg(long = "destination-project-name", env = "XMIGRATE_DESTINATION_PROJECT_NAME")]
    destination_project_names: Vec<String>,

    /// Reconcile divergent destination metadata instead of reporting conflicts
    #[arg(long, env = "XMIGRATE_FORCE_UPDATE")]
    force_update: bool,

    /// Number of entities migrated concurrently
    #[arg(short, long, env = "XMIGRATE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Resume a previous run; without a value, the most recent one
    #[arg(long, env = "XMIGRATE_RESUME", num_args = 0..=1, default_missing_value = commands::LATEST_RUN)]
    resume: Option<String>,

    /// Plan the migration and report it without writing anything
    #[arg(long, env = "XMIGRATE_DRY_RUN")]
    dry_run: bool,

    /// Keep going after failed entities and authorization errors
    #[arg(long, env = "XMIGRATE_CONTINUE_ON_ERROR")]
    continue_on_error: bool,

    /// Skip the check that source datatypes are enabled on the destination
    #[arg(long, env = "XMIGRATE_SKIP_DATATYPE_CHECK")]
    skip_datatype_check: bool,

    /// Ledger database (defaults to the user data directory)
    #[arg(long, env = "XMIGRATE_LEDGER")]
    ledger: Option<PathBuf>,

    /// Where to write the JSON run report
    #[arg(long, env = "XMIGRATE_REPORT")]
    report: Option<PathBuf>,

    /// Directory to write per-kind ID maps to
    #[arg(long, env = "XMIGRATE_ID_MAP_DIR")]
    id_map_dir: Option<PathBuf>,

    /// Attempts per entity before it is marked failed
    #[arg(long, env = "XMIGRATE_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Timeout for each metadata request, in seconds
    #[arg(long, env = "XMIGRATE_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Ledger database (defaults to the user data directory)
    #[arg(long, env = "XMIGRATE_LEDGER")]
    ledger: Option<PathBuf>,

    /// Run to inspect (defaults to the most recent one)
    #[arg(long)]
    run: Option<String>,

    /// Print records as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Command::Migrate(args) => commands::migrate(args).await,
        Command::Status(args) => commands::status(args),
    }
}
