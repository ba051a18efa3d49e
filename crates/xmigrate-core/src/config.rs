//! Centralized configuration for the migration engine.
//!
//! Constant tables hold the defaults; [`MigrationConfig`] is the per-run
//! configuration assembled by callers (the CLI fills it from flags).

use crate::error::{MigrateError, Result};
use crate::network::RetryConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
    pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
    pub const USER_AGENT: &'static str = "xmigrate/0.1";
}

/// Run-level defaults.
pub struct RunConfig;

impl RunConfig {
    pub const DEFAULT_CONCURRENCY: usize = 4;
    pub const MAX_CONCURRENCY: usize = 64;
    pub const MAX_UNIT_ATTEMPTS: u32 = 3;
}

/// Ledger storage configuration.
pub struct LedgerConfig;

impl LedgerConfig {
    pub const DEFAULT_FILENAME: &'static str = "xmigrate-ledger.sqlite";
    pub const REPORT_FILENAME: &'static str = "xmigrate-report.json";
}

/// Metadata fields assigned by the server; never compared nor copied.
pub const SERVER_ASSIGNED_FIELDS: &[&str] = &[
    "ID",
    "project",
    "URI",
    "insert_date",
    "insert_user",
    "last_modified",
    "xnat_abstractresource_id",
    "cat_id",
];

/// One source project and where it lands on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMapping {
    /// Project ID on the source server.
    pub source: String,
    /// Project ID to create on the destination server.
    pub destination: String,
    /// Optional secondary ID for the destination project.
    pub secondary_id: Option<String>,
    /// Optional display name for the destination project.
    pub name: Option<String>,
}

impl ProjectMapping {
    /// Map a project onto a destination project of the same ID.
    pub fn same(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            destination: id.clone(),
            source: id,
            secondary_id: None,
            name: None,
        }
    }

    /// Parse `SRC` or `SRC:DST`.
    pub fn parse(selector: &str) -> Result<Self> {
        let (source, destination) = match selector.split_once(':') {
            Some((src, dst)) => (src.trim(), dst.trim()),
            None => (selector.trim(), selector.trim()),
        };
        if source.is_empty() || destination.is_empty() {
            return Err(MigrateError::Config {
                message: format!("Invalid project selector '{}', expected SRC or SRC:DST", selector),
            });
        }
        Ok(Self {
            source: source.to_string(),
            destination: destination.to_string(),
            secondary_id: None,
            name: None,
        })
    }

    pub fn with_secondary_id(mut self, secondary_id: impl Into<String>) -> Self {
        self.secondary_id = Some(secondary_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Configuration for one migration run.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Projects to migrate, in order.
    pub projects: Vec<ProjectMapping>,
    /// Reconcile metadata of divergent destination entities instead of
    /// reporting them as conflicts.
    pub force_update: bool,
    /// Maximum number of units in flight.
    pub concurrency: usize,
    /// Plan only; never mutate the destination nor the ledger.
    pub dry_run: bool,
    /// Keep going after Failed units and authorization errors.
    pub continue_on_error: bool,
    /// Attempts per unit before it is marked Failed.
    pub max_unit_attempts: u32,
    /// Backoff between unit attempts, and for individual network calls.
    pub retry: RetryConfig,
    /// Timeout applied to each metadata request.
    pub request_timeout: Duration,
    /// Timeout applied to each file transfer.
    pub transfer_timeout: Duration,
    /// Check that source datatypes are enabled on the destination first.
    pub check_datatypes: bool,
    /// Directory to write per-kind ID maps to after the run.
    pub id_map_dir: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            force_update: false,
            concurrency: RunConfig::DEFAULT_CONCURRENCY,
            dry_run: false,
            continue_on_error: false,
            max_unit_attempts: RunConfig::MAX_UNIT_ATTEMPTS,
            retry: RetryConfig::default()
                .with_max_attempts(NetworkConfig::MAX_RETRIES)
                .with_base_delay(NetworkConfig::RETRY_BASE_DELAY)
                .with_max_delay(NetworkConfig::RETRY_MAX_DELAY),
            request_timeout: NetworkConfig::REQUEST_TIMEOUT,
            transfer_timeout: NetworkConfig::TRANSFER_TIMEOUT,
            check_datatypes: true,
            id_map_dir: None,
        }
    }
}

impl MigrationConfig {
    /// Create a config migrating the given projects with default settings.
    pub fn new(projects: Vec<ProjectMapping>) -> Self {
        Self {
            projects,
            ..Self::default()
        }
    }

    pub fn with_force_update(mut self, force_update: bool) -> Self {
        self.force_update = force_update;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_max_unit_attempts(mut self, attempts: u32) -> Self {
        self.max_unit_attempts = attempts;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_check_datatypes(mut self, check: bool) -> Self {
        self.check_datatypes = check;
        self
    }

    pub fn with_id_map_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.id_map_dir = Some(dir.into());
        self
    }

    /// Reject configurations the orchestrator cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.projects.is_empty() {
            return Err(MigrateError::Config {
                message: "No source projects specified".to_string(),
            });
        }
        if self.concurrency == 0 || self.concurrency > RunConfig::MAX_CONCURRENCY {
            return Err(MigrateError::Config {
                message: format!(
                    "Concurrency must be between 1 and {}, got {}",
                    RunConfig::MAX_CONCURRENCY,
                    self.concurrency
                ),
            });
        }
        if self.max_unit_attempts == 0 {
            return Err(MigrateError::Config {
                message: "max_unit_attempts must be at least 1".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if !seen.insert(project.source.as_str()) {
                return Err(MigrateError::Config {
                    message: format!("Source project '{}' listed twice", project.source),
                });
            }
        }
        Ok(())
    }
}
