//! xmigrate core - resumable migration of imaging-data archives between
//! XNAT-style servers.
//!
//! The engine walks a source hierarchy (projects, subjects, sessions, scans,
//! assessors, resources, files) depth-first, decides per entity whether the
//! destination needs it created, updated, or left alone, and records every
//! confirmed step in a durable ledger so an interrupted run picks up where it
//! stopped.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xmigrate_core::{InMemoryServer, MemoryLedger, Migration, MigrationConfig, ProjectMapping, ServerRole};
//!
//! #[tokio::main]
//! async fn main() -> xmigrate_core::Result<()> {
//!     let source = Arc::new(InMemoryServer::new(ServerRole::Source, "SRC"));
//!     source.add_project("P1", Default::default())?;
//!     let destination = Arc::new(InMemoryServer::new(ServerRole::Destination, "DST"));
//!
//!     let config = MigrationConfig::new(vec![ProjectMapping::same("P1")]).with_check_datatypes(false);
//!     let migration = Migration::new(source, destination, Arc::new(MemoryLedger::new()), config);
//!     let report = migration.run(None).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metadata;
pub mod model;
pub mod network;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use client::{DynRestClient, InMemoryServer, RestClient, XnatClient};
pub use config::{MigrationConfig, ProjectMapping};
pub use engine::{Migration, PlannedAction, RunReport};
pub use error::{Attempt, Disposition, MigrateError, Result};
pub use ledger::{LedgerStatus, LedgerStore, MemoryLedger, SqliteLedger};
pub use model::{Entity, EntityKind, IdMapping};
pub use network::ServerRole;
