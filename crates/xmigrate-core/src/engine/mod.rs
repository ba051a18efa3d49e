//! The migration engine: read, plan, write, record.

mod orchestrator;
mod planner;
mod preflight;
mod reader;
mod report;
mod writer;

pub use orchestrator::Migration;
pub use planner::{MigrationUnit, PlannedAction, Planner};
pub use preflight::check_datatypes;
pub use reader::SourceReader;
pub use report::{PlanEntry, RunReport, UnitCounts, UnitIssue};
pub use writer::{DestinationWriter, EnsureOutcome, UploadConfirmation, WriteEffect};
