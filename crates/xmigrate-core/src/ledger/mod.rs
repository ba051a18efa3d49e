//! Progress and resume ledger.
//!
//! Records, per run and per source entity, how far the migration got. A
//! re-run with the same run id consults it to skip work already confirmed:
//! - `SqliteLedger` persists to a SQLite database (WAL, full sync)
//! - `MemoryLedger` keeps everything in process, for tests and dry runs

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;
pub use traits::{LedgerRecord, LedgerStatus, LedgerStore, RunInfo};
