//! Metadata handling: destination rewriting and atomic JSON persistence.

mod atomic;
mod mapper;

pub use atomic::{atomic_read_json, atomic_write_bytes, atomic_write_json};
pub use mapper::{
    changed_subset, comparable, diff_fields, MetadataMapper, ACCESSION_FIELD, XSI_TYPE_FIELD,
};
