//! Entity model and identifier mapping.

mod entity;
mod mapping;

pub use entity::{ContentInfo, Entity, EntityKind, Metadata, NaturalKey};
pub use mapping::IdMapping;
