//! Source ↔ destination identifier mapping.
//!
//! Append-only for the lifetime of a run: once an entity has a destination
//! identity it keeps it.

use crate::metadata::atomic_write_json;
use crate::model::EntityKind;
use crate::{MigrateError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Clone)]
struct KindMap {
    forward: BTreeMap<String, String>,
    reverse: HashMap<String, String>,
}

impl KindMap {
    fn insert(&mut self, kind: EntityKind, source_id: &str, destination_id: &str) -> Result<bool> {
        if let Some(existing) = self.forward.get(source_id) {
            if existing == destination_id {
                return Ok(false);
            }
            return Err(MigrateError::MappingConflict {
                kind,
                source_id: source_id.to_string(),
                existing: existing.clone(),
                attempted: destination_id.to_string(),
            });
        }

        if let Some(other_source) = self.reverse.get(destination_id) {
            return Err(MigrateError::MappingConflict {
                kind,
                source_id: source_id.to_string(),
                existing: format!("{} (claimed by {})", destination_id, other_source),
                attempted: destination_id.to_string(),
            });
        }

        self.forward.insert(source_id.to_string(), destination_id.to_string());
        self.reverse.insert(destination_id.to_string(), source_id.to_string());
        Ok(true)
    }
}

/// Bidirectional, per-kind identifier mapping.
///
/// Two namespaces are kept per kind: server identifiers (what a
/// [`RestClient`](crate::client::RestClient) addresses entities by) and
/// accession numbers (the `ID` other entities quote in reference fields).
/// On some servers the two coincide.
#[derive(Debug, Default, Clone)]
pub struct IdMapping {
    kinds: HashMap<EntityKind, KindMap>,
    accessions: HashMap<EntityKind, KindMap>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destination identifier for `source_id`, if recorded.
    pub fn resolve(&self, source_id: &str, kind: EntityKind) -> Option<&str> {
        self.kinds
            .get(&kind)
            .and_then(|m| m.forward.get(source_id))
            .map(String::as_str)
    }

    /// Record a mapping.
    ///
    /// Re-recording an identical pair is a no-op and returns `Ok(false)`.
    /// A different destination for a known source, or a destination already
    /// claimed by another source, fails with `MappingConflict`.
    pub fn record(&mut self, source_id: &str, destination_id: &str, kind: EntityKind) -> Result<bool> {
        let added = self
            .kinds
            .entry(kind)
            .or_default()
            .insert(kind, source_id, destination_id)?;
        if added {
            debug!("Mapped {} {} -> {}", kind, source_id, destination_id);
        }
        Ok(added)
    }

    /// Record that the accession number `source` became `destination`.
    pub fn record_accession(&mut self, source: &str, destination: &str, kind: EntityKind) -> Result<bool> {
        let added = self
            .accessions
            .entry(kind)
            .or_default()
            .insert(kind, source, destination)?;
        if added {
            debug!("Mapped {} accession {} -> {}", kind, source, destination);
        }
        Ok(added)
    }

    /// Destination accession number for a source accession number.
    pub fn resolve_accession(&self, source: &str, kind: EntityKind) -> Option<&str> {
        self.accessions
            .get(&kind)
            .and_then(|m| m.forward.get(source))
            .map(String::as_str)
    }

    /// Destination value for a reference field holding `value`.
    ///
    /// Accession numbers are tried first, then server identifiers.
    pub fn resolve_reference(&self, value: &str, kind: EntityKind) -> Option<&str> {
        self.resolve_accession(value, kind)
            .or_else(|| self.resolve(value, kind))
    }

    /// Number of mappings across all kinds.
    pub fn len(&self) -> usize {
        self.kinds.values().map(|m| m.forward.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All mappings of one kind, ordered by source identifier.
    pub fn entries(&self, kind: EntityKind) -> impl Iterator<Item = (&str, &str)> {
        self.kinds
            .get(&kind)
            .into_iter()
            .flat_map(|m| m.forward.iter().map(|(s, d)| (s.as_str(), d.as_str())))
    }

    /// Write one `{kind}_id_map.json` per non-empty kind into `dir`, plus a
    /// `{kind}_accession_map.json` for kinds with accession numbers.
    pub fn export_json(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for kind in EntityKind::ALL {
            let Some(map) = self.kinds.get(&kind) else {
                continue;
            };
            if map.forward.is_empty() {
                continue;
            }
            let path = dir.join(format!("{}_id_map.json", kind));
            atomic_write_json(&path, &map.forward, false)?;
            written.push(path);
        }
        for kind in EntityKind::ALL {
            let Some(map) = self.accessions.get(&kind) else {
                continue;
            };
            if map.forward.is_empty() {
                continue;
            }
            let path = dir.join(format!("{}_accession_map.json", kind));
            atomic_write_json(&path, &map.forward, false)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::atomic_read_json;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_resolve() {
        let mut mapping = IdMapping::new();
        assert!(mapping.record("XNAT_S1", "DEST_S1", EntityKind::Subject).unwrap());

        assert_eq!(mapping.resolve("XNAT_S1", EntityKind::Subject), Some("DEST_S1"));
        // A destination belongs to one source only
        assert!(mapping.record("XNAT_S2", "DEST_S1", EntityKind::Subject).is_err());
        // Kinds are separate namespaces
        assert_eq!(mapping.resolve("XNAT_S1", EntityKind::Session), None);
    }

    #[test]
    fn test_record_same_pair_is_noop() {
        let mut mapping = IdMapping::new();
        mapping.record("a", "b", EntityKind::Scan).unwrap();
        assert!(!mapping.record("a", "b", EntityKind::Scan).unwrap());
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_record_conflicts() {
        let mut mapping = IdMapping::new();
        mapping.record("a", "b", EntityKind::Subject).unwrap();

        let err = mapping.record("a", "c", EntityKind::Subject).unwrap_err();
        assert!(matches!(err, MigrateError::MappingConflict { .. }));

        let err = mapping.record("z", "b", EntityKind::Subject).unwrap_err();
        assert!(matches!(err, MigrateError::MappingConflict { .. }));

        // Failed records leave the mapping untouched
        assert_eq!(mapping.resolve("a", EntityKind::Subject), Some("b"));
        assert_eq!(mapping.resolve("z", EntityKind::Subject), None);
    }

    #[test]
    fn test_references_prefer_accession_numbers() {
        let mut mapping = IdMapping::new();
        mapping
            .record(
                "/data/projects/P1/subjects/S1",
                "/data/projects/NEW/subjects/S1",
                EntityKind::Subject,
            )
            .unwrap();
        mapping
            .record_accession("XNAT_S00001", "XNAT_S00042", EntityKind::Subject)
            .unwrap();

        assert_eq!(
            mapping.resolve_reference("XNAT_S00001", EntityKind::Subject),
            Some("XNAT_S00042")
        );
        // Server identifiers still resolve where they are the reference value
        assert_eq!(
            mapping.resolve_reference("/data/projects/P1/subjects/S1", EntityKind::Subject),
            Some("/data/projects/NEW/subjects/S1")
        );
        assert!(mapping
            .record_accession("XNAT_S00001", "XNAT_S00043", EntityKind::Subject)
            .is_err());
        // Accession numbers are not counted as identifier mappings
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_export_json() {
        let tmp = TempDir::new().unwrap();
        let mut mapping = IdMapping::new();
        mapping.record("XNAT_S1", "DEST_S1", EntityKind::Subject).unwrap();
        mapping.record("XNAT_E1", "DEST_E1", EntityKind::Session).unwrap();

        let written = mapping.export_json(tmp.path()).unwrap();
        assert_eq!(written.len(), 2);

        let subjects: Option<BTreeMap<String, String>> =
            atomic_read_json(&tmp.path().join("subject_id_map.json")).unwrap();
        assert_eq!(subjects.unwrap().get("XNAT_S1").map(String::as_str), Some("DEST_S1"));
    }
}
