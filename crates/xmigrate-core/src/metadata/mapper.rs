//! Rewrites source metadata into the form the destination should hold.
//!
//! - Server-assigned fields (IDs, URIs, insert dates) are dropped
//! - Project descriptors are replaced by the configured destination values
//! - Cross-references to other entities are remapped through the ID mapping;
//!   references the mapping doesn't know are dropped, the entity's placement
//!   under its parent already carries that relationship
//! - Generic scan datatypes are narrowed from the scan's modality

use crate::config::{ProjectMapping, SERVER_ASSIGNED_FIELDS};
use crate::model::{Entity, EntityKind, IdMapping, Metadata};
use tracing::debug;

/// Field holding the datatype of an entity.
pub const XSI_TYPE_FIELD: &str = "xsiType";

/// Field holding the server-assigned accession number that reference
/// fields of other entities quote.
pub const ACCESSION_FIELD: &str = "ID";

const GENERIC_SCAN_TYPE: &str = "xnat:imageScanData";
const OTHER_SCAN_TYPE: &str = "xnat:otherDicomScanData";

/// Fields that hold the accession number of another entity.
const REFERENCE_FIELDS: &[(&str, EntityKind)] = &[
    ("subject_ID", EntityKind::Subject),
    ("subjectID", EntityKind::Subject),
    ("image_session_ID", EntityKind::Session),
    ("imageSession_ID", EntityKind::Session),
    ("session_id", EntityKind::Session),
    ("scanID", EntityKind::Scan),
    ("imageScan_ID", EntityKind::Scan),
];

fn scan_type_for_modality(modality: &str) -> &'static str {
    match modality {
        "MR" => "xnat:mrScanData",
        "CT" => "xnat:ctScanData",
        "US" => "xnat:usScanData",
        "PT" => "xnat:petScanData",
        "NM" => "xnat:nmScanData",
        _ => OTHER_SCAN_TYPE,
    }
}

/// Per-project metadata rewriter.
#[derive(Debug, Clone)]
pub struct MetadataMapper {
    project: ProjectMapping,
}

impl MetadataMapper {
    pub fn new(project: ProjectMapping) -> Self {
        Self { project }
    }

    pub fn project(&self) -> &ProjectMapping {
        &self.project
    }

    /// Metadata to send to the destination when creating `entity`.
    pub fn map_for_destination(&self, entity: &Entity, mapping: &IdMapping) -> Metadata {
        let mut mapped = comparable(&entity.metadata);

        if entity.kind == EntityKind::Project {
            if let Some(secondary_id) = &self.project.secondary_id {
                mapped.insert("secondary_ID".to_string(), secondary_id.clone());
            }
            if let Some(name) = &self.project.name {
                mapped.insert("name".to_string(), name.clone());
            }
        }

        for (field, kind) in REFERENCE_FIELDS {
            let Some(value) = mapped.get(*field) else {
                continue;
            };
            match mapping.resolve_reference(value, *kind) {
                Some(destination) => {
                    let destination = destination.to_string();
                    mapped.insert(field.to_string(), destination);
                }
                None => {
                    debug!(
                        "Dropping {} of {}: no destination {} for '{}'",
                        field,
                        entity.describe(),
                        kind,
                        value
                    );
                    mapped.remove(*field);
                }
            }
        }

        if entity.kind == EntityKind::Scan {
            normalize_scan_type(&mut mapped);
        }

        mapped
    }
}

/// Drop the fields the server assigns itself.
pub fn comparable(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .filter(|(field, _)| !SERVER_ASSIGNED_FIELDS.contains(&field.as_str()))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

/// Fields of `wanted` that the destination holds differently.
///
/// Only fields present in `wanted` are considered; extra destination fields
/// are ignored, and an empty wanted value matches an absent one.
pub fn diff_fields(wanted: &Metadata, destination: &Metadata) -> Vec<String> {
    wanted
        .iter()
        .filter(|(field, _)| !SERVER_ASSIGNED_FIELDS.contains(&field.as_str()))
        .filter(|(field, value)| match destination.get(*field) {
            Some(existing) => existing != *value,
            None => !value.is_empty(),
        })
        .map(|(field, _)| field.clone())
        .collect()
}

/// Subset of `wanted` that differs on the destination, for field-by-field
/// reconciliation.
pub fn changed_subset(wanted: &Metadata, destination: &Metadata) -> Metadata {
    diff_fields(wanted, destination)
        .into_iter()
        .filter_map(|field| wanted.get(&field).map(|v| (field, v.clone())))
        .collect()
}

fn normalize_scan_type(metadata: &mut Metadata) {
    let is_generic = metadata
        .get(XSI_TYPE_FIELD)
        .map(|t| t == GENERIC_SCAN_TYPE)
        .unwrap_or(false);
    if !is_generic {
        return;
    }
    let narrowed = match metadata.get("modality") {
        Some(modality) if !modality.is_empty() => scan_type_for_modality(modality),
        _ => OTHER_SCAN_TYPE,
    };
    metadata.insert(XSI_TYPE_FIELD.to_string(), narrowed.to_string());
}
