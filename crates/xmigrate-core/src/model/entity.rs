//! Typed representation of the imaging-data hierarchy.

use crate::metadata::ACCESSION_FIELD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata of an entity: field name to value, ordered for stable comparison
/// and logging.
pub type Metadata = BTreeMap<String, String>;

/// Kind of node in the project hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Subject,
    Session,
    Scan,
    Assessor,
    Resource,
    File,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Project,
        EntityKind::Subject,
        EntityKind::Session,
        EntityKind::Scan,
        EntityKind::Assessor,
        EntityKind::Resource,
        EntityKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Subject => "subject",
            EntityKind::Session => "session",
            EntityKind::Scan => "scan",
            EntityKind::Assessor => "assessor",
            EntityKind::Resource => "resource",
            EntityKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Kinds that may appear directly under this kind, in traversal order.
    pub fn child_kinds(&self) -> &'static [EntityKind] {
        match self {
            EntityKind::Project => &[EntityKind::Subject, EntityKind::Resource],
            EntityKind::Subject => &[EntityKind::Session, EntityKind::Resource],
            EntityKind::Session => &[EntityKind::Scan, EntityKind::Assessor, EntityKind::Resource],
            EntityKind::Scan | EntityKind::Assessor => &[EntityKind::Resource],
            EntityKind::Resource => &[EntityKind::File],
            EntityKind::File => &[],
        }
    }

    /// Whether entities of this kind carry a binary payload.
    pub fn has_content(&self) -> bool {
        matches!(self, EntityKind::File)
    }

    /// Whether `child` may be placed directly under this kind.
    pub fn accepts_child(&self, child: EntityKind) -> bool {
        self.child_kinds().contains(&child)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size and digest of a file payload, as reported by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub size: Option<u64>,
    /// Opaque digest string; only compared against digests from the same
    /// kind of server.
    pub digest: Option<String>,
}

impl ContentInfo {
    pub fn new(size: Option<u64>, digest: Option<String>) -> Self {
        Self { size, digest }
    }

    /// Whether some property is known on both sides.
    pub fn comparable_with(&self, other: &ContentInfo) -> bool {
        (self.size.is_some() && other.size.is_some())
            || (self.digest.is_some() && other.digest.is_some())
    }

    /// True when every property known on both sides agrees.
    ///
    /// Unknown values are not evidence of a difference, but at least one
    /// property must be comparable.
    pub fn matches(&self, other: &ContentInfo) -> bool {
        let mut compared = false;
        if let (Some(a), Some(b)) = (self.size, other.size) {
            if a != b {
                return false;
            }
            compared = true;
        }
        if let (Some(a), Some(b)) = (&self.digest, &other.digest) {
            if !a.eq_ignore_ascii_case(b) {
                return false;
            }
            compared = true;
        }
        compared
    }
}

/// One node of the source hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    /// Identifier on the source server.
    pub source_id: String,
    /// Human-facing label; unique among siblings of the same kind.
    pub label: String,
    /// Source identifier of the parent; `None` only for projects.
    pub parent_source_id: Option<String>,
    /// Identifier on the destination server once known.
    pub destination_id: Option<String>,
    pub metadata: Metadata,
    /// Present only for files.
    pub content: Option<ContentInfo>,
}

impl Entity {
    /// Create a root project entity.
    pub fn project(source_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Project,
            source_id: source_id.into(),
            label: label.into(),
            parent_source_id: None,
            destination_id: None,
            metadata: Metadata::new(),
            content: None,
        }
    }

    /// Create a child entity under `parent_source_id`.
    pub fn child(
        kind: EntityKind,
        source_id: impl Into<String>,
        label: impl Into<String>,
        parent_source_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            label: label.into(),
            parent_source_id: Some(parent_source_id.into()),
            destination_id: None,
            metadata: Metadata::new(),
            content: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(field.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: ContentInfo) -> Self {
        self.content = Some(content);
        self
    }

    /// Accession number the server assigned, when the metadata carries one.
    pub fn accession(&self) -> Option<&str> {
        self.metadata
            .get(ACCESSION_FIELD)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// `kind 'label'`, for log lines and reports.
    pub fn describe(&self) -> String {
        format!("{} '{}'", self.kind, self.label)
    }
}

/// Identity of an entity independent of server-assigned identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub kind: EntityKind,
    /// Destination identifier of the parent; `None` for projects.
    pub parent: Option<String>,
    pub label: String,
}

impl NaturalKey {
    pub fn new(kind: EntityKind, parent: Option<&str>, label: impl Into<String>) -> Self {
        Self {
            kind,
            parent: parent.map(str::to_string),
            label: label.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}:{}/{}", self.kind, parent, self.label),
            None => write!(f, "{}:{}", self.kind, self.label),
        }
    }
}
