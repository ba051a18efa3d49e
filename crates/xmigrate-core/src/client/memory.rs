//! In-process [`RestClient`] with call accounting and failure injection.
//!
//! Holds a whole hierarchy in memory. Tests seed it, point the engine at it,
//! then inspect what was written and how many calls were made.

use crate::client::{ByteStream, EntityPayload, RemoteEntity, RestClient, UploadReceipt};
use crate::metadata::{ACCESSION_FIELD, XSI_TYPE_FIELD};
use crate::model::{ContentInfo, EntityKind, Metadata};
use crate::network::ServerRole;
use crate::{MigrateError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

const CHUNK_SIZE: usize = 64 * 1024;

/// Server operations, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Upload,
    Download,
    Datatypes,
}

impl Operation {
    /// Whether the operation changes server state.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Operation::Create | Operation::Update | Operation::Upload)
    }
}

/// Failure to inject into matching calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Transient 503.
    Unavailable,
    /// 401.
    Unauthorized,
    /// Permanent 400.
    Rejected,
    /// Accept the upload but report one byte fewer than received.
    ShortReceipt,
    /// Accept the upload but report a digest of other bytes.
    CorruptDigest,
}

#[derive(Debug, Clone)]
struct Injection {
    operation: Operation,
    label: Option<String>,
    failure: Failure,
    remaining: u32,
}

/// One mutation the server applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub operation: Operation,
    pub kind: EntityKind,
    pub label: String,
}

#[derive(Debug, Clone)]
struct Node {
    kind: EntityKind,
    label: String,
    metadata: Metadata,
    content: Option<Bytes>,
    children: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<String, Node>,
    roots: Vec<String>,
    next_id: u64,
    datatypes: Option<Vec<String>>,
    calls: HashMap<Operation, usize>,
    mutations: Vec<Mutation>,
    injections: Vec<Injection>,
    latency: Duration,
}

impl State {
    fn children_of(&self, parent: Option<&str>) -> Result<&[String]> {
        match parent {
            None => Ok(&self.roots),
            Some(id) => self
                .nodes
                .get(id)
                .map(|n| n.children.as_slice())
                .ok_or_else(|| not_found(id)),
        }
    }

    fn to_remote(&self, id: &str) -> Option<RemoteEntity> {
        self.nodes.get(id).map(|node| RemoteEntity {
            id: id.to_string(),
            label: node.label.clone(),
            kind: node.kind,
            metadata: with_accession(id, node),
            content: node.content.as_ref().map(|bytes| {
                ContentInfo::new(Some(bytes.len() as u64), Some(hex::encode(Sha256::digest(bytes))))
            }),
        })
    }

    fn take_failure(&mut self, operation: Operation, label: Option<&str>) -> Option<Failure> {
        let slot = self.injections.iter_mut().find(|i| {
            i.operation == operation
                && i.remaining > 0
                && match (&i.label, label) {
                    (None, _) => true,
                    (Some(wanted), Some(label)) => wanted == label,
                    (Some(_), None) => false,
                }
        })?;
        slot.remaining -= 1;
        Some(slot.failure)
    }
}

/// Metadata as reported, with the identifier as accession number unless one
/// was seeded.
fn with_accession(id: &str, node: &Node) -> Metadata {
    let mut metadata = node.metadata.clone();
    if node.kind != EntityKind::File {
        metadata
            .entry(ACCESSION_FIELD.to_string())
            .or_insert_with(|| id.to_string());
    }
    metadata
}

fn not_found(id: &str) -> MigrateError {
    MigrateError::SourceNotFound {
        source_id: id.to_string(),
    }
}

/// In-memory imaging-data server.
pub struct InMemoryServer {
    role: ServerRole,
    prefix: String,
    state: Mutex<State>,
}

impl InMemoryServer {
    /// Create an empty server whose generated identifiers start with `prefix`.
    pub fn new(role: ServerRole, prefix: impl Into<String>) -> Self {
        Self {
            role,
            prefix: prefix.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from later asserts
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(
        &self,
        state: &mut State,
        parent: Option<&str>,
        kind: EntityKind,
        label: &str,
        metadata: Metadata,
        content: Option<Bytes>,
    ) -> Result<String> {
        if let Some(parent_id) = parent {
            let parent_node = state.nodes.get(parent_id).ok_or_else(|| self.missing(parent_id))?;
            if !parent_node.kind.accepts_child(kind) {
                return Err(self.rejected(format!(
                    "{} cannot hold a {}",
                    parent_node.kind, kind
                )));
            }
        } else if kind != EntityKind::Project {
            return Err(self.rejected(format!("{} '{}' needs a parent", kind, label)));
        }

        state.next_id += 1;
        let id = if kind == EntityKind::Project {
            label.to_string()
        } else {
            format!("{}_{}{}", self.prefix, kind.as_str().to_uppercase(), state.next_id)
        };
        state.nodes.insert(
            id.clone(),
            Node {
                kind,
                label: label.to_string(),
                metadata,
                content,
                children: Vec::new(),
            },
        );
        match parent {
            Some(parent_id) => {
                if let Some(parent_node) = state.nodes.get_mut(parent_id) {
                    parent_node.children.push(id.clone());
                }
            }
            None => state.roots.push(id.clone()),
        }
        Ok(id)
    }

    /// Seed a project. Projects are identified by their label.
    pub fn add_project(&self, label: &str, metadata: Metadata) -> Result<String> {
        let mut state = self.lock();
        self.insert(&mut state, None, EntityKind::Project, label, metadata, None)
    }

    /// Seed a non-file entity under `parent`.
    pub fn add_child(
        &self,
        parent: &str,
        kind: EntityKind,
        label: &str,
        metadata: Metadata,
    ) -> Result<String> {
        let mut state = self.lock();
        self.insert(&mut state, Some(parent), kind, label, metadata, None)
    }

    /// Seed a file under a resource.
    pub fn add_file(&self, resource: &str, name: &str, content: impl Into<Bytes>) -> Result<String> {
        let mut state = self.lock();
        self.insert(
            &mut state,
            Some(resource),
            EntityKind::File,
            name,
            Metadata::new(),
            Some(content.into()),
        )
    }

    /// Delete an entity and its subtree, as if removed on the server.
    pub fn remove(&self, id: &str) {
        let mut state = self.lock();
        let mut pending = vec![id.to_string()];
        while let Some(next) = pending.pop() {
            if let Some(node) = state.nodes.remove(&next) {
                pending.extend(node.children);
            }
        }
        state.roots.retain(|r| r != id);
        for node in state.nodes.values_mut() {
            node.children.retain(|c| c != id);
        }
    }

    /// Report exactly these datatypes instead of the ones in use.
    pub fn set_datatypes(&self, datatypes: &[&str]) {
        self.lock().datatypes = Some(datatypes.iter().map(|s| s.to_string()).collect());
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Fail the next `times` calls of `operation`, optionally only those
    /// touching an entity labelled `label`.
    pub fn inject(&self, operation: Operation, label: Option<&str>, failure: Failure, times: u32) {
        self.lock().injections.push(Injection {
            operation,
            label: label.map(str::to_string),
            failure,
            remaining: times,
        });
    }

    /// Number of calls made of `operation`.
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Every mutation applied, in order.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    /// Mutations applied to entities labelled `label`.
    pub fn mutations_of(&self, label: &str) -> usize {
        self.lock().mutations.iter().filter(|m| m.label == label).count()
    }

    /// Look an entity up by label path from a project, e.g.
    /// `["P1", "S1", "E1"]`.
    pub fn lookup(&self, path: &[&str]) -> Option<RemoteEntity> {
        let state = self.lock();
        let (first, rest) = path.split_first()?;
        let mut current = state
            .roots
            .iter()
            .find(|id| state.nodes.get(*id).map(|n| n.label == *first).unwrap_or(false))?
            .clone();
        for label in rest {
            let node = state.nodes.get(&current)?;
            current = node
                .children
                .iter()
                .find(|id| state.nodes.get(*id).map(|n| n.label == *label).unwrap_or(false))?
                .clone();
        }
        state.to_remote(&current)
    }

    /// Total number of entities stored.
    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored payload of a file.
    pub fn content(&self, id: &str) -> Option<Bytes> {
        self.lock().nodes.get(id).and_then(|n| n.content.clone())
    }

    // Internal methods

    async fn begin(&self, operation: Operation, label: Option<&str>) -> Result<Option<Failure>> {
        let (latency, failure) = {
            let mut state = self.lock();
            *state.calls.entry(operation).or_insert(0) += 1;
            (state.latency, state.take_failure(operation, label))
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(Failure::Unavailable) => Err(self.unavailable(operation)),
            Some(Failure::Unauthorized) => Err(MigrateError::Authorization {
                server: self.role.to_string(),
                message: format!("{:?} returned 401", operation),
            }),
            Some(Failure::Rejected) => Err(self.rejected(format!("{:?} returned 400", operation))),
            other => Ok(other),
        }
    }

    fn unavailable(&self, operation: Operation) -> MigrateError {
        let message = format!("{:?} returned 503", operation);
        match self.role {
            ServerRole::Source => MigrateError::SourceUnavailable {
                message,
                status: Some(503),
            },
            ServerRole::Destination => MigrateError::DestinationUnavailable {
                message,
                status: Some(503),
            },
        }
    }

    fn rejected(&self, message: String) -> MigrateError {
        MigrateError::Rejected {
            server: self.role.to_string(),
            message,
            status: 400,
        }
    }

    fn missing(&self, id: &str) -> MigrateError {
        match self.role {
            ServerRole::Source => not_found(id),
            ServerRole::Destination => MigrateError::Rejected {
                server: self.role.to_string(),
                message: format!("{} not found", id),
                status: 404,
            },
        }
    }

    fn label_of(&self, id: &str) -> Option<String> {
        self.lock().nodes.get(id).map(|n| n.label.clone())
    }
}

#[async_trait]
impl RestClient for InMemoryServer {
    fn role(&self) -> ServerRole {
        self.role
    }

    async fn list(&self, parent: Option<&str>, kind: EntityKind) -> Result<Vec<RemoteEntity>> {
        let parent_label = parent.and_then(|p| self.label_of(p));
        self.begin(Operation::List, parent_label.as_deref()).await?;
        let state = self.lock();
        let children = state.children_of(parent).map_err(|_| {
            self.missing(parent.unwrap_or_default())
        })?;
        Ok(children
            .iter()
            .filter(|id| state.nodes.get(*id).map(|n| n.kind == kind).unwrap_or(false))
            .filter_map(|id| state.to_remote(id))
            .collect())
    }

    async fn get(&self, id: &str, _kind: EntityKind) -> Result<Option<RemoteEntity>> {
        let label = self.label_of(id);
        self.begin(Operation::Get, label.as_deref()).await?;
        Ok(self.lock().to_remote(id))
    }

    async fn create(&self, parent: Option<&str>, payload: &EntityPayload) -> Result<RemoteEntity> {
        self.begin(Operation::Create, Some(payload.label.as_str())).await?;
        let mut state = self.lock();

        // Creating is idempotent on the natural key
        let existing = state
            .children_of(parent)
            .ok()
            .and_then(|children| {
                children.iter().find(|id| {
                    state
                        .nodes
                        .get(*id)
                        .map(|n| n.kind == payload.kind && n.label == payload.label)
                        .unwrap_or(false)
                })
            })
            .cloned();
        let id = match existing {
            Some(id) => id,
            None => self.insert(
                &mut state,
                parent,
                payload.kind,
                &payload.label,
                payload.metadata.clone(),
                None,
            )?,
        };
        state.mutations.push(Mutation {
            operation: Operation::Create,
            kind: payload.kind,
            label: payload.label.clone(),
        });
        state.to_remote(&id).ok_or_else(|| self.missing(&id))
    }

    async fn update(&self, id: &str, kind: EntityKind, fields: &Metadata) -> Result<()> {
        let label = self.label_of(id);
        self.begin(Operation::Update, label.as_deref()).await?;
        let mut state = self.lock();
        let node = state.nodes.get_mut(id).ok_or_else(|| self.missing(id))?;
        for (field, value) in fields {
            node.metadata.insert(field.clone(), value.clone());
        }
        let label = node.label.clone();
        state.mutations.push(Mutation {
            operation: Operation::Update,
            kind,
            label,
        });
        Ok(())
    }

    async fn upload(
        &self,
        resource_id: &str,
        name: &str,
        mut content: ByteStream,
        overwrite: bool,
    ) -> Result<UploadReceipt> {
        let failure = self.begin(Operation::Upload, Some(name)).await?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = content.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let received = buffer.freeze();
        let sha256 = hex::encode(Sha256::digest(&received));
        let size = received.len() as u64;

        let mut state = self.lock();
        let existing = state
            .children_of(Some(resource_id))
            .map_err(|_| self.missing(resource_id))?
            .iter()
            .find(|id| state.nodes.get(*id).map(|n| n.label == name).unwrap_or(false))
            .cloned();
        let id = match existing {
            Some(id) if overwrite => {
                if let Some(node) = state.nodes.get_mut(&id) {
                    node.content = Some(received);
                }
                id
            }
            Some(id) => {
                let same = state
                    .nodes
                    .get(&id)
                    .and_then(|n| n.content.as_ref())
                    .map(|c| *c == received)
                    .unwrap_or(false);
                if !same {
                    return Err(MigrateError::Rejected {
                        server: self.role.to_string(),
                        message: format!("File {} already exists", name),
                        status: 409,
                    });
                }
                id
            }
            None => self.insert(
                &mut state,
                Some(resource_id),
                EntityKind::File,
                name,
                Metadata::new(),
                Some(received),
            )?,
        };
        state.mutations.push(Mutation {
            operation: Operation::Upload,
            kind: EntityKind::File,
            label: name.to_string(),
        });

        let reported_size = match failure {
            Some(Failure::ShortReceipt) => size.saturating_sub(1),
            _ => size,
        };
        let digest = match failure {
            Some(Failure::CorruptDigest) => hex::encode(Sha256::digest(b"corrupt")),
            _ => sha256.clone(),
        };
        Ok(UploadReceipt {
            id,
            size: Some(reported_size),
            sha256: Some(sha256),
            digest: Some(digest),
        })
    }

    async fn download(&self, id: &str) -> Result<ByteStream> {
        let label = self.label_of(id);
        self.begin(Operation::Download, label.as_deref()).await?;
        let content = {
            let state = self.lock();
            let node = state.nodes.get(id).ok_or_else(|| self.missing(id))?;
            node.content.clone().unwrap_or_default()
        };
        let chunks: Vec<Result<Bytes>> = (0..content.len())
            .step_by(CHUNK_SIZE)
            .map(|start| Ok(content.slice(start..(start + CHUNK_SIZE).min(content.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn datatypes(&self) -> Result<Vec<String>> {
        self.begin(Operation::Datatypes, None).await?;
        let state = self.lock();
        if let Some(datatypes) = &state.datatypes {
            return Ok(datatypes.clone());
        }
        let in_use: BTreeSet<String> = state
            .nodes
            .values()
            .filter(|n| matches!(n.kind, EntityKind::Session | EntityKind::Scan | EntityKind::Assessor))
            .filter_map(|n| n.metadata.get(XSI_TYPE_FIELD).cloned())
            .collect();
        Ok(in_use.into_iter().collect())
    }
}
