//! [`RestClient`] over the XNAT REST API.
//!
//! Entities are addressed by their archive path
//! (`/data/projects/P1/subjects/S1/experiments/E1/scans/1`), which is valid
//! on both servers and doubles as the identifier recorded in the ID mapping.
//! Reference fields quote accession numbers (`XNAT_S00001`) instead; those
//! come back in each item's `ID` field.

use crate::client::{ByteStream, EntityPayload, RemoteEntity, RestClient, UploadReceipt};
use crate::metadata::XSI_TYPE_FIELD;
use crate::model::{ContentInfo, EntityKind, Metadata};
use crate::network::{HttpClient, ServerRole};
use crate::{MigrateError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Body, Method};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const PROJECTS_ROOT: &str = "/data/projects";
const CREATEABLE_DATATYPES: &str = "/xapi/access/displays/createable";

/// Path segment holding children of `kind`.
fn segment(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Project => "projects",
        EntityKind::Subject => "subjects",
        EntityKind::Session => "experiments",
        EntityKind::Scan => "scans",
        EntityKind::Assessor => "assessors",
        EntityKind::Resource => "resources",
        EntityKind::File => "files",
    }
}

/// Listing column that holds the label of `kind`.
fn label_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Project | EntityKind::Scan => "ID",
        EntityKind::File => "Name",
        _ => "label",
    }
}

fn child_path(parent: Option<&str>, kind: EntityKind, label: &str) -> String {
    let label = urlencoding::encode(label);
    match parent {
        Some(parent) => format!("{}/{}/{}", parent.trim_end_matches('/'), segment(kind), label),
        None => format!("{}/{}", PROJECTS_ROOT, label),
    }
}

fn listing_path(parent: Option<&str>, kind: EntityKind) -> String {
    match parent {
        Some(parent) => format!("{}/{}", parent.trim_end_matches('/'), segment(kind)),
        None => PROJECTS_ROOT.to_string(),
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flatten(fields: &serde_json::Map<String, Value>) -> Metadata {
    fields
        .iter()
        .filter_map(|(k, v)| scalar(v).map(|v| (k.clone(), v)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(rename = "ResultSet")]
    result_set: ResultSet,
}

#[derive(Debug, Deserialize)]
struct ResultSet {
    #[serde(rename = "Result", default)]
    result: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ItemDocument {
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    data_fields: serde_json::Map<String, Value>,
    #[serde(default)]
    meta: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Display {
    element_name: String,
}

/// XNAT-flavoured REST client.
pub struct XnatClient {
    http: HttpClient,
    request_timeout: Duration,
}

impl XnatClient {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            request_timeout: crate::config::NetworkConfig::REQUEST_TIMEOUT,
        }
    }

    /// Connect to `url` with basic-auth credentials.
    pub fn connect(url: &str, role: ServerRole, user: &str, password: &str) -> Result<Self> {
        let credentials = if user.is_empty() {
            None
        } else {
            Some((user.to_string(), password.to_string()))
        };
        Ok(Self::new(HttpClient::new(url, role, credentials)?))
    }

    /// Timeout for metadata requests; transfers use the client's own.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn json_query() -> Vec<(String, String)> {
        vec![("format".to_string(), "json".to_string())]
    }

    async fn metadata_call<T>(
        &self,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MigrateError::Timeout(self.request_timeout)),
        }
    }

    fn row_to_entity(
        &self,
        parent: Option<&str>,
        kind: EntityKind,
        row: &serde_json::Map<String, Value>,
    ) -> Option<RemoteEntity> {
        let metadata = flatten(row);
        let label = metadata.get(label_column(kind))?.clone();
        let content = if kind == EntityKind::File {
            let size = metadata.get("Size").and_then(|s| s.parse::<u64>().ok());
            let digest = metadata.get("digest").filter(|d| !d.is_empty()).cloned();
            Some(ContentInfo::new(size, digest))
        } else {
            None
        };
        Some(RemoteEntity {
            id: child_path(parent, kind, &label),
            label,
            kind,
            metadata,
            content,
        })
    }

    fn is_missing(err: &MigrateError) -> bool {
        matches!(
            err,
            MigrateError::SourceNotFound { .. } | MigrateError::Rejected { status: 404, .. }
        )
    }

    fn parent_of_file(id: &str) -> Option<(&str, &str)> {
        id.rsplit_once("/files/")
    }
}

#[async_trait]
impl RestClient for XnatClient {
    fn role(&self) -> ServerRole {
        self.http.role()
    }

    async fn list(&self, parent: Option<&str>, kind: EntityKind) -> Result<Vec<RemoteEntity>> {
        let path = listing_path(parent, kind);
        let listing: Listing = self
            .metadata_call(self.http.get_json(&path, &Self::json_query()))
            .await?;
        let entities: Vec<_> = listing
            .result_set
            .result
            .iter()
            .filter_map(|row| self.row_to_entity(parent, kind, row))
            .collect();
        debug!("Listed {} {} entries under {}", entities.len(), kind, path);
        Ok(entities)
    }

    async fn get(&self, id: &str, kind: EntityKind) -> Result<Option<RemoteEntity>> {
        if kind == EntityKind::File {
            let Some((resource, name)) = Self::parent_of_file(id) else {
                return Ok(None);
            };
            let name = urlencoding::decode(name)
                .map(|n| n.into_owned())
                .unwrap_or_else(|_| name.to_string());
            return self.find(Some(resource), kind, &name).await;
        }

        let document: ItemDocument = match self
            .metadata_call(self.http.get_json(id, &Self::json_query()))
            .await
        {
            Ok(document) => document,
            Err(e) if Self::is_missing(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(item) = document.items.first() else {
            return Ok(None);
        };

        let mut metadata = flatten(&item.data_fields);
        if let Some(xsi_type) = item.meta.get("xsi:type").and_then(scalar) {
            metadata.insert(XSI_TYPE_FIELD.to_string(), xsi_type);
        }
        let label = metadata
            .get(label_column(kind))
            .or_else(|| metadata.get("ID"))
            .cloned()
            .unwrap_or_else(|| id.rsplit('/').next().unwrap_or(id).to_string());

        Ok(Some(RemoteEntity {
            id: id.to_string(),
            label,
            kind,
            metadata,
            content: None,
        }))
    }

    async fn find(
        &self,
        parent: Option<&str>,
        kind: EntityKind,
        label: &str,
    ) -> Result<Option<RemoteEntity>> {
        if kind == EntityKind::File {
            let files = self.list(parent, kind).await?;
            return Ok(files.into_iter().find(|f| f.label == label));
        }
        self.get(&child_path(parent, kind, label), kind).await
    }

    async fn create(&self, parent: Option<&str>, payload: &EntityPayload) -> Result<RemoteEntity> {
        let path = child_path(parent, payload.kind, &payload.label);
        let query: Vec<(String, String)> = payload
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.metadata_call(self.http.send(Method::PUT, &path, &query, None))
            .await?;
        debug!("Created {} {}", payload.kind, path);

        // Read back for the accession number the server assigned
        match self.get(&path, payload.kind).await {
            Ok(Some(stored)) => return Ok(stored),
            Ok(None) => {}
            Err(e) => debug!("Could not read back {}: {}", path, e),
        }
        Ok(RemoteEntity {
            id: path,
            label: payload.label.clone(),
            kind: payload.kind,
            metadata: payload.metadata.clone(),
            content: None,
        })
    }

    async fn update(&self, id: &str, kind: EntityKind, fields: &Metadata) -> Result<()> {
        if fields.is_empty() || kind == EntityKind::File {
            return Ok(());
        }
        let query: Vec<(String, String)> =
            fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.metadata_call(self.http.send(Method::PUT, id, &query, None))
            .await?;
        Ok(())
    }

    async fn upload(
        &self,
        resource_id: &str,
        name: &str,
        content: ByteStream,
        overwrite: bool,
    ) -> Result<UploadReceipt> {
        let path = child_path(Some(resource_id), EntityKind::File, name);
        let mut query = vec![("inbody".to_string(), "true".to_string())];
        if overwrite {
            query.push(("overwrite".to_string(), "true".to_string()));
        }
        self.http
            .send(Method::PUT, &path, &query, Some(Body::wrap_stream(content)))
            .await?;

        let stored = self
            .find(Some(resource_id), EntityKind::File, name)
            .await?
            .and_then(|f| f.content)
            .unwrap_or_default();
        Ok(UploadReceipt {
            id: path,
            size: stored.size,
            sha256: None,
            digest: stored.digest,
        })
    }

    async fn download(&self, id: &str) -> Result<ByteStream> {
        let response = self.http.send(Method::GET, id, &[], None).await?;
        let role = self.http.role();
        let id = id.to_string();
        Ok(response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| {
                    let message = format!("Transfer of {} interrupted: {}", id, e);
                    match role {
                        ServerRole::Source => MigrateError::SourceUnavailable {
                            message,
                            status: None,
                        },
                        ServerRole::Destination => MigrateError::DestinationUnavailable {
                            message,
                            status: None,
                        },
                    }
                })
            })
            .boxed())
    }

    async fn datatypes(&self) -> Result<Vec<String>> {
        let displays: Vec<Display> = self
            .metadata_call(self.http.get_json(CREATEABLE_DATATYPES, &[]))
            .await?;
        let mut datatypes: Vec<String> = displays
            .into_iter()
            .map(|d| d.element_name)
            .filter(|name| !name.starts_with("xdat:"))
            .collect();
        datatypes.sort();
        datatypes.dedup();
        Ok(datatypes)
    }
}
