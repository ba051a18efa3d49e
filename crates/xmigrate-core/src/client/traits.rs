//! REST client contract shared by the source reader and destination writer.
//!
//! The engine never speaks HTTP directly; it talks to a [`RestClient`] per
//! server. Implementations map calls onto their wire protocol and report
//! failures through the engine's error taxonomy, so the reader, writer and
//! orchestrator stay independent of any one server flavour.

use crate::model::{ContentInfo, EntityKind, Metadata, NaturalKey};
use crate::network::ServerRole;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Stream of payload chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An entity as a server reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntity {
    /// Server identifier, usable with [`RestClient::get`] and as a parent.
    pub id: String,
    pub label: String,
    pub kind: EntityKind,
    pub metadata: Metadata,
    /// Size and digest, for files.
    pub content: Option<ContentInfo>,
}

/// Data sent to create or reconcile an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPayload {
    pub kind: EntityKind,
    pub label: String,
    pub metadata: Metadata,
}

impl EntityPayload {
    /// Key the entity is found by once placed under `parent_destination_id`.
    pub fn natural_key(&self, parent_destination_id: Option<&str>) -> NaturalKey {
        NaturalKey::new(self.kind, parent_destination_id, self.label.clone())
    }
}

/// What the server acknowledged after an upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReceipt {
    /// Identifier of the stored file.
    pub id: String,
    /// Bytes the server reports having stored, when it reports it.
    pub size: Option<u64>,
    /// Hex SHA-256 of the stored bytes, when the server computes one.
    pub sha256: Option<String>,
    /// The server's own digest of the stored file, in the same form it
    /// reports in listings (MD5 on XNAT).
    pub digest: Option<String>,
}

/// Asynchronous client for one imaging-data server.
///
/// Every method must be safe to call repeatedly with the same arguments;
/// the orchestrator retries units whose calls failed transiently.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Which side of the migration this client talks to.
    fn role(&self) -> ServerRole;

    /// Children of `parent` of the given kind, in server enumeration order.
    ///
    /// `parent` is `None` when listing projects.
    async fn list(&self, parent: Option<&str>, kind: EntityKind) -> Result<Vec<RemoteEntity>>;

    /// Fetch one entity with its full metadata; `None` if it doesn't exist.
    async fn get(&self, id: &str, kind: EntityKind) -> Result<Option<RemoteEntity>>;

    /// Look an entity up by natural key.
    async fn find(
        &self,
        parent: Option<&str>,
        kind: EntityKind,
        label: &str,
    ) -> Result<Option<RemoteEntity>> {
        let siblings = self.list(parent, kind).await?;
        Ok(siblings.into_iter().find(|e| e.label == label))
    }

    /// Create an entity under `parent` and return it as stored.
    async fn create(&self, parent: Option<&str>, payload: &EntityPayload) -> Result<RemoteEntity>;

    /// Overwrite the given metadata fields of an existing entity.
    async fn update(&self, id: &str, kind: EntityKind, fields: &Metadata) -> Result<()>;

    /// Store a file named `name` under the resource `resource_id`.
    async fn upload(
        &self,
        resource_id: &str,
        name: &str,
        content: ByteStream,
        overwrite: bool,
    ) -> Result<UploadReceipt>;

    /// Stream the payload of a file.
    async fn download(&self, id: &str) -> Result<ByteStream>;

    /// Datatypes enabled on this server.
    async fn datatypes(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Shared handle to a REST client.
pub type DynRestClient = Arc<dyn RestClient>;
