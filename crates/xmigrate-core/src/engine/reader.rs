//! Read-only access to the source hierarchy.

use crate::client::{ByteStream, DynRestClient, RemoteEntity};
use crate::config::ProjectMapping;
use crate::model::{Entity, EntityKind, Metadata};
use crate::network::{retry_call, RetryConfig};
use crate::{MigrateError, Result};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::time::Duration;
use tracing::debug;

fn into_entity(remote: RemoteEntity, parent_source_id: &str) -> Entity {
    let mut entity = Entity::child(remote.kind, remote.id, remote.label, parent_source_id)
        .with_metadata(remote.metadata);
    entity.content = remote.content;
    entity
}

/// Enumerates and downloads source entities.
///
/// Transient failures are retried with backoff inside every call; an entity
/// that disappeared surfaces as `SourceNotFound`.
#[derive(Clone)]
pub struct SourceReader {
    client: DynRestClient,
    retry: RetryConfig,
    timeout: Duration,
}

impl SourceReader {
    pub fn new(client: DynRestClient, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            client,
            retry,
            timeout,
        }
    }

    /// Resolve the configured source projects, in configuration order.
    pub async fn list_roots(&self, projects: &[ProjectMapping]) -> Result<Vec<Entity>> {
        let mut roots = Vec::with_capacity(projects.len());
        for project in projects {
            let label = project.source.as_str();
            let found = retry_call(&self.retry, self.timeout, || {
                self.client.find(None, EntityKind::Project, label)
            })
            .await?;
            let Some(remote) = found else {
                return Err(MigrateError::SourceNotFound {
                    source_id: project.source.clone(),
                });
            };
            roots.push(Entity::project(remote.id, remote.label).with_metadata(remote.metadata));
        }
        Ok(roots)
    }

    /// Lazily enumerate the children of `parent` of one kind.
    ///
    /// Nothing is requested until the stream is first polled, and calling
    /// this again replays the listing from the start.
    pub fn list_children(&self, parent: &Entity, kind: EntityKind) -> BoxStream<'static, Result<Entity>> {
        let client = self.client.clone();
        let retry = self.retry.clone();
        let timeout = self.timeout;
        let parent_id = parent.source_id.clone();

        stream::once(async move {
            let listed = retry_call(&retry, timeout, || client.list(Some(parent_id.as_str()), kind)).await?;
            debug!("Source lists {} {} under {}", listed.len(), kind, parent_id);
            let children: Vec<Result<Entity>> = listed
                .into_iter()
                .map(|remote| Ok(into_entity(remote, &parent_id)))
                .collect();
            Ok::<_, MigrateError>(stream::iter(children))
        })
        .try_flatten()
        .boxed()
    }

    /// All children of `parent`, kind by kind in traversal order.
    pub async fn collect_children(&self, parent: &Entity) -> Result<Vec<Entity>> {
        let mut children = Vec::new();
        for kind in parent.kind.child_kinds() {
            let mut listed = self.list_children(parent, *kind);
            while let Some(child) = listed.next().await {
                children.push(child?);
            }
        }
        Ok(children)
    }

    /// Full metadata of an entity.
    ///
    /// Files carry everything in their listing row, so no request is made.
    pub async fn fetch_metadata(&self, entity: &Entity) -> Result<Metadata> {
        if entity.kind == EntityKind::File {
            return Ok(entity.metadata.clone());
        }
        let fetched = retry_call(&self.retry, self.timeout, || {
            self.client.get(&entity.source_id, entity.kind)
        })
        .await?;
        fetched
            .map(|remote| remote.metadata)
            .ok_or_else(|| MigrateError::SourceNotFound {
                source_id: entity.source_id.clone(),
            })
    }

    /// Fill in the full record over the listing metadata.
    pub async fn hydrate(&self, entity: &mut Entity) -> Result<()> {
        let metadata = self.fetch_metadata(entity).await?;
        entity.metadata.extend(metadata);
        Ok(())
    }

    /// Open a download stream for a file's payload.
    pub async fn fetch_content(&self, entity: &Entity) -> Result<ByteStream> {
        retry_call(&self.retry, self.timeout, || self.client.download(&entity.source_id)).await
    }
}
