//! Idempotent writes to the destination.
//!
//! Every operation looks before it leaps: an entity that already exists
//! under its natural key is reused rather than created again, so a repeated
//! call after a lost response converges on the same destination state.

use crate::client::{ByteStream, DynRestClient, EntityPayload, RemoteEntity};
use crate::metadata::{changed_subset, ACCESSION_FIELD};
use crate::model::{ContentInfo, NaturalKey};
use crate::network::{retry_call, RetryConfig};
use crate::{MigrateError, Result};
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// What [`DestinationWriter::ensure_entity`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    Created,
    /// Already present; nothing sent.
    Existing,
    /// Already present; differing fields were sent.
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub destination_id: String,
    /// Accession number the destination reports for the entity.
    pub accession: Option<String>,
    pub effect: WriteEffect,
}

impl EnsureOutcome {
    fn new(entity: RemoteEntity, effect: WriteEffect) -> Self {
        let accession = entity
            .metadata
            .get(ACCESSION_FIELD)
            .filter(|id| !id.is_empty())
            .cloned();
        Self {
            destination_id: entity.id,
            accession,
            effect,
        }
    }
}

/// Verified result of a file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfirmation {
    pub destination_id: String,
    /// Bytes streamed to the destination.
    pub size: u64,
    /// Hex SHA-256 of the streamed bytes.
    pub sha256: String,
}

#[derive(Default)]
struct StreamDigest {
    hasher: Sha256,
    size: u64,
}

/// Creates and reconciles entities on the destination.
#[derive(Clone)]
pub struct DestinationWriter {
    client: DynRestClient,
    retry: RetryConfig,
    request_timeout: Duration,
    transfer_timeout: Duration,
}

impl DestinationWriter {
    pub fn new(
        client: DynRestClient,
        retry: RetryConfig,
        request_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            client,
            retry,
            request_timeout,
            transfer_timeout,
        }
    }

    /// Look an entity up on the destination by natural key.
    pub async fn find_existing(&self, key: &NaturalKey) -> Result<Option<RemoteEntity>> {
        debug!("Looking up {}", key);
        retry_call(&self.retry, self.request_timeout, || {
            self.client.find(key.parent.as_deref(), key.kind, &key.label)
        })
        .await
    }

    /// Make sure the entity exists on the destination.
    ///
    /// An existing entity is returned untouched unless `force_update`, in
    /// which case only the fields that differ are sent.
    pub async fn ensure_entity(
        &self,
        payload: &EntityPayload,
        parent_destination_id: Option<&str>,
        force_update: bool,
    ) -> Result<EnsureOutcome> {
        let key = payload.natural_key(parent_destination_id);
        if let Some(existing) = self.find_existing(&key).await? {
            if !force_update {
                return Ok(EnsureOutcome::new(existing, WriteEffect::Existing));
            }

            let changed = changed_subset(&payload.metadata, &existing.metadata);
            if changed.is_empty() {
                return Ok(EnsureOutcome::new(existing, WriteEffect::Existing));
            }

            debug!(
                "Reconciling {}: {:?}",
                key,
                changed.keys().collect::<Vec<_>>()
            );
            retry_call(&self.retry, self.request_timeout, || {
                self.client.update(&existing.id, payload.kind, &changed)
            })
            .await?;
            return Ok(EnsureOutcome::new(existing, WriteEffect::Updated));
        }

        let created = retry_call(&self.retry, self.request_timeout, || {
            self.client.create(parent_destination_id, payload)
        })
        .await?;
        info!("Created {} '{}' as {}", payload.kind, payload.label, created.id);
        Ok(EnsureOutcome::new(created, WriteEffect::Created))
    }

    /// Stream a file to the destination and verify what arrived.
    ///
    /// Byte count and SHA-256 are computed while streaming. They are checked
    /// against the size the source declared and against the destination's
    /// receipt; the checksum only when the destination reports one. The
    /// digest the destination stored is compared with the one the source
    /// declared when both are known. Any mismatch is a `TransferIntegrity`
    /// error.
    pub async fn upload_content(
        &self,
        resource_destination_id: &str,
        name: &str,
        expected: Option<&ContentInfo>,
        content: ByteStream,
        overwrite: bool,
    ) -> Result<UploadConfirmation> {
        let digest = Arc::new(Mutex::new(StreamDigest::default()));
        let tap = digest.clone();
        let metered: ByteStream = Box::pin(content.inspect_ok(move |chunk| {
            if let Ok(mut state) = tap.lock() {
                state.hasher.update(chunk);
                state.size += chunk.len() as u64;
            }
        }));

        let upload = self
            .client
            .upload(resource_destination_id, name, metered, overwrite);
        let receipt = match tokio::time::timeout(self.transfer_timeout, upload).await {
            Ok(receipt) => receipt?,
            Err(_) => return Err(MigrateError::Timeout(self.transfer_timeout)),
        };

        let (size, sha256) = {
            let mut state = digest.lock().map_err(|e| MigrateError::Other(format!(
                "Digest state of {} poisoned: {}",
                name, e
            )))?;
            let hasher = std::mem::take(&mut state.hasher);
            (state.size, hex::encode(hasher.finalize()))
        };

        let integrity = |expected: String, actual: String| MigrateError::TransferIntegrity {
            destination_id: receipt.id.clone(),
            expected,
            actual,
        };

        if let Some(declared) = expected.and_then(|c| c.size) {
            if declared != size {
                return Err(integrity(
                    format!("{} bytes from source", declared),
                    format!("{} bytes read", size),
                ));
            }
        }
        if let Some(stored) = receipt.size {
            if stored != size {
                return Err(integrity(
                    format!("{} bytes sent", size),
                    format!("{} bytes stored", stored),
                ));
            }
        }
        if let Some(stored) = &receipt.sha256 {
            if !stored.eq_ignore_ascii_case(&sha256) {
                return Err(integrity(format!("sha256 {}", sha256), format!("sha256 {}", stored)));
            }
        }
        let declared_digest = expected.and_then(|c| c.digest.as_ref());
        if let (Some(declared), Some(stored)) = (declared_digest, &receipt.digest) {
            if !stored.eq_ignore_ascii_case(declared) {
                return Err(integrity(
                    format!("digest {} from source", declared),
                    format!("digest {} stored", stored),
                ));
            }
        }

        debug!("Uploaded {} ({} bytes, sha256 {})", receipt.id, size, sha256);
        Ok(UploadConfirmation {
            destination_id: receipt.id,
            size,
            sha256,
        })
    }
}
