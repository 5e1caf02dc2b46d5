// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed artifact persistence.
//!
//! Bytes are written once per `(tenant, content_hash, type_tag)`: a second
//! `put` for identical content reuses the existing row instead of
//! duplicating bytes on disk. Writes are staged to a temp file and renamed
//! into place so a reader never observes a partial artifact.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use sf_envelope::{Artifact, RESERVED_ARTIFACT_METADATA_KEYS};
use sf_error::{ErrorCode, SfError};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// A tenant-scoped, content-addressed artifact store backed by a filesystem
/// directory.
///
/// Reads and writes go through `tokio::fs`; callers that need to honor a
/// cancellation signal (spec.md §4.B "reads are cancellable") should race
/// the returned future against their own signal with `tokio::select!` — the
/// store itself holds no cancellation state.
pub struct ArtifactStore {
    root: PathBuf,
    index: Mutex<HashMap<(String, String, String), Uuid>>,
    metadata: Mutex<HashMap<Uuid, Artifact>>,
}

impl ArtifactStore {
    /// Open (creating if needed) an artifact store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created or its existing
    /// metadata files cannot be parsed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SfError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            SfError::new(ErrorCode::Internal, "failed to create artifact store root")
                .with_context("root", root.display().to_string())
                .with_source(e)
        })?;

        let store = Self {
            root,
            index: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
        };
        store.rebuild_index()?;
        Ok(store)
    }

    fn rebuild_index(&self) -> Result<(), SfError> {
        let tenants_dir = self.root.clone();
        let Ok(tenants) = std::fs::read_dir(&tenants_dir) else {
            return Ok(());
        };
        for tenant_entry in tenants.flatten() {
            let artifacts_dir = tenant_entry.path().join("artifacts");
            let Ok(entries) = std::fs::read_dir(&artifacts_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(artifact) = serde_json::from_str::<Artifact>(&content) else {
                    continue;
                };
                let key = (
                    artifact.tenant_id.clone(),
                    artifact.content_hash.clone(),
                    artifact.type_tag.clone(),
                );
                self.index.lock().expect("index lock poisoned").insert(key, artifact.id);
                self.metadata
                    .lock()
                    .expect("metadata lock poisoned")
                    .insert(artifact.id, artifact);
            }
        }
        Ok(())
    }

    fn tenant_dir(&self, tenant: &str) -> PathBuf {
        self.root.join(tenant)
    }

    fn blob_path(&self, tenant: &str, content_hash: &str) -> PathBuf {
        self.tenant_dir(tenant).join("blobs").join(content_hash)
    }

    fn metadata_path(&self, tenant: &str, id: Uuid) -> PathBuf {
        self.tenant_dir(tenant).join("artifacts").join(format!("{id}.json"))
    }

    /// Build the opaque URI a caller later passes to [`resolve`](Self::resolve).
    #[must_use]
    pub fn uri_for(tenant: &str, content_hash: &str) -> String {
        format!("artifact://{tenant}/{content_hash}")
    }

    /// Persist bytes produced by a step, deduplicating on content hash.
    ///
    /// `metadata` may carry caller-supplied free-form keys; the reserved
    /// keys in [`RESERVED_ARTIFACT_METADATA_KEYS`] are always overwritten by
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing directory cannot be written to.
    pub async fn put(
        &self,
        tenant: &str,
        run_id: Uuid,
        creator_step_id: &str,
        type_tag: &str,
        bytes: Vec<u8>,
        filename: Option<String>,
        mut metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Artifact, SfError> {
        let content_hash = sha256_hex(&bytes);
        let key = (tenant.to_string(), content_hash.clone(), type_tag.to_string());

        if let Some(existing_id) = self.index.lock().expect("index lock poisoned").get(&key).copied() {
            let existing = self
                .metadata
                .lock()
                .expect("metadata lock poisoned")
                .get(&existing_id)
                .cloned();
            if let Some(artifact) = existing {
                tracing::debug!(tenant, content_hash = %content_hash, type_tag, "artifact dedup hit");
                return Ok(artifact);
            }
        }

        let blobs_dir = self.tenant_dir(tenant).join("blobs");
        let artifacts_dir = self.tenant_dir(tenant).join("artifacts");
        tokio::fs::create_dir_all(&blobs_dir).await.map_err(io_err)?;
        tokio::fs::create_dir_all(&artifacts_dir).await.map_err(io_err)?;

        let final_blob_path = self.blob_path(tenant, &content_hash);
        if !tokio::fs::try_exists(&final_blob_path).await.unwrap_or(false) {
            let staged_path = blobs_dir.join(format!(".tmp-{}", Uuid::new_v4()));
            tokio::fs::write(&staged_path, &bytes).await.map_err(io_err)?;
            match tokio::fs::rename(&staged_path, &final_blob_path).await {
                Ok(()) => {}
                Err(_) if tokio::fs::try_exists(&final_blob_path).await.unwrap_or(false) => {
                    let _ = tokio::fs::remove_file(&staged_path).await;
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        for reserved in RESERVED_ARTIFACT_METADATA_KEYS {
            metadata.remove(*reserved);
        }
        metadata.insert("size_bytes".to_string(), serde_json::json!(bytes.len()));
        metadata.insert("content_type".to_string(), serde_json::json!(type_tag));
        metadata.insert("creator_step_id".to_string(), serde_json::json!(creator_step_id));

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        metadata.insert("created_at".to_string(), serde_json::json!(created_at));

        let artifact = Artifact {
            id,
            tenant_id: tenant.to_string(),
            run_id,
            creator_step_id: creator_step_id.to_string(),
            type_tag: type_tag.to_string(),
            uri: Self::uri_for(tenant, &content_hash),
            content_hash: content_hash.clone(),
            size_bytes: bytes.len() as u64,
            filename,
            metadata,
            created_at,
        };

        self.persist_metadata(tenant, &artifact).await?;

        self.index.lock().expect("index lock poisoned").insert(key, id);
        self.metadata
            .lock()
            .expect("metadata lock poisoned")
            .insert(id, artifact.clone());

        Ok(artifact)
    }

    async fn persist_metadata(&self, tenant: &str, artifact: &Artifact) -> Result<(), SfError> {
        let artifacts_dir = self.tenant_dir(tenant).join("artifacts");
        let final_path = self.metadata_path(tenant, artifact.id);
        let staged_path = artifacts_dir.join(format!(".tmp-{}.json", artifact.id));
        let json = serde_json::to_vec_pretty(artifact).map_err(|e| {
            SfError::new(ErrorCode::Internal, "failed to serialize artifact metadata").with_source(e)
        })?;
        tokio::fs::write(&staged_path, json).await.map_err(io_err)?;
        tokio::fs::rename(&staged_path, &final_path).await.map_err(io_err)?;
        Ok(())
    }

    /// Fetch an artifact's metadata and bytes by id.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Internal`] if the artifact is unknown or its
    /// backing bytes are missing (a post-commit disappearance, per spec.md
    /// §8 invariant 1 / §7 "missing artifact after commit").
    pub async fn get(&self, tenant: &str, id: Uuid) -> Result<(Artifact, Vec<u8>), SfError> {
        let artifact = self
            .metadata
            .lock()
            .expect("metadata lock poisoned")
            .get(&id)
            .cloned()
            .filter(|a| a.tenant_id == tenant)
            .ok_or_else(|| {
                SfError::new(ErrorCode::Internal, "artifact not found")
                    .with_context("artifact_id", id.to_string())
            })?;
        let bytes = self.resolve(tenant, &artifact.uri).await?;
        Ok((artifact, bytes))
    }

    /// Resolve an artifact URI (as produced by [`uri_for`](Self::uri_for))
    /// to its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Internal`] if the URI is malformed or the blob
    /// is missing.
    pub async fn resolve(&self, tenant: &str, uri: &str) -> Result<Vec<u8>, SfError> {
        let content_hash = uri
            .strip_prefix("artifact://")
            .and_then(|rest| rest.strip_prefix(tenant))
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                SfError::new(ErrorCode::Internal, "malformed artifact uri")
                    .with_context("uri", uri.to_string())
            })?;
        let path = self.blob_path(tenant, content_hash);
        tokio::fs::read(&path).await.map_err(|e| {
            SfError::new(ErrorCode::Internal, "artifact bytes missing from store")
                .with_context("uri", uri.to_string())
                .with_source(e)
        })
    }

    /// Returns `true` if the artifact id is known to this store for the
    /// given tenant (used by the step cache to detect purged artifacts).
    #[must_use]
    pub fn contains(&self, tenant: &str, id: Uuid) -> bool {
        self.metadata
            .lock()
            .expect("metadata lock poisoned")
            .get(&id)
            .is_some_and(|a| a.tenant_id == tenant)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn io_err(e: std::io::Error) -> SfError {
    SfError::new(ErrorCode::Internal, "artifact store I/O failure").with_source(e)
}

/// Compute the content hash of bytes the same way [`ArtifactStore::put`]
/// would, without performing a write. Useful for callers deciding whether a
/// `Put` will dedup before paying the I/O cost.
#[must_use]
pub fn content_hash_of(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}
