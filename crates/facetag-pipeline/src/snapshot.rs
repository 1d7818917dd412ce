//! Owner-scoped local snapshots of known reference faces.
//!
//! A snapshot is the set of an owner's identities whose reference image is
//! present locally and embedded, at one point in time. Local copies live at
//! `<cache_dir>/known_faces/<owner_id>/<identity_id>.<ext>` and are reused
//! across jobs as long as their SHA-256 still matches the registry.

use crate::analysis::{AnalysisError, FaceAnalysis};
use crate::config::PipelineConfig;
use crate::error::{registry_call, PipelineError};
use facetag_core::{Embedding, GalleryEntry};
use facetag_store::{Identity, IdentityId, IdentityRegistry, ObjectStoreError, OwnerId};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Why one identity could not be included in a snapshot.
#[derive(Error, Debug)]
pub enum SnapshotBuildError {
    #[error("identity {identity}: download of {path} failed: {source}")]
    Download {
        identity: IdentityId,
        path: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error("identity {identity}: {stage} timed out after {after:?}")]
    Timeout {
        identity: IdentityId,
        stage: &'static str,
        after: Duration,
    },
    #[error("identity {identity}: reference image hash mismatch (expected {expected}, got {actual})")]
    HashMismatch {
        identity: IdentityId,
        expected: String,
        actual: String,
    },
    #[error("identity {identity}: cannot cache reference at {}: {source}", .path.display())]
    Cache {
        identity: IdentityId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity {identity}: reference image unreadable: {source}")]
    Decode {
        identity: IdentityId,
        #[source]
        source: image::ImageError,
    },
    #[error("identity {identity}: embedding failed: {source}")]
    Embed {
        identity: IdentityId,
        #[source]
        source: AnalysisError,
    },
}

impl SnapshotBuildError {
    pub fn identity(&self) -> IdentityId {
        match self {
            SnapshotBuildError::Download { identity, .. }
            | SnapshotBuildError::Timeout { identity, .. }
            | SnapshotBuildError::HashMismatch { identity, .. }
            | SnapshotBuildError::Cache { identity, .. }
            | SnapshotBuildError::Decode { identity, .. }
            | SnapshotBuildError::Embed { identity, .. } => *identity,
        }
    }
}

/// The usable known faces of one owner.
#[derive(Debug)]
pub struct Snapshot {
    pub owner_id: OwnerId,
    /// Identities the registry knows for this owner, usable or not.
    pub known: usize,
    gallery: Vec<GalleryEntry<IdentityId>>,
    files: BTreeMap<IdentityId, PathBuf>,
    unavailable: Vec<SnapshotBuildError>,
}

impl Snapshot {
    /// The owner has no identities at all.
    pub fn is_cold(&self) -> bool {
        self.known == 0
    }

    /// Embedded references to match against.
    pub fn gallery(&self) -> &[GalleryEntry<IdentityId>] {
        &self.gallery
    }

    /// Local file of an identity's reference image.
    pub fn local_path(&self, identity_id: IdentityId) -> Option<&Path> {
        self.files.get(&identity_id).map(PathBuf::as_path)
    }

    /// Identities left out of this snapshot and why.
    pub fn unavailable(&self) -> &[SnapshotBuildError] {
        &self.unavailable
    }
}

struct CachedEmbedding {
    sha256: String,
    embedding: Embedding,
}

struct OwnerEmbeddings {
    last_used: u64,
    entries: HashMap<IdentityId, CachedEmbedding>,
}

/// Reference embeddings of the most recently served owners. When more than
/// `capacity` owners are cached, the least recently used one is dropped.
struct EmbeddingCache {
    capacity: usize,
    clock: u64,
    owners: HashMap<OwnerId, OwnerEmbeddings>,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            owners: HashMap::new(),
        }
    }

    fn get(&mut self, identity: &Identity) -> Option<Embedding> {
        self.clock += 1;
        let owner = self.owners.get_mut(&identity.owner_id)?;
        owner.last_used = self.clock;
        owner
            .entries
            .get(&identity.id)
            .filter(|cached| cached.sha256 == identity.reference_sha256)
            .map(|cached| cached.embedding.clone())
    }

    fn insert(&mut self, identity: &Identity, embedding: Embedding) {
        self.clock += 1;
        let clock = self.clock;
        let owner = self.owners.entry(identity.owner_id).or_insert_with(|| OwnerEmbeddings {
            last_used: clock,
            entries: HashMap::new(),
        });
        owner.last_used = clock;
        owner.entries.insert(
            identity.id,
            CachedEmbedding {
                sha256: identity.reference_sha256.clone(),
                embedding,
            },
        );

        while self.owners.len() > self.capacity {
            let Some(oldest) = self
                .owners
                .iter()
                .min_by_key(|(_, owner)| owner.last_used)
                .map(|(id, _)| *id)
            else {
                break;
            };
            self.owners.remove(&oldest);
            tracing::debug!(owner = %oldest, "evicted cached reference embeddings");
        }
    }

    /// Forget identities the registry no longer lists for `owner_id`.
    fn retain(&mut self, owner_id: OwnerId, known: &HashSet<IdentityId>) {
        if let Some(owner) = self.owners.get_mut(&owner_id) {
            owner.entries.retain(|id, _| known.contains(id));
            if owner.entries.is_empty() {
                self.owners.remove(&owner_id);
            }
        }
    }
}

/// Builds and refreshes snapshots.
///
/// Reference embeddings are cached in memory keyed by identity and content
/// hash, so a warm snapshot costs one directory of hash checks and no model
/// calls. Only the `embedding_cache_owners` most recently served owners are
/// kept.
pub struct SnapshotBuilder {
    registry: IdentityRegistry,
    analysis: Arc<dyn FaceAnalysis>,
    root: PathBuf,
    download_timeout: Duration,
    embed_timeout: Duration,
    registry_timeout: Duration,
    embeddings: Mutex<EmbeddingCache>,
}

impl SnapshotBuilder {
    pub fn new(registry: IdentityRegistry, analysis: Arc<dyn FaceAnalysis>, config: &PipelineConfig) -> Self {
        Self {
            registry,
            analysis,
            root: config.cache_dir.join("known_faces"),
            download_timeout: config.download_timeout(),
            embed_timeout: config.detect_timeout(),
            registry_timeout: config.registry_timeout(),
            embeddings: Mutex::new(EmbeddingCache::new(config.embedding_cache_owners)),
        }
    }

    /// Owners whose reference embeddings are held in memory.
    pub fn cached_owners(&self) -> usize {
        self.cache().owners.len()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, EmbeddingCache> {
        self.embeddings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory holding `owner_id`'s local reference copies.
    pub fn owner_dir(&self, owner_id: OwnerId) -> PathBuf {
        self.root.join(owner_id.to_string())
    }

    /// Make sure every reference image of `owner_id` is present locally and
    /// embedded, and return what is usable.
    ///
    /// Only the identity listing is fatal. A reference that cannot be
    /// fetched, verified or embedded is recorded in
    /// [`Snapshot::unavailable`] and left out.
    pub async fn ensure_snapshot(&self, owner_id: OwnerId) -> Result<Snapshot, PipelineError> {
        let identities = registry_call(self.registry_timeout, self.registry.list_identities(owner_id)).await?;

        let mut snapshot = Snapshot {
            owner_id,
            known: identities.len(),
            gallery: Vec::with_capacity(identities.len()),
            files: BTreeMap::new(),
            unavailable: Vec::new(),
        };

        for identity in &identities {
            match self.load(identity).await {
                Ok((path, embedding)) => {
                    snapshot.files.insert(identity.id, path);
                    snapshot.gallery.push(GalleryEntry {
                        key: identity.id,
                        embedding,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        owner = %owner_id,
                        identity = %identity.id,
                        error = %e,
                        "reference face unavailable; excluded from snapshot"
                    );
                    snapshot.unavailable.push(e);
                }
            }
        }

        let listed: HashSet<IdentityId> = identities.iter().map(|i| i.id).collect();
        self.cache().retain(owner_id, &listed);

        tracing::debug!(
            owner = %owner_id,
            known = snapshot.known,
            usable = snapshot.gallery.len(),
            unavailable = snapshot.unavailable.len(),
            "snapshot ready"
        );
        Ok(snapshot)
    }

    async fn load(&self, identity: &Identity) -> Result<(PathBuf, Embedding), SnapshotBuildError> {
        let (path, bytes) = self.materialize(identity).await?;

        let cached = self.cache().get(identity);
        if let Some(embedding) = cached {
            return Ok((path, embedding));
        }

        let crop = image::load_from_memory(&bytes)
            .map_err(|source| SnapshotBuildError::Decode {
                identity: identity.id,
                source,
            })?
            .to_rgb8();

        let embedding = match tokio::time::timeout(self.embed_timeout, self.analysis.embed(crop)).await {
            Ok(Ok(embedding)) => embedding,
            Ok(Err(source)) => {
                return Err(SnapshotBuildError::Embed {
                    identity: identity.id,
                    source,
                })
            }
            Err(_) => {
                return Err(SnapshotBuildError::Timeout {
                    identity: identity.id,
                    stage: "embedding",
                    after: self.embed_timeout,
                })
            }
        };

        self.cache().insert(identity, embedding.clone());
        Ok((path, embedding))
    }

    /// Local copy of the reference image, downloading it when missing or stale.
    async fn materialize(&self, identity: &Identity) -> Result<(PathBuf, Vec<u8>), SnapshotBuildError> {
        let path = self.local_path(identity);

        match tokio::fs::read(&path).await {
            Ok(bytes) if sha256_hex(&bytes) == identity.reference_sha256 => return Ok((path, bytes)),
            Ok(_) => tracing::debug!(path = %path.display(), "local reference is stale; refetching"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "local reference unreadable; refetching"),
        }

        let fetch = self.registry.objects().get(&identity.reference_storage_path);
        let bytes = match tokio::time::timeout(self.download_timeout, fetch).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(source)) => {
                return Err(SnapshotBuildError::Download {
                    identity: identity.id,
                    path: identity.reference_storage_path.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(SnapshotBuildError::Timeout {
                    identity: identity.id,
                    stage: "download",
                    after: self.download_timeout,
                })
            }
        };

        let actual = sha256_hex(&bytes);
        if actual != identity.reference_sha256 {
            return Err(SnapshotBuildError::HashMismatch {
                identity: identity.id,
                expected: identity.reference_sha256.clone(),
                actual,
            });
        }

        write_atomic(&path, &bytes)
            .await
            .map_err(|source| SnapshotBuildError::Cache {
                identity: identity.id,
                path: path.clone(),
                source,
            })?;

        tracing::debug!(
            identity = %identity.id,
            path = %path.display(),
            bytes = bytes.len(),
            "reference face downloaded"
        );
        Ok((path, bytes))
    }

    fn local_path(&self, identity: &Identity) -> PathBuf {
        let extension = Path::new(&identity.reference_storage_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("img");
        self.owner_dir(identity.owner_id)
            .join(format!("{}.{extension}", identity.id))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write through a uniquely named temp file and rename into place, so a
/// concurrent reader sees either the old file or the complete new one.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!(
        "part-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{person, Harness};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_cold_owner_has_empty_snapshot() {
        let h = Harness::new().await;
        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();

        assert!(snapshot.is_cold());
        assert!(snapshot.gallery().is_empty());
        assert!(snapshot.unavailable().is_empty());
        assert_eq!(h.store.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_files_are_owner_scoped() {
        let h = Harness::new().await;
        let identity = h.register_person(h.owner, 1).await;

        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();
        let expected = h
            .pipeline
            .snapshots()
            .owner_dir(h.owner)
            .join(format!("{}.png", identity.id));

        assert_eq!(snapshot.gallery().len(), 1);
        assert_eq!(snapshot.local_path(identity.id), Some(expected.as_path()));
        assert!(expected.exists());

        let other = OwnerId::generate();
        let other_snapshot = h.pipeline.snapshots().ensure_snapshot(other).await.unwrap();
        assert!(other_snapshot.is_cold());
    }

    #[tokio::test]
    async fn test_warm_snapshot_skips_download_and_embedding() {
        let h = Harness::new().await;
        h.register_person(h.owner, 1).await;
        h.register_person(h.owner, 2).await;

        let builder = h.pipeline.snapshots();
        builder.ensure_snapshot(h.owner).await.unwrap();
        let gets = h.store.gets.load(Ordering::SeqCst);
        let embeds = h.analysis.embed_calls.load(Ordering::SeqCst);
        assert_eq!(gets, 2);
        assert_eq!(embeds, 2);

        let again = builder.ensure_snapshot(h.owner).await.unwrap();
        assert_eq!(again.gallery().len(), 2);
        assert_eq!(h.store.gets.load(Ordering::SeqCst), gets);
        assert_eq!(h.analysis.embed_calls.load(Ordering::SeqCst), embeds);
    }

    #[tokio::test]
    async fn test_tampered_local_copy_is_refetched() {
        let h = Harness::new().await;
        let identity = h.register_person(h.owner, 3).await;

        let builder = h.pipeline.snapshots();
        let first = builder.ensure_snapshot(h.owner).await.unwrap();
        let path = first.local_path(identity.id).unwrap().to_path_buf();
        std::fs::write(&path, b"garbage").unwrap();

        let second = builder.ensure_snapshot(h.owner).await.unwrap();
        assert_eq!(second.gallery().len(), 1);
        assert_eq!(h.store.gets.load(Ordering::SeqCst), 2);
        assert_eq!(sha256_hex(&std::fs::read(&path).unwrap()), identity.reference_sha256);
    }

    #[tokio::test]
    async fn test_failed_download_is_degraded_not_fatal() {
        let h = Harness::new().await;
        let a = h.register_person(h.owner, 1).await;
        let b = h.register_person(h.owner, 2).await;
        h.store.fail_get(&b.reference_storage_path);

        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();

        assert_eq!(snapshot.known, 2);
        assert!(!snapshot.is_cold());
        assert_eq!(snapshot.gallery().len(), 1);
        assert_eq!(snapshot.gallery()[0].key, a.id);
        assert_eq!(snapshot.unavailable().len(), 1);
        assert_eq!(snapshot.unavailable()[0].identity(), b.id);
        assert!(matches!(snapshot.unavailable()[0], SnapshotBuildError::Download { .. }));
    }

    #[tokio::test]
    async fn test_embedding_cache_keeps_recent_owners_only() {
        let h = Harness::with_config(|c| c.embedding_cache_owners = 2).await;
        let owners = [OwnerId::generate(), OwnerId::generate(), OwnerId::generate()];
        for (k, owner) in owners.iter().enumerate() {
            h.register_person(*owner, k as u8 + 1).await;
        }

        let builder = h.pipeline.snapshots();
        for owner in owners {
            builder.ensure_snapshot(owner).await.unwrap();
            assert!(builder.cached_owners() <= 2);
        }
        assert_eq!(builder.cached_owners(), 2);
        assert_eq!(h.analysis.embed_calls.load(Ordering::SeqCst), 3);

        // The most recent owner is still warm.
        builder.ensure_snapshot(owners[2]).await.unwrap();
        assert_eq!(h.analysis.embed_calls.load(Ordering::SeqCst), 3);

        // The oldest owner was evicted and is embedded again.
        let snapshot = builder.ensure_snapshot(owners[0]).await.unwrap();
        assert_eq!(snapshot.gallery().len(), 1);
        assert_eq!(h.analysis.embed_calls.load(Ordering::SeqCst), 4);
        assert_eq!(builder.cached_owners(), 2);
    }

    #[tokio::test]
    async fn test_embeddings_match_detected_faces() {
        let h = Harness::new().await;
        let identity = h.register_person(h.owner, 5).await;

        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();
        let expected = crate::testing::embedding_of(person(5));
        assert_eq!(snapshot.gallery()[0].key, identity.id);
        assert_eq!(snapshot.gallery()[0].embedding, expected);
    }
}
