//! Per-photo resolution jobs.
//!
//! A job moves `Pending → SnapshotReady → Classified → Resolved`, or to
//! `Failed` from any of them. Writes happen only in the last step, so a
//! job that fails before `Classified` leaves the registry untouched.

use crate::analysis::FaceAnalysis;
use crate::config::{ConfigError, PipelineConfig, ResolutionMode};
use crate::error::{registry_call, ErrorKind, PipelineError};
use crate::locks::OwnerLocks;
use crate::matching::IdentityMatcher;
use crate::snapshot::{Snapshot, SnapshotBuilder};
use facetag_core::{DetectedFace, MatchResult};
use facetag_store::{Identity, IdentityId, IdentityRegistry, OwnerId, Photo, PhotoId, ReferenceImage, StoreError};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;

/// One uploaded photo to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoJob {
    /// Local path of the photo's bytes.
    pub file_path: PathBuf,
    pub owner_id: OwnerId,
    pub photo_id: PhotoId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    SnapshotReady,
    Classified,
    Resolved,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "pending",
            JobState::SnapshotReady => "snapshot_ready",
            JobState::Classified => "classified",
            JobState::Resolved => "resolved",
            JobState::Failed => "failed",
        })
    }
}

/// Where in a job a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Authorization,
    Snapshot,
    Detection,
    Resolution,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Authorization => "authorization",
            Stage::Snapshot => "snapshot",
            Stage::Detection => "detection",
            Stage::Resolution => "resolution",
        })
    }
}

/// A known identity found in the photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedIdentity {
    pub identity_id: IdentityId,
    pub distance: f32,
}

/// What a resolved job wrote.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub photo_id: PhotoId,
    pub owner_id: OwnerId,
    pub mode: ResolutionMode,
    pub faces_detected: usize,
    /// Existing identities linked to the photo.
    pub matched: Vec<MatchedIdentity>,
    /// Identities registered from this photo's faces, each linked to it.
    pub created: Vec<Identity>,
    /// Known identities excluded from matching because their reference was unavailable.
    pub unavailable_references: usize,
}

impl Resolution {
    /// Every identity now linked to the photo by this job.
    pub fn linked(&self) -> impl Iterator<Item = IdentityId> + '_ {
        self.matched
            .iter()
            .map(|m| m.identity_id)
            .chain(self.created.iter().map(|i| i.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous job resolved this photo.
    AlreadyProcessed,
    /// The photo already has identity links.
    AlreadyLinked,
}

/// A job that reached `Failed`.
#[derive(Error, Debug)]
#[error("photo {photo_id} of owner {owner_id} failed during {stage}: {error}")]
pub struct JobFailure {
    pub owner_id: OwnerId,
    pub photo_id: PhotoId,
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Resolved(Resolution),
    Skipped(SkipReason),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Resolved(_) | JobOutcome::Skipped(_) => JobState::Resolved,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }
}

/// What to do with the faces of one photo.
#[derive(Debug, PartialEq)]
enum Decision {
    Attach { identity_id: IdentityId, distance: f32 },
    Register { face: usize },
}

/// Resolves photos to identities.
///
/// Built once by the process entry point and shared by reference; every
/// collaborator is passed in.
pub struct Pipeline {
    registry: IdentityRegistry,
    analysis: Arc<dyn FaceAnalysis>,
    snapshots: SnapshotBuilder,
    matcher: IdentityMatcher,
    locks: OwnerLocks,
    reference_format: ImageFormat,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        registry: IdentityRegistry,
        analysis: Arc<dyn FaceAnalysis>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let reference_format = config.reference_format()?;
        Ok(Self {
            snapshots: SnapshotBuilder::new(registry.clone(), analysis.clone(), &config),
            matcher: IdentityMatcher::new(config.matcher()),
            registry,
            analysis,
            locks: OwnerLocks::default(),
            reference_format,
            config,
        })
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn snapshots(&self) -> &SnapshotBuilder {
        &self.snapshots
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Owners with a job currently running or queued.
    pub fn active_owners(&self) -> usize {
        self.locks.active()
    }

    /// Resolve every face of `job`'s photo to an identity of its owner.
    ///
    /// Never panics and never retries. A photo that was already processed,
    /// or already has links, is skipped without any writes.
    pub async fn process_photo(&self, job: &PhotoJob) -> JobOutcome {
        let span = tracing::info_span!("job", owner = %job.owner_id, photo = %job.photo_id);
        self.run(job).instrument(span).await
    }

    /// Classify the photo at `image_path` against `owner_id`'s identities
    /// without writing anything.
    pub async fn identify(&self, image_path: &Path, owner_id: OwnerId) -> Result<MatchResult<IdentityId>, PipelineError> {
        let snapshot = self.snapshots.ensure_snapshot(owner_id).await?;
        let limit = self.config.detect_timeout();
        let classify = self.matcher.classify(self.analysis.as_ref(), image_path, &snapshot);
        match tokio::time::timeout(limit, classify).await {
            Ok(result) => result.map_err(PipelineError::Detection),
            Err(_) => Err(PipelineError::DetectionTimeout(limit)),
        }
    }

    async fn run(&self, job: &PhotoJob) -> JobOutcome {
        let mut state = JobState::Pending;
        tracing::debug!(state = %state, path = %job.file_path.display(), "job received");

        let _guard = if self.config.serialize_per_owner {
            Some(self.locks.lock(job.owner_id).await)
        } else {
            None
        };

        let photo = match self.authorize(job).await {
            Ok(photo) => photo,
            Err(e) => return self.fail(job, &mut state, Stage::Authorization, e),
        };
        match self.skip_reason(&photo).await {
            Ok(Some(reason)) => {
                tracing::info!(reason = ?reason, "photo already resolved; skipping");
                return JobOutcome::Skipped(reason);
            }
            Ok(None) => {}
            Err(e) => return self.fail(job, &mut state, Stage::Authorization, e),
        }

        let snapshot = match self.snapshots.ensure_snapshot(job.owner_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(job, &mut state, Stage::Snapshot, e),
        };
        transition(&mut state, JobState::SnapshotReady);

        let faces = match self.detect(&job.file_path).await {
            Ok(faces) => faces,
            Err(e) => return self.fail(job, &mut state, Stage::Detection, e),
        };
        let plan = self.plan(&faces, &snapshot);
        transition(&mut state, JobState::Classified);

        match self.resolve(job, &faces, plan, &snapshot).await {
            Ok(resolution) => {
                transition(&mut state, JobState::Resolved);
                tracing::info!(
                    faces = resolution.faces_detected,
                    matched = resolution.matched.len(),
                    created = resolution.created.len(),
                    unavailable = resolution.unavailable_references,
                    "photo resolved"
                );
                JobOutcome::Resolved(resolution)
            }
            Err(e) => self.fail(job, &mut state, Stage::Resolution, e),
        }
    }

    fn fail(&self, job: &PhotoJob, state: &mut JobState, stage: Stage, error: PipelineError) -> JobOutcome {
        transition(state, JobState::Failed);
        tracing::error!(
            owner = %job.owner_id,
            photo = %job.photo_id,
            stage = %stage,
            kind = %error.kind(),
            error = %error,
            "job failed"
        );
        JobOutcome::Failed(JobFailure {
            owner_id: job.owner_id,
            photo_id: job.photo_id,
            stage,
            error,
        })
    }

    /// The photo must exist and belong to the job's owner.
    async fn authorize(&self, job: &PhotoJob) -> Result<Photo, PipelineError> {
        let limit = self.config.registry_timeout();
        let photo = registry_call(limit, self.registry.get_photo(job.photo_id)).await?;
        match photo {
            None => Err(PipelineError::Unauthorized(format!("photo {} is not registered", job.photo_id))),
            Some(photo) if photo.owner_id != job.owner_id => Err(PipelineError::Unauthorized(format!(
                "photo {} does not belong to owner {}",
                job.photo_id, job.owner_id
            ))),
            Some(photo) => Ok(photo),
        }
    }

    async fn skip_reason(&self, photo: &Photo) -> Result<Option<SkipReason>, PipelineError> {
        if photo.processed_at.is_some() {
            return Ok(Some(SkipReason::AlreadyProcessed));
        }
        let limit = self.config.registry_timeout();
        if registry_call(limit, self.registry.photo_has_links(photo.id)).await? {
            return Ok(Some(SkipReason::AlreadyLinked));
        }
        Ok(None)
    }

    async fn detect(&self, image_path: &Path) -> Result<Vec<DetectedFace>, PipelineError> {
        let limit = self.config.detect_timeout();
        match tokio::time::timeout(limit, self.analysis.detect_faces(image_path)).await {
            Ok(Ok(faces)) => {
                tracing::debug!(faces = faces.len(), "faces detected");
                Ok(faces)
            }
            Ok(Err(e)) => Err(PipelineError::Detection(e)),
            Err(_) => Err(PipelineError::DetectionTimeout(limit)),
        }
    }

    /// Decide per face whether to attach an existing identity or register a new one.
    fn plan(&self, faces: &[DetectedFace], snapshot: &Snapshot) -> Vec<Decision> {
        if snapshot.is_cold() {
            tracing::debug!(faces = faces.len(), "cold start; every face becomes an identity");
            return (0..faces.len()).map(|face| Decision::Register { face }).collect();
        }

        // One attach per identity, at its closest face.
        let mut attach: BTreeMap<IdentityId, f32> = BTreeMap::new();
        let mut register = Vec::new();

        match self.config.resolution {
            ResolutionMode::PerFace => {
                for (index, face) in faces.iter().enumerate() {
                    match self.matcher.classify_face(&face.embedding, snapshot) {
                        MatchResult::Matched { key, distance } => {
                            tracing::debug!(face = index, identity = %key, distance, "face matched");
                            let best = attach.entry(key).or_insert(distance);
                            *best = best.min(distance);
                        }
                        MatchResult::NoMatch { closest } => {
                            tracing::debug!(face = index, closest = ?closest, "face unmatched");
                            register.push(index);
                        }
                    }
                }
            }
            ResolutionMode::WholePhoto => match self.matcher.classify_faces(faces, snapshot) {
                MatchResult::Matched { key, distance } => {
                    tracing::debug!(identity = %key, distance, "photo matched");
                    attach.insert(key, distance);
                }
                MatchResult::NoMatch { closest } => {
                    tracing::debug!(closest = ?closest, "photo unmatched");
                    register.extend(0..faces.len());
                }
            },
        }

        attach
            .into_iter()
            .map(|(identity_id, distance)| Decision::Attach { identity_id, distance })
            .chain(register.into_iter().map(|face| Decision::Register { face }))
            .collect()
    }

    async fn resolve(
        &self,
        job: &PhotoJob,
        faces: &[DetectedFace],
        plan: Vec<Decision>,
        snapshot: &Snapshot,
    ) -> Result<Resolution, PipelineError> {
        let limit = self.config.registry_timeout();
        let mut resolution = Resolution {
            photo_id: job.photo_id,
            owner_id: job.owner_id,
            mode: self.config.resolution,
            faces_detected: faces.len(),
            matched: Vec::new(),
            created: Vec::new(),
            unavailable_references: snapshot.unavailable().len(),
        };

        for decision in plan {
            match decision {
                Decision::Attach { identity_id, distance } => {
                    registry_call(
                        limit,
                        self.registry.link_photo_identity(job.photo_id, job.owner_id, identity_id),
                    )
                    .await?;
                    resolution.matched.push(MatchedIdentity { identity_id, distance });
                }
                Decision::Register { face } => {
                    let Some(detected) = faces.get(face) else {
                        continue;
                    };
                    let reference = self.encode_reference(&detected.crop)?;
                    let identity =
                        registry_call(limit, self.registry.register_identity(job.owner_id, reference)).await?;
                    registry_call(
                        limit,
                        self.registry.link_photo_identity(job.photo_id, job.owner_id, identity.id),
                    )
                    .await?;
                    resolution.created.push(identity);
                }
            }
        }

        registry_call(limit, self.registry.mark_photo_processed(job.photo_id)).await?;
        Ok(resolution)
    }

    fn encode_reference(&self, crop: &RgbImage) -> Result<ReferenceImage, PipelineError> {
        let mut bytes = Vec::new();
        crop.write_to(&mut Cursor::new(&mut bytes), self.reference_format)?;
        Ok(ReferenceImage::new(bytes, self.config.reference_extension.as_str()).map_err(StoreError::from)?)
    }
}

fn transition(state: &mut JobState, next: JobState) {
    tracing::debug!(from = %state, to = %next, "job state");
    *state = next;
}
