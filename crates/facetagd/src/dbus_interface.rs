use facetag_pipeline::{JobOutcome, PhotoJob, Pipeline};
use facetag_store::{OwnerId, PhotoId};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use zbus::interface;

pub const BUS_NAME: &str = "org.facetag.Pipeline1";
pub const OBJECT_PATH: &str = "/org/facetag/Pipeline1";

#[derive(Default)]
struct JobCounters {
    resolved: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// D-Bus interface for the facetag pipeline.
///
/// Bus name: org.facetag.Pipeline1
/// Object path: /org/facetag/Pipeline1
pub struct PipelineService {
    pipeline: Arc<Pipeline>,
    model_dir: PathBuf,
    started: Instant,
    counters: JobCounters,
}

impl PipelineService {
    pub fn new(pipeline: Arc<Pipeline>, model_dir: PathBuf) -> Self {
        Self {
            pipeline,
            model_dir,
            started: Instant::now(),
            counters: JobCounters::default(),
        }
    }
}

#[interface(name = "org.facetag.Pipeline1")]
impl PipelineService {
    /// Record an uploaded photo and return its id.
    async fn submit_photo(&self, owner_id: &str, storage_path: &str) -> zbus::fdo::Result<String> {
        let owner_id: OwnerId = parse_id(owner_id, "owner_id")?;
        tracing::info!(owner = %owner_id, storage_path, "submit_photo requested");
        let photo = self
            .pipeline
            .registry()
            .register_photo(owner_id, storage_path)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(photo.id.to_string())
    }

    /// Resolve the faces of a submitted photo. Returns the job outcome as JSON.
    async fn process_photo(&self, file_path: &str, owner_id: &str, photo_id: &str) -> zbus::fdo::Result<String> {
        let job = PhotoJob {
            file_path: PathBuf::from(file_path),
            owner_id: parse_id(owner_id, "owner_id")?,
            photo_id: parse_id(photo_id, "photo_id")?,
        };
        tracing::info!(owner = %job.owner_id, photo = %job.photo_id, "process_photo requested");

        let outcome = self.pipeline.process_photo(&job).await;
        let counter = match &outcome {
            JobOutcome::Resolved(_) => &self.counters.resolved,
            JobOutcome::Skipped(_) => &self.counters.skipped,
            JobOutcome::Failed(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(outcome_json(&outcome).to_string())
    }

    /// Classify a photo against the owner's identities without writing anything.
    async fn identify(&self, file_path: &str, owner_id: &str) -> zbus::fdo::Result<String> {
        let owner_id: OwnerId = parse_id(owner_id, "owner_id")?;
        tracing::info!(owner = %owner_id, file_path, "identify requested");
        let result = self
            .pipeline
            .identify(&PathBuf::from(file_path), owner_id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&result)
    }

    /// List the owner's identities as JSON, oldest first.
    async fn list_identities(&self, owner_id: &str) -> zbus::fdo::Result<String> {
        let owner_id: OwnerId = parse_id(owner_id, "owner_id")?;
        let identities = self
            .pipeline
            .registry()
            .list_identities(owner_id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&identities)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let config = self.pipeline.config();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "model_dir": self.model_dir.display().to_string(),
            "resolution": config.resolution.to_string(),
            "distance_metric": config.distance_metric.to_string(),
            "distance_threshold": config.distance_threshold,
            "serialize_per_owner": config.serialize_per_owner,
            "active_owners": self.pipeline.active_owners(),
            "cached_owners": self.pipeline.snapshots().cached_owners(),
            "jobs": {
                "resolved": self.counters.resolved.load(Ordering::Relaxed),
                "skipped": self.counters.skipped.load(Ordering::Relaxed),
                "failed": self.counters.failed.load(Ordering::Relaxed),
            },
        })
        .to_string())
    }
}

fn parse_id<T: FromStr>(raw: &str, field: &str) -> zbus::fdo::Result<T> {
    raw.parse()
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("{field} is not a valid id: {raw:?}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Wire form of a job outcome. Failures are reported in-band so callers can
/// tell the failing stage and error class apart.
fn outcome_json(outcome: &JobOutcome) -> Value {
    match outcome {
        JobOutcome::Resolved(resolution) => json!({
            "state": outcome.state(),
            "resolution": resolution,
        }),
        JobOutcome::Skipped(reason) => json!({
            "state": outcome.state(),
            "skipped": reason,
        }),
        JobOutcome::Failed(failure) => json!({
            "state": outcome.state(),
            "owner_id": failure.owner_id,
            "photo_id": failure.photo_id,
            "stage": failure.stage,
            "kind": failure.kind(),
            "error": failure.error.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetag_pipeline::{JobFailure, PipelineError, Resolution, ResolutionMode, SkipReason, Stage};

    #[test]
    fn test_parse_id_rejects_garbage() {
        let owner = OwnerId::generate();
        let parsed: OwnerId = parse_id(&owner.to_string(), "owner_id").unwrap();
        assert_eq!(parsed, owner);
        assert!(matches!(
            parse_id::<PhotoId>("photo-1", "photo_id"),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_resolved_outcome_json() {
        let outcome = JobOutcome::Resolved(Resolution {
            photo_id: PhotoId::generate(),
            owner_id: OwnerId::generate(),
            mode: ResolutionMode::PerFace,
            faces_detected: 0,
            matched: vec![],
            created: vec![],
            unavailable_references: 0,
        });
        let value = outcome_json(&outcome);
        assert_eq!(value["state"], "resolved");
        assert_eq!(value["resolution"]["mode"], "per-face");
        assert_eq!(value["resolution"]["faces_detected"], 0);
    }

    #[test]
    fn test_skipped_outcome_json() {
        let value = outcome_json(&JobOutcome::Skipped(SkipReason::AlreadyProcessed));
        assert_eq!(value["state"], "resolved");
        assert_eq!(value["skipped"], "already_processed");
    }

    #[test]
    fn test_failed_outcome_json() {
        let photo_id = PhotoId::generate();
        let outcome = JobOutcome::Failed(JobFailure {
            owner_id: OwnerId::generate(),
            photo_id,
            stage: Stage::Authorization,
            error: PipelineError::Unauthorized("photo is not registered".into()),
        });
        let value = outcome_json(&outcome);
        assert_eq!(value["state"], "failed");
        assert_eq!(value["stage"], "authorization");
        assert_eq!(value["kind"], "authorization");
        assert_eq!(value["photo_id"], photo_id.to_string());
    }
}
