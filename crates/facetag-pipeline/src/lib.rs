//! facetag-pipeline: resolve the faces in an uploaded photo to per-owner
//! identities.
//!
//! A [`Pipeline`] takes a [`PhotoJob`], refreshes the owner's known-face
//! [`Snapshot`], detects and classifies every face, then registers new
//! identities and links the photo. Face analysis is behind the
//! [`FaceAnalysis`] trait; production uses the ONNX engine thread from
//! [`engine::spawn_engine`].

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod matching;
pub mod orchestrator;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{AnalysisError, FaceAnalysis};
pub use config::{ConfigError, PipelineConfig, ResolutionMode};
pub use engine::{spawn_engine, AnalyzerHandle, EngineError};
pub use error::{ErrorKind, PipelineError};
pub use matching::IdentityMatcher;
pub use orchestrator::{
    JobFailure, JobOutcome, JobState, MatchedIdentity, PhotoJob, Pipeline, Resolution, SkipReason, Stage,
};
pub use snapshot::{Snapshot, SnapshotBuildError, SnapshotBuilder};
