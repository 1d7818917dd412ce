//! facetag-core: face detection, embedding and matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime on the CPU. Matching is a plain threshold on an
//! embedding distance metric.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use analyzer::{default_model_dir, AnalyzerError, OnnxAnalyzer};
pub use matcher::{Candidate, DistanceMatcher, GalleryEntry, MatchResult, Matcher};
pub use types::{BoundingBox, DetectedFace, DistanceMetric, Embedding};
