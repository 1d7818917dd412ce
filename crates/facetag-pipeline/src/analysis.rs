//! The face-analysis capability the pipeline depends on.

use async_trait::async_trait;
use facetag_core::{AnalyzerError, DetectedFace, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("cannot read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("analysis engine stopped")]
    EngineStopped,
}

/// Detect faces in images and embed face crops.
///
/// Every embedding returned for one deployment must come from the same
/// model, so distances between them are comparable.
#[async_trait]
pub trait FaceAnalysis: Send + Sync {
    /// Every face in the image at `image_path`, with its aligned crop and embedding.
    async fn detect_faces(&self, image_path: &Path) -> Result<Vec<DetectedFace>, AnalysisError>;

    /// Embed a face crop that is already aligned, such as a stored reference image.
    async fn embed(&self, crop: RgbImage) -> Result<Embedding, AnalysisError>;
}
