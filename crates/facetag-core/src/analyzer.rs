//! Detection + embedding combined into the per-photo face analysis step.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{DetectedFace, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Default location of the ONNX models: `$XDG_DATA_HOME/facetag/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetag")
        .join("models")
}

/// SCRFD + ArcFace, loaded together.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }

    /// Detect every face in `image`, align it and embed it.
    ///
    /// Faces the detector returned without landmarks cannot be aligned and
    /// are skipped.
    pub fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            if bbox.landmarks.is_none() {
                tracing::debug!(confidence = bbox.confidence, "skipping face without landmarks");
                continue;
            }
            let (embedding, crop) = self.recognizer.extract(image, &bbox)?;
            faces.push(DetectedFace { bbox, embedding, crop });
        }

        Ok(faces)
    }

    /// Embed an already aligned face crop.
    pub fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, AnalyzerError> {
        Ok(self.recognizer.embed_aligned(crop)?)
    }
}
