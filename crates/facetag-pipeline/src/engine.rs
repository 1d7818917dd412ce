use crate::analysis::{AnalysisError, FaceAnalysis};
use async_trait::async_trait;
use facetag_core::{AnalyzerError, DetectedFace, Embedding, OnnxAnalyzer};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Load(#[from] AnalyzerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Detect {
        image_path: PathBuf,
        reply: oneshot::Sender<Result<Vec<DetectedFace>, AnalysisError>>,
    },
    Embed {
        crop: RgbImage,
        reply: oneshot::Sender<Result<Embedding, AnalysisError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct AnalyzerHandle {
    tx: mpsc::Sender<EngineRequest>,
}

#[async_trait]
impl FaceAnalysis for AnalyzerHandle {
    async fn detect_faces(&self, image_path: &Path) -> Result<Vec<DetectedFace>, AnalysisError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                image_path: image_path.to_path_buf(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| AnalysisError::EngineStopped)?;
        reply_rx.await.map_err(|_| AnalysisError::EngineStopped)?
    }

    async fn embed(&self, crop: RgbImage) -> Result<Embedding, AnalysisError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed { crop, reply: reply_tx })
            .await
            .map_err(|_| AnalysisError::EngineStopped)?;
        reply_rx.await.map_err(|_| AnalysisError::EngineStopped)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models synchronously so a missing or broken model fails
/// startup instead of the first job. Inference is blocking and the sessions
/// need `&mut`, so all of it happens on this one thread; callers queue
/// behind a bounded channel of `queue_depth` requests.
pub fn spawn_engine(model_dir: &Path, queue_depth: usize) -> Result<AnalyzerHandle, EngineError> {
    let mut analyzer = OnnxAnalyzer::load(model_dir)?;
    tracing::info!(dir = %model_dir.display(), "face models loaded");

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("facetag-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { image_path, reply } => {
                        let _ = reply.send(run_detect(&mut analyzer, &image_path));
                    }
                    EngineRequest::Embed { crop, reply } => {
                        let _ = reply.send(analyzer.embed(&crop).map_err(AnalysisError::from));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(AnalyzerHandle { tx })
}

fn run_detect(analyzer: &mut OnnxAnalyzer, image_path: &Path) -> Result<Vec<DetectedFace>, AnalysisError> {
    let image = image::open(image_path)
        .map_err(|source| AnalysisError::Image {
            path: image_path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let faces = analyzer.analyze(&image)?;
    tracing::debug!(
        path = %image_path.display(),
        width = image.width(),
        height = image.height(),
        faces = faces.len(),
        "detect: analyzed image"
    );
    Ok(faces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_fails_without_models() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(spawn_engine(dir.path(), 4), Err(EngineError::Load(_))));
    }

    #[tokio::test]
    async fn test_stopped_engine_reports_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = AnalyzerHandle { tx };

        let err = handle.detect_faces(Path::new("/tmp/x.jpg")).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EngineStopped));

        let err = handle.embed(RgbImage::new(112, 112)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EngineStopped));
    }

    #[tokio::test]
    async fn test_dropped_reply_reports_error() {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);
        let handle = AnalyzerHandle { tx };

        // An engine that takes the request and dies without answering.
        tokio::spawn(async move {
            let _ = rx.recv().await;
        });

        let err = handle.embed(RgbImage::new(4, 4)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EngineStopped));
    }
}
