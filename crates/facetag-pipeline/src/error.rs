use crate::analysis::AnalysisError;
use facetag_store::StoreError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("face detection failed: {0}")]
    Detection(#[source] AnalysisError),
    #[error("face detection timed out after {0:?}")]
    DetectionTimeout(Duration),
    #[error("registry error: {0}")]
    Registry(#[from] StoreError),
    #[error("registry call timed out after {0:?}")]
    RegistryTimeout(Duration),
    #[error("cannot encode reference image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("not authorized: {0}")]
    Unauthorized(String),
}

/// Coarse failure class, for callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The image could not be analyzed. Retrying the same bytes rarely helps.
    Detection,
    /// Storage or database trouble. Usually transient.
    Registry,
    /// The caller asked about something it does not own.
    Authorization,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Detection(_) | PipelineError::DetectionTimeout(_) => ErrorKind::Detection,
            PipelineError::Registry(_) | PipelineError::RegistryTimeout(_) | PipelineError::Encode(_) => {
                ErrorKind::Registry
            }
            PipelineError::Unauthorized(_) => ErrorKind::Authorization,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Detection => "detection",
            ErrorKind::Registry => "registry",
            ErrorKind::Authorization => "authorization",
        })
    }
}

/// Bound a registry call by `limit`.
pub(crate) async fn registry_call<T, F>(limit: Duration, call: F) -> Result<T, PipelineError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(PipelineError::RegistryTimeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetag_store::PhotoId;

    #[test]
    fn test_error_kinds() {
        let detection = PipelineError::Detection(AnalysisError::EngineStopped);
        assert_eq!(detection.kind(), ErrorKind::Detection);
        assert_eq!(
            PipelineError::DetectionTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::Detection
        );
        let missing = PipelineError::Registry(StoreError::PhotoNotFound(PhotoId::generate()));
        assert_eq!(missing.kind(), ErrorKind::Registry);
        assert_eq!(PipelineError::Unauthorized("x".into()).kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_registry_call_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        };
        let err = registry_call(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, PipelineError::RegistryTimeout(_)));
    }
}
