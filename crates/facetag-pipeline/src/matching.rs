//! Classify faces against an owner's snapshot.

use crate::analysis::{AnalysisError, FaceAnalysis};
use crate::snapshot::Snapshot;
use facetag_core::{DetectedFace, DistanceMatcher, Embedding, MatchResult, Matcher};
use facetag_store::IdentityId;
use std::path::Path;

/// Threshold classification against the known faces of one owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMatcher {
    matcher: DistanceMatcher,
}

impl IdentityMatcher {
    pub fn new(matcher: DistanceMatcher) -> Self {
        Self { matcher }
    }

    pub fn threshold(&self) -> f32 {
        self.matcher.threshold
    }

    /// Classify a single face.
    pub fn classify_face(&self, embedding: &Embedding, snapshot: &Snapshot) -> MatchResult<IdentityId> {
        self.matcher.classify(embedding, snapshot.gallery())
    }

    /// Classify a photo as a whole from its already detected faces: the best
    /// match over every face, or no match.
    pub fn classify_faces(&self, faces: &[DetectedFace], snapshot: &Snapshot) -> MatchResult<IdentityId> {
        let probes: Vec<Embedding> = faces.iter().map(|f| f.embedding.clone()).collect();
        self.matcher.classify_best(&probes, snapshot.gallery())
    }

    /// Detect the faces in `image_path` and classify the photo as a whole.
    ///
    /// An empty snapshot or a photo without faces is `NoMatch`.
    pub async fn classify(
        &self,
        analysis: &dyn FaceAnalysis,
        image_path: &Path,
        snapshot: &Snapshot,
    ) -> Result<MatchResult<IdentityId>, AnalysisError> {
        if snapshot.gallery().is_empty() {
            return Ok(MatchResult::NoMatch { closest: None });
        }
        let faces = analysis.detect_faces(image_path).await?;
        Ok(self.classify_faces(&faces, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face, Harness};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_classify_face_matches_known_person() {
        let h = Harness::new().await;
        let alice = h.register_person(h.owner, 1).await;
        h.register_person(h.owner, 2).await;
        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();

        let matcher = IdentityMatcher::default();
        match matcher.classify_face(&face(1).embedding, &snapshot) {
            MatchResult::Matched { key, distance } => {
                assert_eq!(key, alice.id);
                assert!(distance < matcher.threshold());
            }
            other => panic!("expected match, got {other:?}"),
        }
        assert!(!matcher.classify_face(&face(3).embedding, &snapshot).is_match());
    }

    #[tokio::test]
    async fn test_whole_photo_takes_best_face() {
        let h = Harness::new().await;
        let bob = h.register_person(h.owner, 2).await;
        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();

        let result = IdentityMatcher::default().classify_faces(&[face(7), face(2), face(9)], &snapshot);
        assert!(matches!(result, MatchResult::Matched { key, .. } if key == bob.id));
    }

    #[tokio::test]
    async fn test_classify_image_without_faces_is_no_match() {
        let h = Harness::new().await;
        h.register_person(h.owner, 1).await;
        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();

        let path = h.dir.path().join("empty.jpg");
        h.analysis.add_photo(&path, &[]);
        let result = IdentityMatcher::default()
            .classify(h.analysis.as_ref(), &path, &snapshot)
            .await
            .unwrap();
        assert_eq!(result, MatchResult::NoMatch { closest: None });
    }

    #[tokio::test]
    async fn test_cold_snapshot_skips_detection() {
        let h = Harness::new().await;
        let snapshot = h.pipeline.snapshots().ensure_snapshot(h.owner).await.unwrap();

        let path = h.dir.path().join("one.jpg");
        h.analysis.add_photo(&path, &[1]);
        let result = IdentityMatcher::default()
            .classify(h.analysis.as_ref(), &path, &snapshot)
            .await
            .unwrap();
        assert!(!result.is_match());
        assert_eq!(h.analysis.detect_calls.load(Ordering::SeqCst), 0);
    }
}
