//! Nearest-reference matching over a gallery of known embeddings.

use crate::types::{DistanceMetric, Embedding};
use serde::Serialize;
use std::cmp::Ordering;

/// Default acceptance threshold on [`DistanceMetric::Cosine`] distance.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.10;

/// Distances closer than this to the best one count as a tie.
pub const DEFAULT_TIE_EPSILON: f32 = 1e-6;

/// A known reference embedding, keyed by whatever identifies it to the caller.
#[derive(Debug, Clone)]
pub struct GalleryEntry<K> {
    pub key: K,
    pub embedding: Embedding,
}

/// One gallery entry scored against a probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate<K> {
    pub key: K,
    pub distance: f32,
}

/// Outcome of classifying a probe against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchResult<K> {
    /// Best candidate cleared the threshold.
    Matched { key: K, distance: f32 },
    /// Nothing cleared the threshold. `closest` is the best distance seen, if any.
    NoMatch { closest: Option<f32> },
}

impl<K> MatchResult<K> {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    fn distance(&self) -> Option<f32> {
        match self {
            MatchResult::Matched { distance, .. } => Some(*distance),
            MatchResult::NoMatch { closest } => *closest,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of known faces.
pub trait Matcher {
    /// Score every gallery entry, nearest first. Equal distances are ordered by key.
    fn rank<K: Ord + Clone>(&self, probe: &Embedding, gallery: &[GalleryEntry<K>]) -> Vec<Candidate<K>>;

    /// Pick the best gallery entry for `probe`, if it is close enough.
    fn classify<K: Ord + Clone>(&self, probe: &Embedding, gallery: &[GalleryEntry<K>]) -> MatchResult<K>;

    /// Distances this close to each other count as a tie.
    fn tie_epsilon(&self) -> f32 {
        0.0
    }

    /// Classify several probes (every face of one photo) and keep the single best result.
    ///
    /// A match always beats a non-match. Between two matches, the lower
    /// distance wins unless the two tie, in which case the lower key wins.
    fn classify_best<K: Ord + Clone>(&self, probes: &[Embedding], gallery: &[GalleryEntry<K>]) -> MatchResult<K> {
        let mut best: MatchResult<K> = MatchResult::NoMatch { closest: None };

        for probe in probes {
            let result = self.classify(probe, gallery);
            let replace = match (&best, &result) {
                (MatchResult::NoMatch { .. }, MatchResult::Matched { .. }) => true,
                (MatchResult::Matched { .. }, MatchResult::NoMatch { .. }) => false,
                (
                    MatchResult::Matched { key: bk, distance: bd },
                    MatchResult::Matched { key: rk, distance: rd },
                ) => {
                    if (rd - bd).abs() <= self.tie_epsilon() {
                        rk < bk
                    } else {
                        rd < bd
                    }
                }
                (b, r) => match (b.distance(), r.distance()) {
                    (None, Some(_)) => true,
                    (Some(bd), Some(rd)) => rd < bd,
                    _ => false,
                },
            };
            if replace {
                best = result;
            }
        }

        best
    }
}

/// Threshold matcher over a configurable distance metric.
///
/// A candidate is accepted only when its distance is strictly below
/// `threshold`. Candidates within `tie_epsilon` of the best distance are
/// resolved in favour of the lowest key, so the result does not depend on
/// gallery order.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    pub metric: DistanceMetric,
    pub threshold: f32,
    pub tie_epsilon: f32,
}

impl Default for DistanceMatcher {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Cosine,
            threshold: DEFAULT_DISTANCE_THRESHOLD,
            tie_epsilon: DEFAULT_TIE_EPSILON,
        }
    }
}

impl Matcher for DistanceMatcher {
    fn rank<K: Ord + Clone>(&self, probe: &Embedding, gallery: &[GalleryEntry<K>]) -> Vec<Candidate<K>> {
        let mut ranked: Vec<Candidate<K>> = gallery
            .iter()
            .map(|entry| Candidate {
                key: entry.key.clone(),
                distance: self.metric.distance(probe, &entry.embedding),
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        ranked
    }

    fn classify<K: Ord + Clone>(&self, probe: &Embedding, gallery: &[GalleryEntry<K>]) -> MatchResult<K> {
        let ranked = self.rank(probe, gallery);
        let Some(first) = ranked.first() else {
            return MatchResult::NoMatch { closest: None };
        };

        let best_distance = first.distance;
        if best_distance.is_nan() || best_distance >= self.threshold {
            return MatchResult::NoMatch {
                closest: best_distance.is_finite().then_some(best_distance),
            };
        }

        // Tied candidates must clear the threshold on their own.
        let winner = ranked
            .iter()
            .take_while(|c| c.distance - best_distance <= self.tie_epsilon && c.distance < self.threshold)
            .min_by(|a, b| a.key.cmp(&b.key))
            .unwrap_or(first);

        MatchResult::Matched {
            key: winner.key.clone(),
            distance: winner.distance,
        }
    }

    fn tie_epsilon(&self) -> f32 {
        self.tie_epsilon
    }
}
