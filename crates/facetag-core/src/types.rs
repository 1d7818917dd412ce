use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in pixels of the source photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer `(x, y, width, height)` rectangle clipped to an image of the given size.
    ///
    /// Returns `None` when the clipped rectangle is empty.
    pub fn clamped_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(image_width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(image_height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between the raw vectors.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy of this embedding scaled to unit length. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// How two embeddings are compared. Lower distance = more similar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// Euclidean distance of the raw vectors.
    Euclidean,
    /// Euclidean distance of the unit-normalized vectors, in [0, 2].
    EuclideanL2,
}

impl DistanceMetric {
    /// Distance between two embeddings under this metric.
    ///
    /// Embeddings of different dimensionality never compare as close: the
    /// result is `f32::INFINITY`. A NaN result is also mapped to infinity.
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        if a.values.len() != b.values.len() {
            return f32::INFINITY;
        }
        let d = match self {
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::EuclideanL2 => a.l2_normalized().euclidean_distance(&b.l2_normalized()),
        };
        if d.is_nan() { f32::INFINITY } else { d }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean-l2",
        })
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean-l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// One face found in a photo: where it is, what it looks like to the
/// recognizer, and the aligned crop used as a reference image.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    /// Aligned 112×112 RGB face crop.
    pub crop: RgbImage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_distance_ranges() {
        let m = DistanceMetric::Cosine;
        assert!(m.distance(&emb(&[1.0, 0.0]), &emb(&[2.0, 0.0])).abs() < 1e-6);
        assert!((m.distance(&emb(&[1.0, 0.0]), &emb(&[0.0, 1.0])) - 1.0).abs() < 1e-6);
        assert!((m.distance(&emb(&[1.0, 0.0]), &emb(&[-1.0, 0.0])) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_ignores_magnitude() {
        let d = DistanceMetric::EuclideanL2.distance(&emb(&[3.0, 0.0]), &emb(&[0.5, 0.0]));
        assert!(d.abs() < 1e-6);
        let raw = DistanceMetric::Euclidean.distance(&emb(&[3.0, 0.0]), &emb(&[0.5, 0.0]));
        assert!((raw - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_infinite() {
        let d = DistanceMetric::Cosine.distance(&emb(&[1.0, 0.0]), &emb(&[1.0, 0.0, 0.0]));
        assert!(d.is_infinite());
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("Euclidean_L2".parse::<DistanceMetric>(), Ok(DistanceMetric::EuclideanL2));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
        assert_eq!(DistanceMetric::EuclideanL2.to_string(), "euclidean-l2");
    }

    #[test]
    fn test_clamped_rect_inside() {
        let b = BoundingBox {
            x: 10.2, y: 20.7, width: 30.0, height: 40.0, confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.clamped_rect(100, 100), Some((10, 20, 31, 41)));
    }

    #[test]
    fn test_clamped_rect_clips_and_rejects() {
        let b = BoundingBox {
            x: -5.0, y: -5.0, width: 20.0, height: 20.0, confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.clamped_rect(10, 10), Some((0, 0, 10, 10)));

        let outside = BoundingBox {
            x: 50.0, y: 50.0, width: 5.0, height: 5.0, confidence: 0.9, landmarks: None,
        };
        assert_eq!(outside.clamped_rect(10, 10), None);
    }
}
