//! Resolution policy: thresholds, modes, timeouts and cache placement.

use facetag_core::matcher::{DEFAULT_DISTANCE_THRESHOLD, DEFAULT_TIE_EPSILON};
use facetag_core::{DistanceMatcher, DistanceMetric};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("distance threshold must be a positive number, got {0}")]
    Threshold(f32),
    #[error("tie epsilon must be zero or positive, got {0}")]
    TieEpsilon(f32),
    #[error("{0} timeout must be at least one second")]
    Timeout(&'static str),
    #[error("unsupported reference image extension: {0:?}")]
    Extension(String),
    #[error("embedding cache must hold at least one owner")]
    CacheOwners,
}

/// What a photo's faces are classified as a unit of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMode {
    /// Every detected face is matched on its own; unmatched faces become new identities.
    #[default]
    PerFace,
    /// Legacy policy: link the single best whole-photo match, or register
    /// every face when nothing matches.
    WholePhoto,
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolutionMode::PerFace => "per-face",
            ResolutionMode::WholePhoto => "whole-photo",
        })
    }
}

impl FromStr for ResolutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-face" => Ok(ResolutionMode::PerFace),
            "whole-photo" => Ok(ResolutionMode::WholePhoto),
            other => Err(format!("unknown resolution mode: {other}")),
        }
    }
}

/// Pipeline policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of the owner-scoped known-face snapshots.
    pub cache_dir: PathBuf,
    /// Matches must be strictly closer than this.
    pub distance_threshold: f32,
    pub distance_metric: DistanceMetric,
    /// Candidates this close to the best distance tie; lowest identity id wins.
    pub tie_epsilon: f32,
    pub resolution: ResolutionMode,
    /// Run at most one job per owner at a time.
    pub serialize_per_owner: bool,
    pub download_timeout_secs: u64,
    pub detect_timeout_secs: u64,
    pub registry_timeout_secs: u64,
    /// Encoding of stored reference crops.
    pub reference_extension: String,
    /// Owners whose reference embeddings stay in memory between jobs.
    pub embedding_cache_owners: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            distance_metric: DistanceMetric::Cosine,
            tie_epsilon: DEFAULT_TIE_EPSILON,
            resolution: ResolutionMode::PerFace,
            serialize_per_owner: true,
            download_timeout_secs: 30,
            detect_timeout_secs: 60,
            registry_timeout_secs: 15,
            reference_extension: "png".to_string(),
            embedding_cache_owners: 64,
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.distance_threshold.is_finite() || self.distance_threshold <= 0.0 {
            return Err(ConfigError::Threshold(self.distance_threshold));
        }
        if !self.tie_epsilon.is_finite() || self.tie_epsilon < 0.0 {
            return Err(ConfigError::TieEpsilon(self.tie_epsilon));
        }
        for (name, secs) in [
            ("download", self.download_timeout_secs),
            ("detect", self.detect_timeout_secs),
            ("registry", self.registry_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Timeout(name));
            }
        }
        if self.embedding_cache_owners == 0 {
            return Err(ConfigError::CacheOwners);
        }
        self.reference_format()?;
        Ok(())
    }

    pub fn matcher(&self) -> DistanceMatcher {
        DistanceMatcher {
            metric: self.distance_metric,
            threshold: self.distance_threshold,
            tie_epsilon: self.tie_epsilon,
        }
    }

    pub fn reference_format(&self) -> Result<ImageFormat, ConfigError> {
        match ImageFormat::from_extension(&self.reference_extension) {
            Some(format @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP)) => Ok(format),
            _ => Err(ConfigError::Extension(self.reference_extension.clone())),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }
}

/// `$XDG_CACHE_HOME/facetag`, falling back to `~/.cache/facetag`.
pub fn default_cache_dir() -> PathBuf {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".cache")
        })
        .join("facetag")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.distance_threshold, 0.10);
        assert_eq!(config.resolution, ResolutionMode::PerFace);
        assert!(config.serialize_per_owner);
        assert_eq!(config.reference_format(), Ok(ImageFormat::Png));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = PipelineConfig { distance_threshold: 0.0, ..PipelineConfig::default() };
        assert_eq!(bad.validate(), Err(ConfigError::Threshold(0.0)));

        let bad = PipelineConfig { tie_epsilon: -1.0, ..PipelineConfig::default() };
        assert_eq!(bad.validate(), Err(ConfigError::TieEpsilon(-1.0)));

        let bad = PipelineConfig { detect_timeout_secs: 0, ..PipelineConfig::default() };
        assert_eq!(bad.validate(), Err(ConfigError::Timeout("detect")));

        let bad = PipelineConfig { reference_extension: "gif".into(), ..PipelineConfig::default() };
        assert_eq!(bad.validate(), Err(ConfigError::Extension("gif".into())));
        let bad = PipelineConfig { embedding_cache_owners: 0, ..PipelineConfig::default() };
        assert_eq!(bad.validate(), Err(ConfigError::CacheOwners));
    }

    #[test]
    fn test_resolution_mode_parse() {
        assert_eq!("per_face".parse(), Ok(ResolutionMode::PerFace));
        assert_eq!("Whole-Photo".parse(), Ok(ResolutionMode::WholePhoto));
        assert!("per-album".parse::<ResolutionMode>().is_err());
    }

    #[test]
    fn test_matcher_follows_config() {
        let config = PipelineConfig {
            distance_threshold: 0.4,
            distance_metric: DistanceMetric::EuclideanL2,
            ..PipelineConfig::default()
        };
        let m = config.matcher();
        assert_eq!(m.threshold, 0.4);
        assert_eq!(m.metric, DistanceMetric::EuclideanL2);
    }
}
