use facetag_pipeline::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid pipeline config: {0}")]
    Invalid(#[from] facetag_pipeline::ConfigError),
}

/// Daemon configuration: an optional TOML file, then `FACETAG_*`
/// environment overrides, then defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite registry database.
    pub db_path: PathBuf,
    /// Root directory of the reference-image object store.
    pub object_root: PathBuf,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Requests that may queue for the inference thread.
    pub engine_queue_depth: usize,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_dir: facetag_core::default_model_dir(),
            db_path: data_dir.join("facetag.db"),
            object_root: data_dir.join("objects"),
            system_bus: false,
            engine_queue_depth: 4,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACETAG_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACETAG_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.pipeline.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FACETAG_*` overrides read through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("FACETAG_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACETAG_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACETAG_OBJECT_ROOT") {
            self.object_root = PathBuf::from(v);
        }
        if let Some(v) = var("FACETAG_CACHE_DIR") {
            self.pipeline.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACETAG_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }

        let p = &mut self.pipeline;
        env_parse(&var, "FACETAG_DISTANCE_THRESHOLD", &mut p.distance_threshold);
        env_parse(&var, "FACETAG_DISTANCE_METRIC", &mut p.distance_metric);
        env_parse(&var, "FACETAG_RESOLUTION", &mut p.resolution);
        env_parse(&var, "FACETAG_DOWNLOAD_TIMEOUT_SECS", &mut p.download_timeout_secs);
        env_parse(&var, "FACETAG_DETECT_TIMEOUT_SECS", &mut p.detect_timeout_secs);
        env_parse(&var, "FACETAG_REGISTRY_TIMEOUT_SECS", &mut p.registry_timeout_secs);
        env_parse(&var, "FACETAG_EMBEDDING_CACHE_OWNERS", &mut p.embedding_cache_owners);
        if let Some(v) = var("FACETAG_SERIALIZE_PER_OWNER") {
            p.serialize_per_owner = v != "0";
        }
        env_parse(&var, "FACETAG_ENGINE_QUEUE_DEPTH", &mut self.engine_queue_depth);
    }
}

/// Overwrite `slot` with the parsed value of `key`, keeping the current
/// value when the variable is unset or malformed.
fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring malformed environment override"),
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetag")
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetag_core::DistanceMetric;
    use facetag_pipeline::ResolutionMode;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides_defaults() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("FACETAG_DB_PATH", "/var/lib/facetag/registry.db"),
            ("FACETAG_DISTANCE_THRESHOLD", "0.35"),
            ("FACETAG_DISTANCE_METRIC", "euclidean_l2"),
            ("FACETAG_RESOLUTION", "whole-photo"),
            ("FACETAG_SERIALIZE_PER_OWNER", "0"),
            ("FACETAG_SYSTEM_BUS", "1"),
            ("FACETAG_DETECT_TIMEOUT_SECS", "5"),
            ("FACETAG_EMBEDDING_CACHE_OWNERS", "8"),
        ]));

        assert_eq!(config.db_path, PathBuf::from("/var/lib/facetag/registry.db"));
        assert_eq!(config.pipeline.distance_threshold, 0.35);
        assert_eq!(config.pipeline.distance_metric, DistanceMetric::EuclideanL2);
        assert_eq!(config.pipeline.resolution, ResolutionMode::WholePhoto);
        assert!(!config.pipeline.serialize_per_owner);
        assert!(config.system_bus);
        assert_eq!(config.pipeline.detect_timeout_secs, 5);
        assert_eq!(config.pipeline.embedding_cache_owners, 8);
    }

    #[test]
    fn test_malformed_override_keeps_default() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("FACETAG_DISTANCE_THRESHOLD", "close"),
            ("FACETAG_RESOLUTION", "per-album"),
        ]));
        assert_eq!(config.pipeline.distance_threshold, 0.10);
        assert_eq!(config.pipeline.resolution, ResolutionMode::PerFace);
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facetag.toml");
        std::fs::write(
            &path,
            r#"
object_root = "/srv/facetag/objects"
engine_queue_depth = 8

[pipeline]
distance_threshold = 0.2
resolution = "whole-photo"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.object_root, PathBuf::from("/srv/facetag/objects"));
        assert_eq!(config.engine_queue_depth, 8);
        assert_eq!(config.pipeline.distance_threshold, 0.2);
        assert_eq!(config.pipeline.resolution, ResolutionMode::WholePhoto);
        // Unset keys keep their defaults.
        assert!(config.pipeline.serialize_per_owner);
        assert_eq!(config.pipeline.reference_extension, "png");
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facetag.toml");
        std::fs::write(&path, "distance_threshold = [").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
