//! Engine configuration
//!
//! Loaded from YAML; every field has a default so a partial file (or none
//! at all) is valid. Selected fields can be overridden from `SIMGRAPH_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaborators::DEFAULT_COLLABORATOR_TIMEOUT_MS;
use crate::error::{GraphError, Result};
use crate::paths::DEFAULT_PATH_PREFIX;
use crate::similarity::validate_threshold;

const ENV_PREFIX: &str = "SIMGRAPH_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the image files
    pub images_dir: PathBuf,

    /// Accepted extensions, without dot, matched case-insensitively
    pub image_extensions: Vec<String>,

    /// Conventional prefix callers put in front of file names
    pub path_prefix: String,

    /// Query threshold when the caller gives none
    pub default_threshold: f32,

    /// Edge threshold for rebuild/update when the caller gives none
    pub build_threshold: f32,

    pub default_neighbor_limit: usize,
    pub default_depth: usize,
    pub default_limit_per_level: usize,
    pub default_max_nodes: usize,

    /// Per-call deadline for embedder/describer/extractor calls; `null` disables it
    pub collaborator_timeout_ms: Option<u64>,

    /// Compare similarity pairs on the rayon pool
    pub parallel_pairs: bool,

    /// Default directive for `logging::init_tracing`
    pub log_level: String,

    /// Snapshot file for a persistent memory store
    pub store_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("images"),
            image_extensions: ["jpg", "jpeg", "png", "gif"].iter().map(|s| s.to_string()).collect(),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            default_threshold: 0.5,
            build_threshold: 0.35,
            default_neighbor_limit: 10,
            default_depth: 1,
            default_limit_per_level: 10,
            default_max_nodes: 100,
            collaborator_timeout_ms: Some(DEFAULT_COLLABORATOR_TIMEOUT_MS),
            parallel_pairs: true,
            log_level: "info".to_string(),
            store_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `SIMGRAPH_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Apply overrides from `lookup` (keys without the `SIMGRAPH_` prefix).
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("IMAGES_DIR") {
            self.images_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(raw) = lookup("DEFAULT_THRESHOLD") {
            self.default_threshold = parse_threshold("DEFAULT_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("BUILD_THRESHOLD") {
            self.build_threshold = parse_threshold("BUILD_THRESHOLD", &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.default_threshold)?;
        validate_threshold(self.build_threshold)?;
        if self.image_extensions.is_empty() {
            return Err(GraphError::Config("image_extensions must not be empty".into()));
        }
        Ok(())
    }

    pub fn collaborator_timeout(&self) -> Option<Duration> {
        self.collaborator_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_threshold(key: &str, raw: &str) -> Result<f32> {
    raw.trim()
        .parse::<f32>()
        .map_err(|e| GraphError::Config(format!("{}{}={:?}: {}", ENV_PREFIX, key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_threshold, 0.5);
        assert_eq!(config.build_threshold, 0.35);
        assert_eq!(config.default_neighbor_limit, 10);
        assert_eq!(config.default_depth, 1);
        assert_eq!(config.default_limit_per_level, 10);
        assert_eq!(config.default_max_nodes, 100);
        assert_eq!(config.path_prefix, "images/");
        assert_eq!(config.image_extensions, vec!["jpg", "jpeg", "png", "gif"]);
        assert_eq!(config.collaborator_timeout(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            "images_dir: /srv/photos\ndefault_threshold: 0.7\ncollaborator_timeout_ms: 2500\n",
        )
        .unwrap();
        assert_eq!(config.images_dir, PathBuf::from("/srv/photos"));
        assert_eq!(config.default_threshold, 0.7);
        assert_eq!(config.collaborator_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.default_max_nodes, 100);
    }

    #[test]
    fn test_null_timeout_disables_deadline() {
        let config = EngineConfig::from_yaml_str("collaborator_timeout_ms: null\n").unwrap();
        assert!(config.collaborator_timeout().is_none());
        assert!(EngineConfig::from_yaml_str("log_level: warn\n").unwrap().collaborator_timeout().is_some());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(EngineConfig::from_yaml_str("  \n").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_invalid_yaml_values() {
        assert!(matches!(
            EngineConfig::from_yaml_str("default_threshold: 1.5"),
            Err(GraphError::InvalidThreshold(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("image_extensions: []"),
            Err(GraphError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("default_depth: [1, 2"),
            Err(GraphError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("simgraph.yaml");
        std::fs::write(&path, "build_threshold: 0.4\nparallel_pairs: false\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.build_threshold, 0.4);
        assert!(!config.parallel_pairs);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("IMAGES_DIR", "/data/img"),
            ("DEFAULT_THRESHOLD", " 0.65 "),
            ("LOG_LEVEL", "debug"),
        ]);
        let config = EngineConfig::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.images_dir, PathBuf::from("/data/img"));
        assert_eq!(config.default_threshold, 0.65);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.build_threshold, 0.35);
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let err = EngineConfig::default()
            .with_overrides_from(|k| (k == "BUILD_THRESHOLD").then(|| "high".to_string()))
            .unwrap_err();
        assert!(matches!(err, GraphError::Config(_)));
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
