//! YAML configuration for frametag.
//!
//! One file configures the pipelines, the embedding cache, attribute scoring
//! and the batch worker. Every section is optional and falls back to its
//! defaults.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! default_pipeline: clip_vitb32
//!
//! pipelines:
//!   standard:
//!     weights_path: ./models/vitb32.f32
//!   enhanced:
//!     batch_size: 8
//!
//! cache:
//!   backend: redb
//!   path: ./data/frametag.redb
//!   compression: zstd
//!   compression_level: 3
//!   history_depth: 16
//!
//! scoring:
//!   clip_weight: 0.6
//!   attributes: [time_of_day, lighting]
//!
//! jobs:
//!   queue_capacity: 64
//!   chunk_size: 4
//!   max_finished_jobs: 1000
//!
//! logging:
//!   format: json
//! ```
//!
//! ## Environment overrides
//!
//! `FRAMETAG_CACHE_PATH`, `FRAMETAG_LOG_FORMAT` and `FRAMETAG_CLIP_WEIGHT` win
//! over the file. The same keys may also be listed under `env_overrides`, in
//! which case the process environment still takes precedence.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use cache::{BackendConfig, CacheConfig, CompressionCodec, CompressionConfig};
use pipeline::PipelinesConfig;
use scoring::{AttributeVocabulary, BlendPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_CACHE_PATH: &str = "FRAMETAG_CACHE_PATH";
pub const ENV_LOG_FORMAT: &str = "FRAMETAG_LOG_FORMAT";
pub const ENV_CLIP_WEIGHT: &str = "FRAMETAG_CLIP_WEIGHT";

/// Largest `limit` a batch request may ask for.
pub const MAX_BATCH_LIMIT: usize = 5000;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),

    #[error("missing required field: {0}")]
    MissingField(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FrametagConfig {
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Pipeline used when a request names none.
    #[serde(default = "default_pipeline")]
    pub default_pipeline: String,

    #[serde(default)]
    pub pipelines: PipelinesConfig,

    #[serde(default)]
    pub cache: CacheYamlConfig,

    #[serde(default)]
    pub scoring: ScoringYamlConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
}

impl FrametagConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: FrametagConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` when given, otherwise starts from defaults, then applies
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `env_overrides` from the file, then whatever `lookup` returns.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in [ENV_CACHE_PATH, ENV_LOG_FORMAT, ENV_CLIP_WEIGHT] {
            let value = lookup(key).or_else(|| self.env_overrides.get(key).cloned());
            let Some(value) = value else {
                continue;
            };
            match key {
                ENV_CACHE_PATH => {
                    self.cache.backend = CacheBackendKind::Redb;
                    self.cache.path = Some(value);
                }
                ENV_LOG_FORMAT => {
                    self.logging.format = match value.to_ascii_lowercase().as_str() {
                        "json" => LogFormat::Json,
                        "text" => LogFormat::Text,
                        other => {
                            return Err(ConfigLoadError::Validation(format!(
                                "{ENV_LOG_FORMAT} must be 'json' or 'text', got '{other}'"
                            )));
                        }
                    };
                }
                _ => {
                    self.scoring.clip_weight = value.trim().parse().map_err(|_| {
                        ConfigLoadError::Validation(format!(
                            "{ENV_CLIP_WEIGHT} must be a number, got '{value}'"
                        ))
                    })?;
                }
            }
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        if self.default_pipeline.trim().is_empty() {
            return Err(ConfigLoadError::MissingField("default_pipeline".into()));
        }
        self.pipelines
            .validate()
            .map_err(ConfigLoadError::Validation)?;
        self.cache.validate()?;
        self.scoring.validate()?;
        self.jobs.validate()?;
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache.to_cache_config()
    }

    pub fn blend_policy(&self) -> BlendPolicy {
        BlendPolicy::new(self.scoring.clip_weight)
    }

    /// The default vocabulary, restricted when `scoring.attributes` is set.
    pub fn vocabulary(&self) -> AttributeVocabulary {
        let vocabulary = AttributeVocabulary::default();
        if self.scoring.attributes.is_empty() {
            vocabulary
        } else {
            vocabulary.restricted_to(&self.scoring.attributes)
        }
    }
}

impl Default for FrametagConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            default_pipeline: default_pipeline(),
            pipelines: PipelinesConfig::default(),
            cache: CacheYamlConfig::default(),
            scoring: ScoringYamlConfig::default(),
            jobs: JobsConfig::default(),
            logging: LoggingConfig::default(),
            env_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    InMemory,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheYamlConfig {
    #[serde(default = "default_backend")]
    pub backend: CacheBackendKind,

    /// Database file, required for `redb`.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_compression")]
    pub compression: String,

    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Versions kept per (frame, pipeline). Unbounded when absent.
    #[serde(default)]
    pub history_depth: Option<usize>,
}

impl CacheYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.backend == CacheBackendKind::Redb && self.path.is_none() {
            return Err(ConfigLoadError::Validation(
                "cache.path is required when backend is 'redb'".to_string(),
            ));
        }
        let valid_compression = ["zstd", "none"];
        if !valid_compression.contains(&self.compression.as_str()) {
            return Err(ConfigLoadError::Validation(format!(
                "cache.compression must be one of: {valid_compression:?}"
            )));
        }
        if !(1..=22).contains(&self.compression_level) && self.compression == "zstd" {
            return Err(ConfigLoadError::Validation(
                "cache.compression_level must be between 1 and 22".to_string(),
            ));
        }
        if self.history_depth == Some(0) {
            return Err(ConfigLoadError::Validation(
                "cache.history_depth must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    fn to_cache_config(&self) -> CacheConfig {
        let backend = match (&self.backend, &self.path) {
            (CacheBackendKind::Redb, Some(path)) => BackendConfig::redb(path.clone()),
            _ => BackendConfig::in_memory(),
        };
        let compression = match self.compression.as_str() {
            "none" => CompressionConfig::none(),
            _ => CompressionConfig::new(CompressionCodec::Zstd, self.compression_level),
        };
        CacheConfig::new()
            .with_backend(backend)
            .with_compression(compression)
            .with_history_depth(self.history_depth)
    }
}

impl Default for CacheYamlConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            compression: default_compression(),
            compression_level: default_compression_level(),
            history_depth: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringYamlConfig {
    #[serde(default = "default_clip_weight")]
    pub clip_weight: f32,

    /// Attributes to score. Empty means the whole vocabulary.
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl ScoringYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        BlendPolicy::new(self.clip_weight)
            .validate()
            .map_err(|e| ConfigLoadError::Validation(format!("scoring.{e}")))?;
        let known = AttributeVocabulary::default();
        if let Some(unknown) = self.attributes.iter().find(|a| known.get(a).is_none()) {
            return Err(ConfigLoadError::Validation(format!(
                "scoring.attributes: unknown attribute '{unknown}'"
            )));
        }
        Ok(())
    }
}

impl Default for ScoringYamlConfig {
    fn default() -> Self {
        Self {
            clip_weight: default_clip_weight(),
            attributes: Vec::new(),
        }
    }
}

/// Batch worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Jobs waiting for the worker before submission is refused.
    pub queue_capacity: usize,
    /// Frames embedded together in one `embed_images_batch` call.
    pub chunk_size: usize,
    /// `limit` applied when a batch request omits it.
    pub default_limit: usize,
    /// Done or failed jobs kept for status queries. Older ones are dropped.
    pub max_finished_jobs: usize,
}

impl JobsConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.queue_capacity == 0 {
            return Err(ConfigLoadError::Validation(
                "jobs.queue_capacity must be >= 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigLoadError::Validation(
                "jobs.chunk_size must be >= 1".to_string(),
            ));
        }
        if !(1..=MAX_BATCH_LIMIT).contains(&self.default_limit) {
            return Err(ConfigLoadError::Validation(format!(
                "jobs.default_limit must be between 1 and {MAX_BATCH_LIMIT}"
            )));
        }
        Ok(())
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            chunk_size: 4,
            default_limit: 500,
            max_finished_jobs: crate::jobs::DEFAULT_MAX_FINISHED_JOBS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

// Helper functions for serde defaults
fn default_pipeline() -> String {
    "clip_vitb32".to_string()
}
fn default_backend() -> CacheBackendKind {
    CacheBackendKind::InMemory
}
fn default_compression() -> String {
    "zstd".to_string()
}
fn default_compression_level() -> i32 {
    3
}
fn default_clip_weight() -> f32 {
    scoring::DEFAULT_CLIP_WEIGHT
}
fn default_log_level() -> String {
    "info".to_string()
}
