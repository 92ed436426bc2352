use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime knobs for a single pipeline.
///
/// Missing fields fall back to [`PipelineConfig::default`], so a YAML section can
/// be as small as `weights_path: ./models/vitb32.f32`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Raw little-endian `f32` projection weights. When absent the weights are
    /// derived from the model id.
    pub weights_path: Option<PathBuf>,
    /// Requested compute device. Anything other than `"cpu"` falls back to CPU.
    pub device: String,
    /// Images per chunk for batched inference.
    pub batch_size: usize,
    /// Number of prompt embeddings kept in the per-pipeline LRU.
    pub text_cache_capacity: usize,
    /// Side length of the patch grid used for image features.
    pub patch_grid: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights_path: None,
            device: "cpu".into(),
            batch_size: 4,
            text_cache_capacity: 256,
            patch_grid: 7,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".into());
        }
        if self.text_cache_capacity == 0 {
            return Err("text_cache_capacity must be at least 1".into());
        }
        if self.patch_grid == 0 || self.patch_grid > 32 {
            return Err(format!(
                "patch_grid must be between 1 and 32, got {}",
                self.patch_grid
            ));
        }
        if self.device.trim().is_empty() {
            return Err("device must not be empty".into());
        }
        Ok(())
    }
}

/// Configuration for the two built-in pipelines.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelinesConfig {
    pub standard: PipelineConfig,
    pub enhanced: PipelineConfig,
}

impl PipelinesConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.standard
            .validate()
            .map_err(|e| format!("pipelines.standard: {e}"))?;
        self.enhanced
            .validate()
            .map_err(|e| format!("pipelines.enhanced: {e}"))
    }
}
