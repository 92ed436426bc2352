//! Shared CLIP machinery composed into the concrete pipelines.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::lazy::LazyModel;
use crate::normalize::cosine;
use crate::preprocess::preprocess;
use crate::projection::{ProjectionModel, ProjectionSpec};
use crate::{
    CandidatePrompt, CandidateSimilarity, ImageEmbedding, PipelineDescriptor, PipelineError,
    PipelineStatus, ScoreInput,
};

/// Fixed identity of a pipeline variant.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClipIdentity {
    pub id: &'static str,
    pub name: &'static str,
    pub model_id: &'static str,
    pub input_resolution: u32,
    pub embedding_dimension: usize,
}

pub(crate) struct ClipBackbone {
    identity: ClipIdentity,
    device: String,
    spec: ProjectionSpec,
    model: LazyModel<ProjectionModel>,
    text_cache: Mutex<LruCache<String, Arc<Vec<f32>>>>,
}

impl ClipBackbone {
    pub fn new(identity: ClipIdentity, cfg: &PipelineConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.text_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            identity,
            device: resolve_device(identity.id, &cfg.device),
            spec: ProjectionSpec {
                pipeline_id: identity.id.to_string(),
                model_id: identity.model_id.to_string(),
                dimension: identity.embedding_dimension,
                patch_grid: cfg.patch_grid,
                weights_path: cfg.weights_path.clone(),
            },
            model: LazyModel::new(identity.id),
            text_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn model(&self) -> Result<Arc<ProjectionModel>, PipelineError> {
        self.model.get_or_load(|| ProjectionModel::load(&self.spec))
    }

    pub fn descriptor(&self) -> PipelineDescriptor {
        let resident = self.model.get();
        PipelineDescriptor {
            id: self.identity.id.to_string(),
            name: self.identity.name.to_string(),
            model_id: self.identity.model_id.to_string(),
            input_resolution: self.identity.input_resolution,
            embedding_dimension: self.identity.embedding_dimension,
            device: self.device.clone(),
            numeric_dtype: "float32".to_string(),
            version: resident.as_ref().map(|m| m.version().to_string()),
            loaded: resident.is_some(),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let snap = self.model.snapshot();
        PipelineStatus {
            loaded: snap.loaded,
            device: self.device.clone(),
            error: snap.last_error,
            last_loaded_at: snap.loaded_at,
        }
    }

    pub fn warmup(&self) -> Result<(), PipelineError> {
        self.model().map(|_| ())
    }

    /// Embeds one image with an already resident model.
    pub fn embed_with(
        &self,
        model: &ProjectionModel,
        bytes: &[u8],
    ) -> Result<ImageEmbedding, PipelineError> {
        let tensor = preprocess(bytes, self.identity.input_resolution)?;
        let vector = model.embed_tensor(&tensor)?;
        Ok(ImageEmbedding {
            dimension: vector.len(),
            vector,
            model_version: model.version().to_string(),
        })
    }

    pub fn embed_image(&self, bytes: &[u8]) -> Result<ImageEmbedding, PipelineError> {
        let model = self.model()?;
        self.embed_with(&model, bytes)
    }

    pub fn score_text_candidates(
        &self,
        input: ScoreInput<'_>,
        candidates: &[CandidatePrompt],
    ) -> Result<Vec<CandidateSimilarity>, PipelineError> {
        let model = self.model()?;
        let owned;
        let image: &[f32] = match input {
            ScoreInput::Image(bytes) => {
                owned = self.embed_with(&model, bytes)?.vector;
                &owned
            }
            ScoreInput::Embedding(vector) => {
                if vector.len() != self.identity.embedding_dimension {
                    return Err(PipelineError::DimensionMismatch {
                        expected: self.identity.embedding_dimension,
                        actual: vector.len(),
                    });
                }
                vector
            }
        };

        Ok(candidates
            .iter()
            .map(|candidate| CandidateSimilarity {
                label: candidate.label.clone(),
                similarity: self
                    .text_embedding(&model, &candidate.prompt)
                    .map(|text| cosine(image, &text)),
            })
            .collect())
    }

    fn text_embedding(
        &self,
        model: &ProjectionModel,
        prompt: &str,
    ) -> Result<Arc<Vec<f32>>, String> {
        if let Some(hit) = self.lock_text_cache().get(prompt) {
            return Ok(Arc::clone(hit));
        }
        let vector = Arc::new(model.embed_text(prompt)?);
        self.lock_text_cache()
            .put(prompt.to_string(), Arc::clone(&vector));
        debug!(pipeline = self.identity.id, prompt, "cached text embedding");
        Ok(vector)
    }

    fn lock_text_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<Vec<f32>>>> {
        self.text_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn resolve_device(pipeline_id: &str, requested: &str) -> String {
    if requested.eq_ignore_ascii_case("cpu") {
        return "cpu".to_string();
    }
    warn!(
        pipeline = pipeline_id,
        requested, "requested device not available, falling back to cpu"
    );
    "cpu".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ClipIdentity {
        ClipIdentity {
            id: "test_clip",
            name: "Test CLIP",
            model_id: "Test-32",
            input_resolution: 32,
            embedding_dimension: 24,
        }
    }

    #[test]
    fn unknown_device_falls_back_to_cpu() {
        let cfg = PipelineConfig {
            device: "cuda:0".into(),
            ..Default::default()
        };
        let backbone = ClipBackbone::new(identity(), &cfg);
        assert_eq!(backbone.descriptor().device, "cpu");
    }

    #[test]
    fn embedding_input_must_match_dimension() {
        let backbone = ClipBackbone::new(identity(), &PipelineConfig::default());
        let err = backbone
            .score_text_candidates(
                ScoreInput::Embedding(&[0.1; 8]),
                &[CandidatePrompt::new("day", "daytime")],
            )
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::DimensionMismatch {
                expected: 24,
                actual: 8
            }
        );
    }

    #[test]
    fn bad_prompt_is_reported_per_candidate() {
        let backbone = ClipBackbone::new(identity(), &PipelineConfig::default());
        let query = vec![0.2f32; 24];
        let scores = backbone
            .score_text_candidates(
                ScoreInput::Embedding(&query),
                &[
                    CandidatePrompt::new("day", "a photo taken during the day"),
                    CandidatePrompt::new("empty", ""),
                ],
            )
            .unwrap();
        assert_eq!(scores.len(), 2);
        let day = scores[0].similarity.as_ref().unwrap();
        assert!((-1.0..=1.0).contains(day));
        assert!(scores[1].similarity.is_err());
    }

    #[test]
    fn repeated_prompts_hit_the_text_cache() {
        let backbone = ClipBackbone::new(identity(), &PipelineConfig::default());
        let model = backbone.model().unwrap();
        let a = backbone.text_embedding(&model, "city street").unwrap();
        let b = backbone.text_embedding(&model, "city street").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
