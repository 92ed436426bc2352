use rayon::prelude::*;
use tracing::debug;

use crate::clip::{ClipBackbone, ClipIdentity};
use crate::config::PipelineConfig;
use crate::{
    CandidatePrompt, CandidateSimilarity, ImageEmbedding, PipelineDescriptor, PipelineError,
    PipelineStatus, ScoreInput, VisionPipeline,
};

const IDENTITY: ClipIdentity = ClipIdentity {
    id: "openclip_vitl14",
    name: "OpenCLIP ViT-L/14 (Enhanced)",
    model_id: "ViT-L-14",
    input_resolution: 224,
    embedding_dimension: 768,
};

/// Higher capacity 768-d pipeline with chunked batch inference.
///
/// Each chunk is preprocessed and projected in parallel on the rayon pool. Results
/// are identical to calling [`VisionPipeline::embed_image`] per image.
pub struct EnhancedPipeline {
    backbone: ClipBackbone,
    batch_size: usize,
}

impl EnhancedPipeline {
    pub const ID: &'static str = IDENTITY.id;

    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            backbone: ClipBackbone::new(IDENTITY, cfg),
            batch_size: cfg.batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Default for EnhancedPipeline {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl VisionPipeline for EnhancedPipeline {
    fn descriptor(&self) -> PipelineDescriptor {
        self.backbone.descriptor()
    }

    fn embed_image(&self, image: &[u8]) -> Result<ImageEmbedding, PipelineError> {
        self.backbone.embed_image(image)
    }

    fn embed_images_batch(
        &self,
        images: &[&[u8]],
        batch_size: usize,
    ) -> Result<Vec<Result<ImageEmbedding, PipelineError>>, PipelineError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.backbone.model()?;
        let chunk = if batch_size == 0 {
            self.batch_size
        } else {
            batch_size
        };
        let mut results = Vec::with_capacity(images.len());
        for (idx, group) in images.chunks(chunk).enumerate() {
            debug!(pipeline = IDENTITY.id, chunk = idx, size = group.len(), "embedding chunk");
            let embedded: Vec<_> = group
                .par_iter()
                .map(|bytes| self.backbone.embed_with(&model, bytes))
                .collect();
            results.extend(embedded);
        }
        Ok(results)
    }

    fn score_text_candidates(
        &self,
        input: ScoreInput<'_>,
        candidates: &[CandidatePrompt],
    ) -> Result<Vec<CandidateSimilarity>, PipelineError> {
        self.backbone.score_text_candidates(input, candidates)
    }

    fn status(&self) -> PipelineStatus {
        self.backbone.status()
    }

    fn warmup(&self) -> Result<(), PipelineError> {
        self.backbone.warmup()
    }
}
