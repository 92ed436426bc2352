use crate::clip::{ClipBackbone, ClipIdentity};
use crate::config::PipelineConfig;
use crate::{
    CandidatePrompt, CandidateSimilarity, ImageEmbedding, PipelineDescriptor, PipelineError,
    PipelineStatus, ScoreInput, VisionPipeline,
};

const IDENTITY: ClipIdentity = ClipIdentity {
    id: "clip_vitb32",
    name: "CLIP ViT-B/32 (Standard)",
    model_id: "ViT-B-32",
    input_resolution: 224,
    embedding_dimension: 512,
};

/// General-purpose 512-d pipeline. Images are embedded one at a time.
pub struct StandardPipeline {
    backbone: ClipBackbone,
}

impl StandardPipeline {
    pub const ID: &'static str = IDENTITY.id;

    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            backbone: ClipBackbone::new(IDENTITY, cfg),
        }
    }
}

impl Default for StandardPipeline {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl VisionPipeline for StandardPipeline {
    fn descriptor(&self) -> PipelineDescriptor {
        self.backbone.descriptor()
    }

    fn embed_image(&self, image: &[u8]) -> Result<ImageEmbedding, PipelineError> {
        self.backbone.embed_image(image)
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

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_fn(300, 200, |x, y| {
            if (x / 20 + y / 20) % 2 == 0 {
                Rgb(color)
            } else {
                Rgb([255 - color[0], 255 - color[1], 255 - color[2]])
            }
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn descriptor_is_available_before_load() {
        let pipeline = StandardPipeline::default();
        let desc = pipeline.descriptor();
        assert_eq!(desc.id, "clip_vitb32");
        assert_eq!(desc.name, "CLIP ViT-B/32 (Standard)");
        assert_eq!(desc.embedding_dimension, 512);
        assert_eq!(desc.input_resolution, 224);
        assert!(!desc.loaded);
        assert!(desc.version.is_none());
    }

    #[test]
    fn embedding_is_unit_length_and_deterministic() {
        let pipeline = StandardPipeline::default();
        let bytes = png([200, 120, 40]);
        let a = pipeline.embed_image(&bytes).unwrap();
        let b = pipeline.embed_image(&bytes).unwrap();
        assert_eq!(a.dimension, 512);
        assert_eq!(a.vector.len(), 512);
        assert_eq!(a, b);
        let norm: f32 = a.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(pipeline.descriptor().loaded);
        assert_eq!(pipeline.descriptor().version.as_deref(), Some(a.model_version.as_str()));
    }

    #[test]
    fn invalid_image_leaves_pipeline_usable() {
        let pipeline = StandardPipeline::default();
        let err = pipeline.embed_image(b"not an image").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidImage(_)));
        assert!(pipeline.embed_image(&png([0, 0, 0])).is_ok());
    }

    #[test]
    fn missing_weights_report_unavailable_and_status_error() {
        let pipeline = StandardPipeline::new(&PipelineConfig {
            weights_path: Some("./missing/vitb32.f32".into()),
            ..Default::default()
        });
        let err = pipeline.embed_image(&png([1, 2, 3])).unwrap_err();
        assert!(err.is_retryable());
        let status = pipeline.status();
        assert!(!status.loaded);
        assert!(status.error.is_some());
        assert!(!pipeline.descriptor().loaded);
    }

    #[test]
    fn image_and_embedding_inputs_score_identically() {
        let pipeline = StandardPipeline::default();
        let bytes = png([30, 60, 200]);
        let embedding = pipeline.embed_image(&bytes).unwrap();
        let candidates = [
            CandidatePrompt::new("day", "a photo taken during the day"),
            CandidatePrompt::new("night", "a photo taken at night"),
        ];
        let from_image = pipeline
            .score_text_candidates(ScoreInput::Image(&bytes), &candidates)
            .unwrap();
        let from_embedding = pipeline
            .score_text_candidates(ScoreInput::Embedding(&embedding.vector), &candidates)
            .unwrap();
        assert_eq!(from_image, from_embedding);
    }

    #[test]
    fn default_batch_matches_single_calls() {
        let pipeline = StandardPipeline::default();
        let a = png([10, 10, 10]);
        let b = png([240, 240, 240]);
        let batch = pipeline
            .embed_images_batch(&[a.as_slice(), &b"junk"[..], b.as_slice()], 2)
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].as_ref().unwrap(), &pipeline.embed_image(&a).unwrap());
        assert!(batch[1].is_err());
        assert_eq!(batch[2].as_ref().unwrap(), &pipeline.embed_image(&b).unwrap());
    }
}
