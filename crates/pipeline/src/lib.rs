//! Frametag vision pipelines
//!
//! A pipeline turns image bytes into a fixed-length, L2-normalized embedding and
//! scores natural-language candidate labels against an image or a precomputed
//! embedding. Two variants ship with the crate:
//!
//! - **Standard** (`clip_vitb32`) - 512-d, one image at a time.
//! - **Enhanced** (`openclip_vitl14`) - 768-d, chunked batch inference.
//!
//! Models load lazily. The first inference (or an explicit [`VisionPipeline::warmup`])
//! acquires the weights; a failed load is reported as
//! [`PipelineError::Unavailable`] and retried on the next call.
//!
//! Pipelines are looked up through a [`PipelineRegistry`], which the application
//! builds once and passes around. There is no global instance.
//!
//! ```
//! use pipeline::{PipelineRegistry, PipelinesConfig};
//!
//! let registry = PipelineRegistry::with_defaults(&PipelinesConfig::default());
//! let ids: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();
//! assert_eq!(ids, ["clip_vitb32", "openclip_vitl14"]);
//! ```

pub mod config;
pub mod error;
pub mod lazy;
pub mod normalize;
pub mod preprocess;
pub mod projection;
pub mod registry;
pub mod types;

mod clip;
mod enhanced;
mod standard;

pub use crate::config::{PipelineConfig, PipelinesConfig};
pub use crate::enhanced::EnhancedPipeline;
pub use crate::error::PipelineError;
pub use crate::normalize::{cosine, l2_normalize_in_place};
pub use crate::registry::{PipelineRegistry, WarmupOutcome, WarmupReport};
pub use crate::standard::StandardPipeline;
pub use crate::types::{
    CandidatePrompt, CandidateSimilarity, ImageEmbedding, PipelineDescriptor, PipelineStatus,
    ScoreInput,
};

/// An image embedding model plus zero-shot text scoring in the same space.
///
/// Implementations must be safe to share across threads; the registry hands out
/// `Arc<dyn VisionPipeline>`.
pub trait VisionPipeline: Send + Sync {
    /// Static identity plus the current `loaded` flag. Never blocks on a load.
    fn descriptor(&self) -> PipelineDescriptor;

    /// Embeds one encoded image.
    fn embed_image(&self, image: &[u8]) -> Result<ImageEmbedding, PipelineError>;

    /// Embeds several images. Per-image failures are returned in place; the outer
    /// error is reserved for a pipeline that cannot run at all.
    fn embed_images_batch(
        &self,
        images: &[&[u8]],
        _batch_size: usize,
    ) -> Result<Vec<Result<ImageEmbedding, PipelineError>>, PipelineError> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            match self.embed_image(image) {
                Err(err @ PipelineError::Unavailable { .. }) => return Err(err),
                other => results.push(other),
            }
        }
        Ok(results)
    }

    /// Cosine similarity between the input and each candidate prompt, in input order.
    fn score_text_candidates(
        &self,
        input: ScoreInput<'_>,
        candidates: &[CandidatePrompt],
    ) -> Result<Vec<CandidateSimilarity>, PipelineError>;

    fn status(&self) -> PipelineStatus;

    /// Forces the model load.
    fn warmup(&self) -> Result<(), PipelineError>;
}
