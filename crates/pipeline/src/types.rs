use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and runtime state of one registered pipeline.
///
/// Everything except `loaded` is fixed at registration time. `loaded` flips to
/// `true` on the first successful inference or warm-up and stays there for the
/// life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    /// Stable registry key, e.g. `"clip_vitb32"`.
    pub id: String,
    /// Human readable name shown to operators.
    pub name: String,
    /// Upstream model architecture identifier, e.g. `"ViT-B-32"`.
    pub model_id: String,
    /// Square input resolution in pixels.
    pub input_resolution: u32,
    /// Length of every embedding this pipeline produces.
    pub embedding_dimension: usize,
    /// Device the model runs on once loaded.
    pub device: String,
    /// Element type of the stored vectors.
    pub numeric_dtype: String,
    /// Model version string, known once weights are resident.
    pub version: Option<String>,
    pub loaded: bool,
}

/// Non-blocking snapshot of a pipeline's load state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub loaded: bool,
    pub device: String,
    /// Message of the most recent failed load, cleared by a successful one.
    pub error: Option<String>,
    pub last_loaded_at: Option<DateTime<Utc>>,
}

/// Output of [`crate::VisionPipeline::embed_image`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEmbedding {
    /// L2-normalized vector.
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub model_version: String,
}

/// What to score text candidates against.
#[derive(Debug, Clone, Copy)]
pub enum ScoreInput<'a> {
    /// Raw encoded image bytes; the pipeline embeds them first.
    Image(&'a [u8]),
    /// A precomputed embedding under the same pipeline.
    Embedding(&'a [f32]),
}

/// A candidate label and the natural-language prompt its text embedding is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePrompt {
    pub label: String,
    pub prompt: String,
}

impl CandidatePrompt {
    pub fn new(label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            prompt: prompt.into(),
        }
    }
}

/// Zero-shot similarity of one candidate.
///
/// A malformed candidate carries its own error instead of failing the whole call,
/// so callers can log it and keep ranking the remaining labels.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSimilarity {
    pub label: String,
    /// Cosine similarity in `[-1, 1]`, or why this candidate could not be scored.
    pub similarity: Result<f32, String>,
}
