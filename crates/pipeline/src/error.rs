use thiserror::Error;

/// Errors surfaced by vision pipelines and the pipeline registry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Model weights could not be acquired (missing file, unsupported device, ...).
    /// Retrying is allowed once the underlying cause is fixed.
    #[error("pipeline '{pipeline_id}' unavailable: {reason}")]
    Unavailable { pipeline_id: String, reason: String },
    /// The input bytes could not be decoded or resized to the pipeline resolution.
    #[error("invalid image: {0}")]
    InvalidImage(String),
    /// The caller asked for a pipeline id that was never registered.
    #[error("unknown pipeline '{requested}' (available: {available:?})")]
    UnknownPipeline {
        requested: String,
        available: Vec<String>,
    },
    /// A precomputed embedding does not match the pipeline's declared dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// Forward pass or projection failure.
    #[error("inference failure: {0}")]
    Inference(String),
}

impl PipelineError {
    pub fn unavailable<I, R>(pipeline_id: I, reason: R) -> Self
    where
        I: Into<String>,
        R: ToString,
    {
        Self::Unavailable {
            pipeline_id: pipeline_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_image<E: ToString>(err: E) -> Self {
        Self::InvalidImage(err.to_string())
    }

    /// True for failures that may succeed on a later attempt without changing the input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_mentions_pipeline_and_reason() {
        let err = PipelineError::unavailable("clip_vitb32", "weights missing");
        let msg = err.to_string();
        assert!(msg.contains("clip_vitb32"));
        assert!(msg.contains("weights missing"));
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_pipeline_lists_available_ids() {
        let err = PipelineError::UnknownPipeline {
            requested: "resnet".into(),
            available: vec!["clip_vitb32".into(), "openclip_vitl14".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("resnet"));
        assert!(msg.contains("openclip_vitl14"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn invalid_image_is_not_retryable() {
        assert!(!PipelineError::invalid_image("truncated png").is_retryable());
    }
}
