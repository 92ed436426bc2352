use cache::{CacheError, FrameId};
use pipeline::PipelineError;
use scoring::ScoringError;
use thiserror::Error;

/// Every failure the analysis entry points can report.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Scoring(ScoringError),

    #[error("frame {0} not found")]
    FrameNotFound(FrameId),

    #[error("frame source error: {0}")]
    FrameSource(String),

    #[error("no frames matched the request")]
    NoFrames,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("job queue error: {0}")]
    JobQueue(String),

    /// The batch worker stopped before the job finished.
    #[error("batch worker stopped with {unprocessed} frame(s) unprocessed")]
    Interrupted { unprocessed: usize },
}

// Pipeline and cache failures keep their own variants however deep they surface.
impl From<ScoringError> for AnalysisError {
    fn from(err: ScoringError) -> Self {
        match err {
            ScoringError::Pipeline(e) => AnalysisError::Pipeline(e),
            ScoringError::Cache(e) => AnalysisError::Cache(e),
            other => AnalysisError::Scoring(other),
        }
    }
}

impl AnalysisError {
    pub fn frame_source<E: std::fmt::Display>(err: E) -> Self {
        Self::FrameSource(err.to_string())
    }

    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Pipeline(err) => match err {
                PipelineError::Unavailable { .. } => "pipeline_unavailable",
                PipelineError::InvalidImage(_) => "invalid_image",
                PipelineError::UnknownPipeline { .. } => "unknown_pipeline",
                PipelineError::DimensionMismatch { .. } => "dimension_mismatch",
                PipelineError::Inference(_) => "inference_failed",
            },
            AnalysisError::Cache(err) => match err {
                CacheError::Inconsistency { .. } => "cache_inconsistency",
                _ => "cache_unavailable",
            },
            AnalysisError::Scoring(err) => match err {
                ScoringError::UnknownAttribute(_) => "unknown_attribute",
                _ => "attribute_store",
            },
            AnalysisError::FrameNotFound(_) => "frame_not_found",
            AnalysisError::FrameSource(_) => "frame_source",
            AnalysisError::NoFrames => "no_frames",
            AnalysisError::InvalidRequest(_) => "invalid_request",
            AnalysisError::UnknownJob(_) => "unknown_job",
            AnalysisError::JobQueue(_) => "job_queue",
            AnalysisError::Interrupted { .. } => "interrupted",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::Pipeline(err) => err.is_retryable(),
            AnalysisError::Cache(CacheError::Backend(_)) => true,
            AnalysisError::JobQueue(_) | AnalysisError::Interrupted { .. } => true,
            _ => false,
        }
    }

    /// Errors that stop a whole batch rather than a single frame.
    pub(crate) fn aborts_batch(&self) -> bool {
        matches!(
            self,
            AnalysisError::Pipeline(PipelineError::Unavailable { .. })
                | AnalysisError::Interrupted { .. }
        )
    }
}
