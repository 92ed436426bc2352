use cache::CacheError;
use pipeline::PipelineError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoringError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Attribute store failure.
    #[error("attribute store error: {0}")]
    Store(String),
    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),
}

impl ScoringError {
    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        Self::Store(err.to_string())
    }
}
