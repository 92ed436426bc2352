//! Frametag: vision inference and scene attribute scoring for film frames.
//!
//! This crate stitches the workspace together so callers can analyze a frame
//! through a single entry point:
//!
//! - [`pipeline`] embeds images and scores text candidates (standard 512-d and
//!   enhanced 768-d variants behind one trait).
//! - [`cache`] keeps one current embedding per (frame, pipeline) with a
//!   versioned history, so deleting an embedding can revert to the previous one.
//! - [`scoring`] blends zero-shot text similarity with prototypes built from
//!   human-verified examples and persists one value per attribute.
//!
//! [`Analyzer`] owns all three plus a [`FrameSource`]. Single frames are
//! analyzed synchronously; batches run on a background [`JobRunner`] and report
//! progress through a [`JobTracker`].
//!
//! ```
//! use std::sync::Arc;
//! use frametag::{Analyzer, FrametagConfig, InMemoryFrameSource};
//!
//! let cfg = FrametagConfig::from_yaml("version: \"1.0\"\ncache:\n  backend: in_memory\n").unwrap();
//! let analyzer = Analyzer::from_config(&cfg, Arc::new(InMemoryFrameSource::new())).unwrap();
//! let ids: Vec<_> = analyzer.list_pipelines().into_iter().map(|p| p.descriptor.id).collect();
//! assert_eq!(ids, ["clip_vitb32", "openclip_vitl14"]);
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod frames;
pub mod jobs;
pub mod orchestrator;

mod serde_secs;

pub use cache::{
    BulkDeleteOutcome, CacheConfig, DeleteOutcome, EmbeddingCache, EmbeddingQuery,
    EmbeddingRecord, FrameId, NO_EMBEDDINGS_LEFT, Page,
};
pub use pipeline::{
    PipelineDescriptor, PipelineError, PipelineRegistry, PipelineStatus, PipelinesConfig,
    VisionPipeline, WarmupReport,
};
pub use scoring::{
    AttributeDebug, AttributeScorer, AttributeStore, AttributeVocabulary, BlendPolicy,
    CandidateDebug, InMemoryAttributeStore, SceneAttributeRecord, ScoringError, VerifiedFilter,
    VerifiedSummary,
};

pub use crate::config::{ConfigLoadError, FrametagConfig, LogFormat};
pub use crate::error::AnalysisError;
pub use crate::frames::{
    DirectoryFrameSource, FrameEntry, FrameFilter, FrameSource, FrameStatus, InMemoryFrameSource,
};
pub use crate::jobs::{
    BatchProcessor, BatchTask, FrameFailure, JobRecord, JobReporter, JobRunner, JobStatus,
    JobTracker, PARTIAL_FAILURE,
};
pub use crate::orchestrator::{
    AnalysisLog, Analyzer, AnalyzerBuilder, AttributeResult, BatchRequest, BatchSubmission,
    FrameAnalysis, PipelineInfo,
};
