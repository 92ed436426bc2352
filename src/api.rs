//! Request and response shapes for transports built on top of [`Analyzer`].
//!
//! Nothing here performs I/O. A transport deserializes a request, calls the
//! matching [`Analyzer`] method and serializes the response (or an
//! [`ErrorResponse`] built from the [`AnalysisError`]).
//!
//! [`Analyzer`]: crate::Analyzer

use std::collections::BTreeMap;

use cache::{DeleteOutcome, EmbeddingRecord, FrameId};
use chrono::{DateTime, Utc};
use pipeline::{WarmupOutcome, WarmupReport};
use scoring::AttributeDebug;
use serde::{Deserialize, Serialize};

use crate::AnalysisError;
use crate::jobs::{FrameFailure, JobRecord, JobStatus};
use crate::orchestrator::{AnalysisLog, AttributeResult, FrameAnalysis, PipelineInfo};

pub use crate::orchestrator::{BatchRequest, BatchSubmission as BatchResponse};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineListResponse {
    pub pipelines: Vec<PipelineInfo>,
    pub default_pipeline: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmupRequest {
    /// All registered pipelines when absent.
    #[serde(default)]
    pub pipeline_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupResponse {
    pub results: Vec<WarmupOutcome>,
    pub all_loaded: bool,
}

impl From<WarmupReport> for WarmupResponse {
    fn from(report: WarmupReport) -> Self {
        Self {
            all_loaded: report.all_loaded(),
            results: report.results,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub frame_id: FrameId,
    /// Default pipeline when absent.
    #[serde(default)]
    pub pipeline_id: Option<String>,
    /// Recompute even when a cached embedding exists.
    #[serde(default)]
    pub force: bool,
    /// Include the raw embedding in the response.
    #[serde(default)]
    pub include_embedding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub frame_id: FrameId,
    pub pipeline_id: String,
    pub embedding_dimension: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub attributes: Vec<AttributeResult>,
    pub debug_log: BTreeMap<String, AttributeDebug>,
    pub cached: bool,
    pub analysis_log: AnalysisLog,
}

impl AnalyzeResponse {
    pub fn new(analysis: FrameAnalysis, include_embedding: bool) -> Self {
        Self {
            frame_id: analysis.frame_id,
            pipeline_id: analysis.pipeline_id,
            embedding_dimension: analysis.embedding_dimension,
            embedding: include_embedding.then_some(analysis.embedding),
            attributes: analysis.attributes,
            debug_log: analysis.debug_log,
            cached: analysis.cached,
            analysis_log: analysis.analysis_log,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub processed: usize,
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failures: Vec<FrameFailure>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            processed: job.processed,
            total: job.total,
            error: job.error,
            failures: job.failures,
            submitted_at: job.submitted_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteEmbeddingResponse {
    pub frame_id: FrameId,
    pub pipeline_id: String,
    pub deleted: bool,
    /// An archived embedding became current.
    pub reverted: bool,
    /// Model version of the embedding that became current, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverted_to: Option<String>,
    pub remaining_embeddings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl From<DeleteOutcome> for DeleteEmbeddingResponse {
    fn from(outcome: DeleteOutcome) -> Self {
        let reverted = outcome.reverted();
        Self {
            frame_id: outcome.frame_id,
            pipeline_id: outcome.pipeline_id,
            deleted: outcome.deleted,
            reverted,
            reverted_to: outcome
                .reverted_to
                .map(|record: EmbeddingRecord| record.model_version),
            remaining_embeddings: outcome.total_remaining,
            warning: outcome.warning,
        }
    }
}

/// Error body for failed requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&AnalysisError> for ErrorResponse {
    fn from(err: &AnalysisError) -> Self {
        Self {
            error: ErrorDetail {
                code: err.kind().to_string(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn job_status_serializes_lowercase_status() {
        let job = JobRecord {
            id: "job-1".into(),
            pipeline_id: "clip_vitb32".into(),
            status: JobStatus::Done,
            processed: 3,
            total: Some(3),
            error: None,
            failures: Vec::new(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let json = serde_json::to_value(JobStatusResponse::from(job)).unwrap();
        assert_eq!(json["status"], "done");
        assert_eq!(json["processed"], 3);
        assert!(json.get("error").is_none());
        assert!(json.get("failures").is_none());
    }

    #[test]
    fn error_response_carries_kind() {
        let body = ErrorResponse::from(&AnalysisError::FrameNotFound(7));
        assert_eq!(body.error.code, "frame_not_found");
        assert_eq!(body.error.message, "frame 7 not found");
        assert!(!body.error.retryable);
    }

    #[test]
    fn analyze_request_defaults() {
        let req: AnalyzeRequest = serde_json::from_str(r#"{"frame_id": 12}"#).unwrap();
        assert_eq!(req.frame_id, 12);
        assert!(req.pipeline_id.is_none());
        assert!(!req.force && !req.include_embedding);
    }

    #[test]
    fn delete_response_reports_warning() {
        let outcome = DeleteOutcome {
            frame_id: 4,
            pipeline_id: "clip_vitb32".into(),
            deleted: true,
            reverted_to: None,
            remaining_for_pipeline: 0,
            total_remaining: 0,
            warning: Some(cache::NO_EMBEDDINGS_LEFT.to_string()),
        };
        let response = DeleteEmbeddingResponse::from(outcome);
        assert!(response.deleted);
        assert!(!response.reverted);
        assert_eq!(response.remaining_embeddings, 0);
        assert!(response.warning.is_some());
    }
}
