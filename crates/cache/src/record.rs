use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frame identifier as assigned by the frame store.
pub type FrameId = i64;

/// The current embedding of one (frame, pipeline) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub frame_id: FrameId,
    pub pipeline_id: String,
    pub embedding: Vec<f32>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// One archived write in a pair's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVersion {
    /// Process-wide monotonic write sequence. Higher is newer.
    pub seq: u64,
    pub embedding: Vec<f32>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// What is stored under a current-value key: the record plus the history
/// version it was promoted from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CurrentEntry {
    pub seq: u64,
    pub record: EmbeddingRecord,
}

/// Result of deleting the current embedding of a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub frame_id: FrameId,
    pub pipeline_id: String,
    pub deleted: bool,
    /// The archived value that became current, if any.
    pub reverted_to: Option<EmbeddingRecord>,
    /// Surviving history versions for this pipeline after the delete.
    pub remaining_for_pipeline: usize,
    /// Current embeddings of the frame across all pipelines after the delete.
    pub total_remaining: usize,
    pub warning: Option<String>,
}

impl DeleteOutcome {
    pub fn reverted(&self) -> bool {
        self.reverted_to.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDeleteOutcome {
    pub frame_id: FrameId,
    pub deleted_count: usize,
    pub warning: Option<String>,
}

/// Filter and pagination for [`crate::EmbeddingCache::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingQuery {
    pub frame_id: Option<FrameId>,
    pub pipeline_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for EmbeddingQuery {
    fn default() -> Self {
        Self {
            frame_id: None,
            pipeline_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl EmbeddingQuery {
    pub fn for_frame(frame_id: FrameId) -> Self {
        Self {
            frame_id: Some(frame_id),
            ..Self::default()
        }
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

pub(crate) fn current_key(frame_id: FrameId, pipeline_id: &str) -> String {
    format!("cur/{frame_id}/{pipeline_id}")
}

pub(crate) fn current_prefix(frame_id: Option<FrameId>) -> String {
    match frame_id {
        Some(id) => format!("cur/{id}/"),
        None => "cur/".to_string(),
    }
}

pub(crate) fn version_prefix(frame_id: FrameId, pipeline_id: &str) -> String {
    format!("ver/{frame_id}/{pipeline_id}/")
}

pub(crate) fn frame_version_prefix(frame_id: FrameId) -> String {
    format!("ver/{frame_id}/")
}

pub(crate) fn version_key(frame_id: FrameId, pipeline_id: &str, seq: u64) -> String {
    format!("ver/{frame_id}/{pipeline_id}/{seq:020}")
}

/// Sequence number encoded at the end of a version key.
pub(crate) fn seq_from_version_key(key: &str) -> Option<u64> {
    key.rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_keys_sort_by_sequence() {
        let a = version_key(3, "clip_vitb32", 9);
        let b = version_key(3, "clip_vitb32", 10);
        assert!(a < b);
        assert!(a.starts_with(&version_prefix(3, "clip_vitb32")));
        assert_eq!(seq_from_version_key(&b), Some(10));
    }

    #[test]
    fn frame_prefixes_do_not_overlap() {
        assert!(!current_key(12, "p").starts_with(&current_prefix(Some(1))));
        assert!(current_key(1, "p").starts_with(&current_prefix(Some(1))));
        assert!(!version_key(12, "p", 1).starts_with(&frame_version_prefix(1)));
    }
}
