//! # Frametag Embedding Cache
//!
//! Stores one *current* embedding per (frame, pipeline) pair and keeps every
//! write in an append-only history so a delete can fall back to the previous
//! value instead of leaving the frame empty.
//!
//! ## Layout
//!
//! Two key families share one ordered key-value table:
//!
//! - `cur/{frame}/{pipeline}` holds the current [`EmbeddingRecord`].
//! - `ver/{frame}/{pipeline}/{seq}` holds each archived [`EmbeddingVersion`],
//!   with `seq` zero-padded so key order is write order.
//!
//! Values are bincode-encoded and zstd-compressed by default. Backends are
//! pluggable through [`CacheBackend`]; an in-memory map is always available and
//! a redb file backend ships behind the default `backend-redb` feature.
//!
//! ## Example
//!
//! ```
//! use cache::EmbeddingCache;
//!
//! let cache = EmbeddingCache::in_memory();
//! cache.put(1, "clip_vitb32", vec![0.6, 0.8], "ViT-B-32+v1").unwrap();
//! cache.put(1, "clip_vitb32", vec![1.0, 0.0], "ViT-B-32+v1").unwrap();
//!
//! let outcome = cache.delete(1, "clip_vitb32").unwrap();
//! assert!(outcome.reverted());
//! let current = cache.get(1, "clip_vitb32").unwrap().unwrap();
//! assert_eq!(current.embedding, vec![0.6, 0.8]);
//! ```

mod backend;
mod codec;
mod error;
mod record;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, warn};

#[cfg(feature = "backend-redb")]
pub use crate::backend::RedbBackend;
pub use crate::backend::{BackendConfig, CacheBackend, InMemoryBackend, WriteOp};
pub use crate::codec::{CompressionCodec, CompressionConfig};
pub use crate::error::CacheError;
pub use crate::record::{
    BulkDeleteOutcome, DeleteOutcome, EmbeddingQuery, EmbeddingRecord, EmbeddingVersion, FrameId,
    Page,
};

use crate::record::{
    current_key, current_prefix, frame_version_prefix, seq_from_version_key, version_key,
    version_prefix, CurrentEntry,
};

/// Warning attached when a frame is left without any embedding.
pub const NO_EMBEDDINGS_LEFT: &str = "Frame has no embeddings remaining. Re-analysis recommended.";

/// Cache construction options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheConfig {
    pub backend: BackendConfig,
    pub compression: CompressionConfig,
    /// Versions kept per pair. `None` keeps the full history.
    pub history_depth: Option<usize>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_history_depth(mut self, depth: Option<usize>) -> Self {
        self.history_depth = depth;
        self
    }
}

pub struct EmbeddingCache {
    backend: Box<dyn CacheBackend>,
    cfg: CacheConfig,
    next_seq: AtomicU64,
}

impl EmbeddingCache {
    /// Builds the configured backend and opens the cache on it.
    pub fn new(cfg: CacheConfig) -> Result<Self, CacheError> {
        let backend = cfg.backend.build()?;
        Self::with_backend(cfg, backend)
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(InMemoryBackend::new()),
            cfg: CacheConfig::default(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Opens the cache on an existing backend, resuming the version sequence
    /// after the highest one already stored.
    pub fn with_backend(cfg: CacheConfig, backend: Box<dyn CacheBackend>) -> Result<Self, CacheError> {
        let mut max_seq = 0u64;
        backend.scan_prefix("ver/", &mut |key: &str, _: &[u8]| {
            if let Some(seq) = seq_from_version_key(key) {
                max_seq = max_seq.max(seq);
            }
            Ok(())
        })?;
        Ok(Self {
            backend,
            cfg,
            next_seq: AtomicU64::new(max_seq + 1),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn get(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
    ) -> Result<Option<EmbeddingRecord>, CacheError> {
        Ok(self
            .current_entry(frame_id, pipeline_id)?
            .map(|entry| entry.record))
    }

    /// Like [`get`](Self::get), but rejects a hit whose length differs from
    /// `expected_dim`.
    pub fn get_checked(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
        expected_dim: usize,
    ) -> Result<Option<EmbeddingRecord>, CacheError> {
        match self.get(frame_id, pipeline_id)? {
            Some(record) if record.dimension() != expected_dim => {
                error!(
                    frame_id,
                    pipeline = pipeline_id,
                    expected = expected_dim,
                    actual = record.dimension(),
                    "cached embedding has the wrong dimension"
                );
                Err(CacheError::Inconsistency {
                    frame_id,
                    pipeline_id: pipeline_id.to_string(),
                    expected: expected_dim,
                    actual: record.dimension(),
                })
            }
            other => Ok(other),
        }
    }

    /// Makes `embedding` the current value of the pair and archives it.
    ///
    /// A failed history write is logged and tolerated. A failed current-value
    /// write is returned to the caller.
    pub fn put(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
        embedding: Vec<f32>,
        model_version: &str,
    ) -> Result<EmbeddingRecord, CacheError> {
        let now = Utc::now();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let version = EmbeddingVersion {
            seq,
            embedding: embedding.clone(),
            model_version: model_version.to_string(),
            created_at: now,
            deleted: false,
            deleted_at: None,
        };
        let archived = self
            .cfg
            .compression
            .encode(&version)
            .and_then(|bytes| {
                self.backend
                    .put(&version_key(frame_id, pipeline_id, seq), &bytes)
            });
        if let Err(err) = archived {
            warn!(
                frame_id,
                pipeline = pipeline_id,
                error = %err,
                "failed to archive embedding version, history degraded"
            );
        }

        let created_at = match self.current_entry(frame_id, pipeline_id) {
            Ok(Some(existing)) => existing.record.created_at,
            Ok(None) => now,
            Err(err) => {
                warn!(frame_id, pipeline = pipeline_id, error = %err, "unreadable current entry, overwriting");
                now
            }
        };
        let entry = CurrentEntry {
            seq,
            record: EmbeddingRecord {
                frame_id,
                pipeline_id: pipeline_id.to_string(),
                embedding,
                model_version: model_version.to_string(),
                created_at,
                updated_at: now,
            },
        };
        let bytes = self.cfg.compression.encode(&entry)?;
        self.backend
            .put(&current_key(frame_id, pipeline_id), &bytes)?;

        if let Some(depth) = self.cfg.history_depth {
            if let Err(err) = self.prune_history(frame_id, pipeline_id, depth, seq) {
                warn!(frame_id, pipeline = pipeline_id, error = %err, "history pruning failed");
            }
        }

        debug!(frame_id, pipeline = pipeline_id, seq, "stored embedding");
        Ok(entry.record)
    }

    /// Soft-deletes the current value and promotes the newest surviving version.
    pub fn delete(&self, frame_id: FrameId, pipeline_id: &str) -> Result<DeleteOutcome, CacheError> {
        let Some(current) = self.current_entry(frame_id, pipeline_id)? else {
            let total_remaining = self.frame_embeddings(frame_id)?.len();
            return Ok(DeleteOutcome {
                frame_id,
                pipeline_id: pipeline_id.to_string(),
                deleted: false,
                reverted_to: None,
                remaining_for_pipeline: 0,
                total_remaining,
                warning: Some(format!(
                    "No embedding stored for frame {frame_id} under pipeline '{pipeline_id}'."
                )),
            });
        };

        let now = Utc::now();
        let versions = self.history(frame_id, pipeline_id)?;
        let mut ops = Vec::with_capacity(2);

        if let Some(active) = versions.iter().find(|v| v.seq == current.seq) {
            let mut tombstone = active.clone();
            tombstone.deleted = true;
            tombstone.deleted_at = Some(now);
            ops.push(WriteOp::put(
                version_key(frame_id, pipeline_id, active.seq),
                self.cfg.compression.encode(&tombstone)?,
            ));
        }

        let survivors: Vec<&EmbeddingVersion> = versions
            .iter()
            .filter(|v| !v.deleted && v.seq != current.seq)
            .collect();

        let reverted_to = match survivors.iter().max_by_key(|v| v.seq) {
            Some(previous) => {
                let record = EmbeddingRecord {
                    frame_id,
                    pipeline_id: pipeline_id.to_string(),
                    embedding: previous.embedding.clone(),
                    model_version: previous.model_version.clone(),
                    created_at: previous.created_at,
                    updated_at: now,
                };
                let entry = CurrentEntry {
                    seq: previous.seq,
                    record: record.clone(),
                };
                ops.push(WriteOp::put(
                    current_key(frame_id, pipeline_id),
                    self.cfg.compression.encode(&entry)?,
                ));
                Some(record)
            }
            None => {
                ops.push(WriteOp::delete(current_key(frame_id, pipeline_id)));
                None
            }
        };

        self.backend.apply(ops)?;

        let total_remaining = self.frame_embeddings(frame_id)?.len();
        let warning = match (&reverted_to, total_remaining) {
            (Some(_), _) => None,
            (None, 0) => Some(NO_EMBEDDINGS_LEFT.to_string()),
            (None, _) => Some(format!(
                "No embeddings remain for pipeline '{pipeline_id}'. Re-analysis recommended."
            )),
        };

        info!(
            frame_id,
            pipeline = pipeline_id,
            reverted = reverted_to.is_some(),
            total_remaining,
            "deleted embedding"
        );

        Ok(DeleteOutcome {
            frame_id,
            pipeline_id: pipeline_id.to_string(),
            deleted: true,
            reverted_to,
            remaining_for_pipeline: survivors.len(),
            total_remaining,
            warning,
        })
    }

    /// Every archived version of the pair, oldest first, including soft-deleted ones.
    pub fn history(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
    ) -> Result<Vec<EmbeddingVersion>, CacheError> {
        let mut versions = Vec::new();
        self.backend
            .scan_prefix(&version_prefix(frame_id, pipeline_id), &mut |_: &str, value: &[u8]| {
                versions.push(self.cfg.compression.decode::<EmbeddingVersion>(value)?);
                Ok(())
            })?;
        Ok(versions)
    }

    /// Current records of a frame across all pipelines, newest first.
    pub fn frame_embeddings(&self, frame_id: FrameId) -> Result<Vec<EmbeddingRecord>, CacheError> {
        let mut records = self.scan_current(Some(frame_id))?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Pages through current records, ordered by frame id then creation time,
    /// both descending.
    pub fn list(&self, query: &EmbeddingQuery) -> Result<Page<EmbeddingRecord>, CacheError> {
        let mut records = self.scan_current(query.frame_id)?;
        if let Some(pipeline_id) = &query.pipeline_id {
            records.retain(|r| &r.pipeline_id == pipeline_id);
        }
        records.sort_by(|a, b| {
            b.frame_id
                .cmp(&a.frame_id)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        let total = records.len();
        let items = records
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        Ok(Page {
            items,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    /// Removes every current value and every archived version of a frame.
    pub fn delete_frame(&self, frame_id: FrameId) -> Result<BulkDeleteOutcome, CacheError> {
        let mut ops = Vec::new();
        let mut deleted_count = 0usize;
        self.backend
            .scan_prefix(&current_prefix(Some(frame_id)), &mut |key: &str, _: &[u8]| {
                deleted_count += 1;
                ops.push(WriteOp::delete(key));
                Ok(())
            })?;
        self.backend
            .scan_prefix(&frame_version_prefix(frame_id), &mut |key: &str, _: &[u8]| {
                ops.push(WriteOp::delete(key));
                Ok(())
            })?;

        if deleted_count == 0 {
            return Ok(BulkDeleteOutcome {
                frame_id,
                deleted_count: 0,
                warning: Some(format!("No embeddings found for frame {frame_id}.")),
            });
        }

        self.backend.apply(ops)?;
        info!(frame_id, deleted_count, "deleted all embeddings of frame");
        Ok(BulkDeleteOutcome {
            frame_id,
            deleted_count,
            warning: Some("All embeddings removed. Frame requires re-analysis.".to_string()),
        })
    }

    pub fn flush(&self) -> Result<(), CacheError> {
        self.backend.flush()
    }

    fn current_entry(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
    ) -> Result<Option<CurrentEntry>, CacheError> {
        match self.backend.get(&current_key(frame_id, pipeline_id))? {
            Some(bytes) => Ok(Some(self.cfg.compression.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_current(&self, frame_id: Option<FrameId>) -> Result<Vec<EmbeddingRecord>, CacheError> {
        let mut records = Vec::new();
        self.backend
            .scan_prefix(&current_prefix(frame_id), &mut |_: &str, value: &[u8]| {
                let entry: CurrentEntry = self.cfg.compression.decode(value)?;
                records.push(entry.record);
                Ok(())
            })?;
        Ok(records)
    }

    /// Drops the oldest versions beyond `depth`, never the one backing the current value.
    fn prune_history(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
        depth: usize,
        current_seq: u64,
    ) -> Result<(), CacheError> {
        let mut seqs = Vec::new();
        self.backend
            .scan_prefix(&version_prefix(frame_id, pipeline_id), &mut |key: &str, _: &[u8]| {
                if let Some(seq) = seq_from_version_key(key) {
                    seqs.push(seq);
                }
                Ok(())
            })?;
        if seqs.len() <= depth {
            return Ok(());
        }
        let excess = seqs.len() - depth;
        let ops: Vec<WriteOp> = seqs
            .into_iter()
            .filter(|seq| *seq != current_seq)
            .take(excess)
            .map(|seq| WriteOp::delete(version_key(frame_id, pipeline_id, seq)))
            .collect();
        debug!(frame_id, pipeline = pipeline_id, pruned = ops.len(), "pruned history");
        self.backend.apply(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const PIPE: &str = "clip_vitb32";

    #[test]
    fn put_then_get_returns_same_dimension() {
        let cache = EmbeddingCache::in_memory();
        let vector: Vec<f32> = (0..512).map(|i| i as f32 / 512.0).collect();
        let stored = cache.put(42, PIPE, vector.clone(), "ViT-B-32+a").unwrap();
        let fetched = cache.get(42, PIPE).unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert_eq!(fetched.dimension(), 512);
        assert_eq!(fetched.embedding, vector);
        assert!(cache.get(42, "openclip_vitl14").unwrap().is_none());
    }

    #[test]
    fn overwrite_keeps_created_at_and_archives_both() {
        let cache = EmbeddingCache::in_memory();
        let first = cache.put(1, PIPE, vec![1.0, 0.0], "v1").unwrap();
        let second = cache.put(1, PIPE, vec![0.0, 1.0], "v2").unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        let history = cache.history(1, PIPE).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].seq < history[1].seq);
        assert_eq!(history[1].model_version, "v2");
    }

    #[test]
    fn delete_reverts_then_empties() {
        let cache = EmbeddingCache::in_memory();
        let a = vec![0.6, 0.8];
        let b = vec![0.8, 0.6];
        cache.put(5, PIPE, a.clone(), "v").unwrap();
        cache.put(5, PIPE, b.clone(), "v").unwrap();
        assert_eq!(cache.get(5, PIPE).unwrap().unwrap().embedding, b);

        let first = cache.delete(5, PIPE).unwrap();
        assert!(first.deleted);
        assert!(first.reverted());
        assert!(first.warning.is_none());
        assert_eq!(first.remaining_for_pipeline, 1);
        assert_eq!(cache.get(5, PIPE).unwrap().unwrap().embedding, a);

        let second = cache.delete(5, PIPE).unwrap();
        assert!(second.deleted);
        assert!(!second.reverted());
        assert_eq!(second.total_remaining, 0);
        assert_eq!(second.warning.as_deref(), Some(NO_EMBEDDINGS_LEFT));
        assert!(cache.get(5, PIPE).unwrap().is_none());

        let history = cache.history(5, PIPE).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|v| v.deleted && v.deleted_at.is_some()));
    }

    #[test]
    fn delete_of_empty_pair_warns_without_deleting() {
        let cache = EmbeddingCache::in_memory();
        let outcome = cache.delete(9, PIPE).unwrap();
        assert!(!outcome.deleted);
        assert!(outcome.warning.is_some());
    }

    #[test]
    fn delete_with_other_pipeline_left_has_pipeline_warning() {
        let cache = EmbeddingCache::in_memory();
        cache.put(3, PIPE, vec![1.0], "v").unwrap();
        cache.put(3, "openclip_vitl14", vec![1.0], "v").unwrap();
        let outcome = cache.delete(3, PIPE).unwrap();
        assert_eq!(outcome.total_remaining, 1);
        let warning = outcome.warning.unwrap();
        assert!(warning.contains(PIPE));
        assert_ne!(warning, NO_EMBEDDINGS_LEFT);
    }

    #[test]
    fn get_checked_flags_dimension_mismatch() {
        let cache = EmbeddingCache::in_memory();
        cache.put(7, PIPE, vec![0.5; 768], "v").unwrap();
        let err = cache.get_checked(7, PIPE, 512).unwrap_err();
        assert_eq!(
            err,
            CacheError::Inconsistency {
                frame_id: 7,
                pipeline_id: PIPE.into(),
                expected: 512,
                actual: 768,
            }
        );
        assert!(cache.get_checked(7, PIPE, 768).unwrap().is_some());
        assert!(cache.get_checked(8, PIPE, 768).unwrap().is_none());
    }

    #[test]
    fn history_depth_prunes_oldest() {
        let cache = EmbeddingCache::with_backend(
            CacheConfig::new().with_history_depth(Some(2)),
            Box::new(InMemoryBackend::new()),
        )
        .unwrap();
        for i in 0..5 {
            cache.put(1, PIPE, vec![i as f32], "v").unwrap();
        }
        let history = cache.history(1, PIPE).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].embedding, vec![3.0]);
        assert_eq!(history[1].embedding, vec![4.0]);
    }

    #[test]
    fn list_filters_and_pages() {
        let cache = EmbeddingCache::in_memory();
        for frame in 1..=4 {
            cache.put(frame, PIPE, vec![1.0], "v").unwrap();
        }
        cache.put(2, "openclip_vitl14", vec![1.0], "v").unwrap();

        let all = cache.list(&EmbeddingQuery::default()).unwrap();
        assert_eq!(all.total, 5);
        assert_eq!(all.items[0].frame_id, 4);

        let page = cache
            .list(&EmbeddingQuery::default().with_pipeline(PIPE).with_page(2, 1))
            .unwrap();
        assert_eq!(page.total, 4);
        let frames: Vec<_> = page.items.iter().map(|r| r.frame_id).collect();
        assert_eq!(frames, vec![3, 2]);

        let frame_two = cache.list(&EmbeddingQuery::for_frame(2)).unwrap();
        assert_eq!(frame_two.total, 2);
        assert_eq!(cache.frame_embeddings(2).unwrap().len(), 2);
    }

    #[test]
    fn delete_frame_clears_everything() {
        let cache = EmbeddingCache::in_memory();
        cache.put(11, PIPE, vec![1.0], "v").unwrap();
        cache.put(11, PIPE, vec![2.0], "v").unwrap();
        cache.put(11, "openclip_vitl14", vec![1.0], "v").unwrap();
        cache.put(1, PIPE, vec![1.0], "v").unwrap();

        let outcome = cache.delete_frame(11).unwrap();
        assert_eq!(outcome.deleted_count, 2);
        assert!(cache.frame_embeddings(11).unwrap().is_empty());
        assert!(cache.history(11, PIPE).unwrap().is_empty());
        assert!(cache.get(1, PIPE).unwrap().is_some());

        let again = cache.delete_frame(11).unwrap();
        assert_eq!(again.deleted_count, 0);
    }

    #[test]
    fn concurrent_puts_keep_every_version() {
        let cache = Arc::new(EmbeddingCache::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache.put(1, PIPE, vec![i as f32], "v").unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.history(1, PIPE).unwrap().len(), 8);
        assert!(cache.get(1, PIPE).unwrap().is_some());
    }

    #[cfg(feature = "backend-redb")]
    #[test]
    fn redb_cache_resumes_sequence_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");
        let cfg = CacheConfig::new().with_backend(BackendConfig::redb(path.to_string_lossy()));
        {
            let cache = EmbeddingCache::new(cfg.clone()).unwrap();
            cache.put(1, PIPE, vec![1.0, 0.0], "v").unwrap();
            cache.put(1, PIPE, vec![0.0, 1.0], "v").unwrap();
        }
        let cache = EmbeddingCache::new(cfg).unwrap();
        cache.put(1, PIPE, vec![0.5, 0.5], "v").unwrap();
        let history = cache.history(1, PIPE).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].embedding, vec![0.5, 0.5]);

        let outcome = cache.delete(1, PIPE).unwrap();
        assert_eq!(outcome.reverted_to.unwrap().embedding, vec![0.0, 1.0]);
    }
}
