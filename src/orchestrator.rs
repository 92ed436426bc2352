//! Analysis entry points.
//!
//! [`Analyzer`] ties the pipeline registry, the embedding cache, the attribute
//! store and the frame source together. Single frames are analyzed inline on
//! the caller's thread; batches are queued on a [`JobRunner`] and processed in
//! the background through the same embedding and scoring steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cache::{
    BulkDeleteOutcome, DeleteOutcome, EmbeddingCache, EmbeddingQuery, EmbeddingRecord, FrameId,
    Page,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use pipeline::{
    PipelineDescriptor, PipelineError, PipelineRegistry, PipelineStatus, VisionPipeline,
    WarmupReport,
};
use scoring::{
    AttributeDebug, AttributeScorer, AttributeStore, InMemoryAttributeStore, PrototypeSet,
    PrototypeStore, SceneAttributeRecord, VerifiedFilter, VerifiedSummary,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{FrametagConfig, JobsConfig, MAX_BATCH_LIMIT};
use crate::frames::{FrameFilter, FrameSource};
use crate::jobs::{
    BatchProcessor, BatchTask, FrameFailure, JobRecord, JobReporter, JobRunner, JobStatus,
    JobTracker,
};
use crate::AnalysisError;

pub const CACHE_HITS_TOTAL: &str = "frametag_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "frametag_cache_misses_total";
pub const EMBED_SECONDS: &str = "frametag_embed_seconds";

/// A persisted attribute as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeResult {
    pub attribute: String,
    pub value: String,
    pub confidence: Option<f32>,
    pub is_verified: bool,
}

impl From<SceneAttributeRecord> for AttributeResult {
    fn from(record: SceneAttributeRecord) -> Self {
        Self {
            attribute: record.attribute,
            value: record.value,
            confidence: record.confidence,
            is_verified: record.is_verified,
        }
    }
}

/// Provenance of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisLog {
    pub timestamp: DateTime<Utc>,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub model_id: String,
    pub device: String,
    pub model_version: String,
    pub embedding_dimension: usize,
    pub cached: bool,
    #[serde(with = "crate::serde_secs")]
    pub embed_time: Duration,
    #[serde(with = "crate::serde_secs")]
    pub attribute_time: Duration,
}

/// Result of [`Analyzer::analyze_frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub frame_id: FrameId,
    pub pipeline_id: String,
    pub embedding: Vec<f32>,
    pub embedding_dimension: usize,
    pub attributes: Vec<AttributeResult>,
    pub debug_log: BTreeMap<String, AttributeDebug>,
    /// The embedding came from the cache.
    pub cached: bool,
    #[serde(with = "crate::serde_secs")]
    pub embed_time: Duration,
    #[serde(with = "crate::serde_secs")]
    pub attribute_time: Duration,
    pub analysis_log: AnalysisLog,
}

/// Frames to analyze in the background.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchRequest {
    /// Explicit frames. Take precedence over `filter`.
    pub frame_ids: Option<Vec<FrameId>>,
    pub filter: Option<FrameFilter>,
    /// Falls back to the configured default pipeline.
    pub pipeline_id: Option<String>,
    /// Cap on selected frames, 1..=5000.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub job_id: String,
    pub count: usize,
}

/// A registered pipeline with its live status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub descriptor: PipelineDescriptor,
    pub status: PipelineStatus,
}

/// An embedding, from the cache or freshly computed.
struct ResolvedEmbedding {
    vector: Vec<f32>,
    model_version: String,
    cached: bool,
    embed_time: Duration,
}

/// Shared state behind [`Analyzer`]. Also the batch processor.
struct AnalyzerCore {
    registry: Arc<PipelineRegistry>,
    cache: Arc<EmbeddingCache>,
    attributes: Arc<dyn AttributeStore>,
    frames: Arc<dyn FrameSource>,
    prototypes: PrototypeStore,
    scorer: AttributeScorer,
    default_pipeline: String,
    jobs: JobsConfig,
}

pub struct Analyzer {
    core: Arc<AnalyzerCore>,
    tracker: Arc<JobTracker>,
    runner: Option<JobRunner>,
}

/// Builder for [`Analyzer`].
pub struct AnalyzerBuilder {
    registry: Arc<PipelineRegistry>,
    cache: Arc<EmbeddingCache>,
    attributes: Arc<dyn AttributeStore>,
    frames: Arc<dyn FrameSource>,
    scorer: AttributeScorer,
    default_pipeline: String,
    jobs: JobsConfig,
}

impl AnalyzerBuilder {
    pub fn with_scorer(mut self, scorer: AttributeScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_default_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.default_pipeline = pipeline_id.into();
        self
    }

    pub fn with_jobs(mut self, jobs: JobsConfig) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn build(self) -> Analyzer {
        let prototypes = PrototypeStore::new(Arc::clone(&self.attributes), Arc::clone(&self.cache));
        let tracker = Arc::new(JobTracker::with_max_finished(self.jobs.max_finished_jobs));
        Analyzer {
            core: Arc::new(AnalyzerCore {
                registry: self.registry,
                cache: self.cache,
                attributes: self.attributes,
                frames: self.frames,
                prototypes,
                scorer: self.scorer,
                default_pipeline: self.default_pipeline,
                jobs: self.jobs,
            }),
            tracker,
            runner: None,
        }
    }
}

impl Analyzer {
    pub fn builder(
        registry: Arc<PipelineRegistry>,
        cache: Arc<EmbeddingCache>,
        attributes: Arc<dyn AttributeStore>,
        frames: Arc<dyn FrameSource>,
    ) -> AnalyzerBuilder {
        AnalyzerBuilder {
            registry,
            cache,
            attributes,
            frames,
            scorer: AttributeScorer::default(),
            default_pipeline: "clip_vitb32".to_string(),
            jobs: JobsConfig::default(),
        }
    }

    /// Wires an analyzer from configuration with an in-memory attribute store.
    pub fn from_config(
        cfg: &FrametagConfig,
        frames: Arc<dyn FrameSource>,
    ) -> Result<Self, AnalysisError> {
        let registry = Arc::new(PipelineRegistry::with_defaults(&cfg.pipelines));
        let cache = Arc::new(EmbeddingCache::new(cfg.cache_config())?);
        let attributes: Arc<dyn AttributeStore> = Arc::new(InMemoryAttributeStore::new());
        Ok(Self::builder(registry, cache, attributes, frames)
            .with_scorer(AttributeScorer::new(cfg.vocabulary(), cfg.blend_policy()))
            .with_default_pipeline(cfg.default_pipeline.clone())
            .with_jobs(cfg.jobs.clone())
            .build())
    }

    /// Starts the batch worker. Must be called from within a tokio runtime.
    pub fn start_jobs(&mut self) {
        if self.runner.is_some() {
            return;
        }
        let processor: Arc<dyn BatchProcessor> = self.core.clone();
        self.runner = Some(JobRunner::start(
            processor,
            Arc::clone(&self.tracker),
            self.core.jobs.queue_capacity,
        ));
    }

    /// Stops the batch worker, failing unfinished jobs.
    pub async fn stop_jobs(&mut self) {
        if let Some(runner) = self.runner.take() {
            runner.shutdown().await;
        }
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.core.registry
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.core.cache
    }

    pub fn attributes(&self) -> &Arc<dyn AttributeStore> {
        &self.core.attributes
    }

    pub fn default_pipeline(&self) -> &str {
        &self.core.default_pipeline
    }

    /// Embeds (or reuses the cached embedding of) one frame and scores every
    /// attribute. `force` recomputes and overwrites the cached embedding.
    pub fn analyze_frame(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
        force: bool,
    ) -> Result<FrameAnalysis, AnalysisError> {
        self.core.analyze_frame(frame_id, pipeline_id, force)
    }

    /// Selects frames, queues a job and returns without waiting for it.
    pub fn submit_batch(&self, request: &BatchRequest) -> Result<BatchSubmission, AnalysisError> {
        let runner = self
            .runner
            .as_ref()
            .ok_or_else(|| AnalysisError::JobQueue("batch worker is not running".into()))?;

        let pipeline_id = request
            .pipeline_id
            .clone()
            .unwrap_or_else(|| self.core.default_pipeline.clone());
        // Reject unknown pipelines before anything is queued.
        self.core.registry.get(&pipeline_id)?;

        let limit = request.limit.unwrap_or(self.core.jobs.default_limit);
        if !(1..=MAX_BATCH_LIMIT).contains(&limit) {
            return Err(AnalysisError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_BATCH_LIMIT}, got {limit}"
            )));
        }

        let frame_ids = match (&request.frame_ids, &request.filter) {
            (Some(ids), _) if !ids.is_empty() => {
                let mut seen = std::collections::HashSet::new();
                ids.iter().copied().filter(|id| seen.insert(*id)).collect()
            }
            (_, Some(filter)) => self.core.select_frames(filter, limit)?,
            _ => Vec::new(),
        };
        if frame_ids.is_empty() {
            return Err(AnalysisError::NoFrames);
        }

        let count = frame_ids.len();
        let job = self.tracker.create(&pipeline_id, Some(count));
        let task = BatchTask {
            job_id: job.id.clone(),
            pipeline_id: pipeline_id.clone(),
            frame_ids,
        };
        if let Err(err) = runner.enqueue(task) {
            self.tracker
                .report_terminal(&job.id, JobStatus::Failed, Some(err.to_string()));
            return Err(err);
        }
        info!(job_id = %job.id, pipeline = %pipeline_id, count, "batch submitted");
        Ok(BatchSubmission {
            job_id: job.id,
            count,
        })
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobRecord, AnalysisError> {
        self.tracker
            .get(job_id)
            .ok_or_else(|| AnalysisError::UnknownJob(job_id.to_string()))
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.tracker.list()
    }

    pub fn list_pipelines(&self) -> Vec<PipelineInfo> {
        let registry = &self.core.registry;
        registry
            .ids()
            .into_iter()
            .filter_map(|id| registry.get(&id).ok())
            .map(|p| PipelineInfo {
                descriptor: p.descriptor(),
                status: p.status(),
            })
            .collect()
    }

    /// Loads the given pipelines, or all of them.
    pub fn warmup(&self, pipeline_ids: Option<&[String]>) -> WarmupReport {
        self.core.registry.warmup(pipeline_ids)
    }

    /// Deletes the current embedding of a pair, reverting to the previous one
    /// when history allows. A frame left without a usable embedding is flagged
    /// for re-analysis.
    pub fn delete_embedding(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
    ) -> Result<DeleteOutcome, AnalysisError> {
        let outcome = self.core.cache.delete(frame_id, pipeline_id)?;
        if outcome.deleted && outcome.warning.is_some() {
            self.flag_for_reanalysis(frame_id);
        }
        Ok(outcome)
    }

    pub fn delete_frame_embeddings(
        &self,
        frame_id: FrameId,
    ) -> Result<BulkDeleteOutcome, AnalysisError> {
        let outcome = self.core.cache.delete_frame(frame_id)?;
        if outcome.deleted_count > 0 {
            self.flag_for_reanalysis(frame_id);
        }
        Ok(outcome)
    }

    /// Records a human-confirmed value. It is never overwritten by analysis and
    /// feeds the prototypes of later runs.
    pub fn verify_attribute(
        &self,
        frame_id: FrameId,
        attribute: &str,
        value: &str,
    ) -> Result<SceneAttributeRecord, AnalysisError> {
        let definition = self
            .core
            .scorer
            .vocabulary()
            .get(attribute)
            .ok_or_else(|| scoring::ScoringError::UnknownAttribute(attribute.to_string()))?;
        if !definition.labels().any(|label| label == value) {
            return Err(AnalysisError::InvalidRequest(format!(
                "'{value}' is not a value of '{attribute}'"
            )));
        }
        if !self.core.frames.exists(frame_id)? {
            return Err(AnalysisError::FrameNotFound(frame_id));
        }
        let record = self.core.attributes.verify(frame_id, attribute, value)?;
        info!(frame_id, attribute, value, "attribute verified");
        Ok(record)
    }

    pub fn embeddings(&self, query: &EmbeddingQuery) -> Result<Page<EmbeddingRecord>, AnalysisError> {
        if query.limit == 0 {
            return Err(AnalysisError::InvalidRequest("limit must be >= 1".into()));
        }
        Ok(self.core.cache.list(query)?)
    }

    pub fn verified_attributes(
        &self,
        filter: &VerifiedFilter,
    ) -> Result<Vec<VerifiedSummary>, AnalysisError> {
        Ok(self.core.prototypes.verified_summary(filter)?)
    }

    fn flag_for_reanalysis(&self, frame_id: FrameId) {
        match self.core.frames.mark_needs_analysis(frame_id) {
            Ok(()) => info!(frame_id, "frame flagged for re-analysis"),
            Err(err) => warn!(frame_id, error = %err, "could not flag frame for re-analysis"),
        }
    }
}

impl AnalyzerCore {
    /// Frame source selection, narrowed by the stored `time_of_day` value when
    /// the filter asks for one.
    fn select_frames(
        &self,
        filter: &FrameFilter,
        limit: usize,
    ) -> Result<Vec<FrameId>, AnalysisError> {
        let Some(wanted) = filter.time_of_day.as_deref() else {
            return self.frames.select(filter, limit);
        };
        let mut selected = Vec::new();
        for frame_id in self.frames.select(filter, usize::MAX)? {
            let stored = self.attributes.get(frame_id, "time_of_day")?;
            if stored.is_some_and(|record| record.value == wanted) {
                selected.push(frame_id);
                if selected.len() == limit {
                    break;
                }
            }
        }
        Ok(selected)
    }

    fn analyze_frame(
        &self,
        frame_id: FrameId,
        pipeline_id: &str,
        force: bool,
    ) -> Result<FrameAnalysis, AnalysisError> {
        let pipeline = self.registry.get(pipeline_id)?;
        if !self.frames.exists(frame_id)? {
            return Err(AnalysisError::FrameNotFound(frame_id));
        }

        let embedding = self.resolve_embedding(frame_id, pipeline.as_ref(), force)?;

        let started = Instant::now();
        let prototypes = self.prototypes.build_set(pipeline_id)?;
        let scoring = self.scorer.score_frame(
            frame_id,
            pipeline.as_ref(),
            &embedding.vector,
            &prototypes,
            self.attributes.as_ref(),
        )?;
        let attribute_time = started.elapsed();

        if let Err(err) = self.frames.mark_analyzed(frame_id) {
            warn!(frame_id, error = %err, "could not update frame status");
        }

        let descriptor = pipeline.descriptor();
        let analysis_log = AnalysisLog {
            timestamp: Utc::now(),
            pipeline_id: descriptor.id.clone(),
            pipeline_name: descriptor.name,
            model_id: descriptor.model_id,
            device: descriptor.device,
            model_version: embedding.model_version,
            embedding_dimension: embedding.vector.len(),
            cached: embedding.cached,
            embed_time: embedding.embed_time,
            attribute_time,
        };
        info!(
            frame_id,
            pipeline = pipeline_id,
            cached = embedding.cached,
            embed_ms = embedding.embed_time.as_millis() as u64,
            attribute_ms = attribute_time.as_millis() as u64,
            "analysis complete"
        );

        Ok(FrameAnalysis {
            frame_id,
            pipeline_id: descriptor.id,
            embedding_dimension: embedding.vector.len(),
            embedding: embedding.vector,
            attributes: scoring.attributes.into_iter().map(Into::into).collect(),
            debug_log: scoring.debug_log,
            cached: embedding.cached,
            embed_time: embedding.embed_time,
            attribute_time,
            analysis_log,
        })
    }

    /// Cache hit when allowed, otherwise embed and write through.
    fn resolve_embedding(
        &self,
        frame_id: FrameId,
        pipeline: &dyn VisionPipeline,
        force: bool,
    ) -> Result<ResolvedEmbedding, AnalysisError> {
        let descriptor = pipeline.descriptor();
        if !force {
            if let Some(hit) =
                self.cache
                    .get_checked(frame_id, &descriptor.id, descriptor.embedding_dimension)?
            {
                counter!(CACHE_HITS_TOTAL, "pipeline" => descriptor.id.clone()).increment(1);
                debug!(frame_id, pipeline = %descriptor.id, "using cached embedding");
                return Ok(ResolvedEmbedding {
                    vector: hit.embedding,
                    model_version: hit.model_version,
                    cached: true,
                    embed_time: Duration::ZERO,
                });
            }
        }
        counter!(CACHE_MISSES_TOTAL, "pipeline" => descriptor.id.clone()).increment(1);

        let image = self.frames.load_image(frame_id)?;
        let started = Instant::now();
        let embedded = pipeline.embed_image(&image)?;
        let embed_time = started.elapsed();
        histogram!(EMBED_SECONDS, "pipeline" => descriptor.id.clone())
            .record(embed_time.as_secs_f64());

        self.cache
            .put(frame_id, &descriptor.id, embedded.vector.clone(), &embedded.model_version)?;
        Ok(ResolvedEmbedding {
            vector: embedded.vector,
            model_version: embedded.model_version,
            cached: false,
            embed_time,
        })
    }

    /// Embeddings for one chunk of frames, in order. Cache hits skip the
    /// pipeline; misses are embedded together.
    fn embed_chunk(
        &self,
        frame_ids: &[FrameId],
        pipeline: &dyn VisionPipeline,
    ) -> Result<Vec<Result<Vec<f32>, AnalysisError>>, AnalysisError> {
        let descriptor = pipeline.descriptor();
        let mut resolved: Vec<Option<Result<Vec<f32>, AnalysisError>>> = Vec::with_capacity(frame_ids.len());
        let mut pending: Vec<(usize, FrameId, Vec<u8>)> = Vec::new();

        for (slot, &frame_id) in frame_ids.iter().enumerate() {
            match self
                .cache
                .get_checked(frame_id, &descriptor.id, descriptor.embedding_dimension)
            {
                Ok(Some(hit)) => {
                    counter!(CACHE_HITS_TOTAL, "pipeline" => descriptor.id.clone()).increment(1);
                    resolved.push(Some(Ok(hit.embedding)));
                }
                Ok(None) => {
                    counter!(CACHE_MISSES_TOTAL, "pipeline" => descriptor.id.clone()).increment(1);
                    match self.frames.load_image(frame_id) {
                        Ok(image) => {
                            pending.push((slot, frame_id, image));
                            resolved.push(None);
                        }
                        Err(err) => resolved.push(Some(Err(err))),
                    }
                }
                Err(err) => resolved.push(Some(Err(err.into()))),
            }
        }

        if !pending.is_empty() {
            let images: Vec<&[u8]> = pending.iter().map(|(_, _, bytes)| bytes.as_slice()).collect();
            let started = Instant::now();
            let outputs = pipeline.embed_images_batch(&images, self.jobs.chunk_size)?;
            histogram!(EMBED_SECONDS, "pipeline" => descriptor.id.clone())
                .record(started.elapsed().as_secs_f64());

            for ((slot, frame_id, _), output) in pending.iter().zip(outputs) {
                let result = output.map_err(AnalysisError::from).and_then(|embedded| {
                    self.cache.put(
                        *frame_id,
                        &descriptor.id,
                        embedded.vector.clone(),
                        &embedded.model_version,
                    )?;
                    Ok(embedded.vector)
                });
                resolved[*slot] = Some(result);
            }
        }

        Ok(resolved
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(AnalysisError::Pipeline(PipelineError::Inference(
                        "batch returned fewer embeddings than images".into(),
                    )))
                })
            })
            .collect())
    }

    fn score_embedded(
        &self,
        frame_id: FrameId,
        pipeline: &dyn VisionPipeline,
        embedding: &[f32],
        prototypes: &PrototypeSet,
    ) -> Result<(), AnalysisError> {
        self.scorer.score_frame(
            frame_id,
            pipeline,
            embedding,
            prototypes,
            self.attributes.as_ref(),
        )?;
        if let Err(err) = self.frames.mark_analyzed(frame_id) {
            warn!(frame_id, error = %err, "could not update frame status");
        }
        Ok(())
    }
}

impl BatchProcessor for AnalyzerCore {
    fn process(&self, task: &BatchTask, reporter: &dyn JobReporter) -> Result<(), AnalysisError> {
        let pipeline = self.registry.get(&task.pipeline_id)?;
        // A pipeline that cannot load fails the job before any frame is touched.
        pipeline.warmup()?;

        let total = task.frame_ids.len();
        let mut processed = 0usize;
        reporter.report_progress(&task.job_id, processed, Some(total));

        for chunk in task.frame_ids.chunks(self.jobs.chunk_size.max(1)) {
            if reporter.stop_requested() {
                return Err(AnalysisError::Interrupted {
                    unprocessed: total - processed,
                });
            }

            // Verified values may change while the job runs.
            let prototypes = self.prototypes.build_set(&task.pipeline_id)?;
            let embeddings = self.embed_chunk(chunk, pipeline.as_ref())?;

            for (&frame_id, embedding) in chunk.iter().zip(embeddings) {
                let outcome = embedding.and_then(|vector| {
                    self.score_embedded(frame_id, pipeline.as_ref(), &vector, &prototypes)
                });
                if let Err(err) = outcome {
                    if err.aborts_batch() {
                        return Err(err);
                    }
                    if let Err(mark_err) = self.frames.mark_failed(frame_id, &err.to_string()) {
                        warn!(frame_id, error = %mark_err, "could not update frame status");
                    }
                    reporter.report_failure(&task.job_id, FrameFailure::new(frame_id, &err));
                }
                processed += 1;
                reporter.report_progress(&task.job_id, processed, Some(total));
            }
        }
        Ok(())
    }
}
