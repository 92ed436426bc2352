//! Batch analysis jobs.
//!
//! [`JobTracker`] keeps the state of every submitted job and is the
//! [`JobReporter`] workers write progress to. [`JobRunner`] owns a tokio task
//! that pulls [`BatchTask`]s off a bounded queue and runs each one on the
//! blocking pool through a [`BatchProcessor`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cache::FrameId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::AnalysisError;

pub const JOBS_TOTAL: &str = "frametag_jobs_total";

/// Error attached to a job that finished with some frames failing.
pub const PARTIAL_FAILURE: &str = "Some frames failed during analysis.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameFailure {
    pub frame_id: FrameId,
    pub kind: String,
    pub error: String,
}

impl FrameFailure {
    pub fn new(frame_id: FrameId, err: &AnalysisError) -> Self {
        Self {
            frame_id,
            kind: err.kind().to_string(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub pipeline_id: String,
    pub status: JobStatus,
    pub processed: usize,
    pub total: Option<usize>,
    pub error: Option<String>,
    /// Frames that failed without stopping the job.
    pub failures: Vec<FrameFailure>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTask {
    pub job_id: String,
    pub pipeline_id: String,
    pub frame_ids: Vec<FrameId>,
}

/// Where workers publish job progress.
pub trait JobReporter: Send + Sync {
    fn report_progress(&self, job_id: &str, processed: usize, total: Option<usize>);

    fn report_failure(&self, _job_id: &str, _failure: FrameFailure) {}

    fn report_terminal(&self, job_id: &str, status: JobStatus, error: Option<String>);

    /// Checked by workers between chunks.
    fn stop_requested(&self) -> bool {
        false
    }
}

/// Runs one batch synchronously. Called on the blocking pool.
pub trait BatchProcessor: Send + Sync + 'static {
    fn process(&self, task: &BatchTask, reporter: &dyn JobReporter) -> Result<(), AnalysisError>;
}

/// Finished jobs kept by [`JobTracker::new`].
pub const DEFAULT_MAX_FINISHED_JOBS: usize = 1000;

pub struct JobTracker {
    jobs: DashMap<String, JobRecord>,
    stopping: AtomicBool,
    max_finished: usize,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_max_finished(DEFAULT_MAX_FINISHED_JOBS)
    }

    /// Keeps at most `max_finished` done or failed jobs. The oldest finished
    /// ones are dropped first. Queued and running jobs are never dropped.
    pub fn with_max_finished(max_finished: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            stopping: AtomicBool::new(false),
            max_finished,
        }
    }

    /// Registers a queued job and returns its record.
    pub fn create(&self, pipeline_id: &str, total: Option<usize>) -> JobRecord {
        let record = JobRecord {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.to_string(),
            status: JobStatus::Queued,
            processed: 0,
            total,
            error: None,
            failures: Vec::new(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.jobs.insert(record.id.clone(), record.clone());
        record
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.iter().map(|job| job.clone()).collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        jobs
    }

    pub fn mark_running(&self, job_id: &str) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            if job.status == JobStatus::Queued {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
            }
        }
    }

    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Drops the oldest finished jobs beyond the retention cap.
    fn prune_finished(&self) {
        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .jobs
            .iter()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.finished_at.unwrap_or(job.submitted_at), job.id.clone()))
            .collect();
        if finished.len() <= self.max_finished {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.max_finished;
        for (_, job_id) in finished.into_iter().take(excess) {
            self.jobs.remove_if(&job_id, |_, job| job.status.is_terminal());
        }
        debug!(evicted = excess, retained = self.max_finished, "pruned finished jobs");
    }
}

impl JobReporter for JobTracker {
    fn report_progress(&self, job_id: &str, processed: usize, total: Option<usize>) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Running;
            job.processed = processed;
            job.total = total.or(job.total);
        }
    }

    fn report_failure(&self, job_id: &str, failure: FrameFailure) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            warn!(job_id, frame_id = failure.frame_id, error = %failure.error, "frame failed");
            job.failures.push(failure);
        }
    }

    fn report_terminal(&self, job_id: &str, status: JobStatus, error: Option<String>) {
        {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return;
            };
            // Terminal states are final.
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.error = error;
            job.finished_at = Some(Utc::now());
            counter!(JOBS_TOTAL, "status" => status.as_str()).increment(1);
            info!(
                job_id,
                status = status.as_str(),
                processed = job.processed,
                failures = job.failures.len(),
                "job finished"
            );
        }
        // The map guard must be released before pruning walks the shards.
        self.prune_finished();
    }

    fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Background worker executing batch jobs one at a time.
pub struct JobRunner {
    sender: mpsc::Sender<BatchTask>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    tracker: Arc<JobTracker>,
}

impl JobRunner {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn start(
        processor: Arc<dyn BatchProcessor>,
        tracker: Arc<JobTracker>,
        queue_capacity: usize,
    ) -> Self {
        // A tracker may outlive a previous runner that was shut down.
        tracker.stopping.store(false, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(
            receiver,
            processor,
            Arc::clone(&tracker),
            shutdown_rx,
        ));
        info!(queue_capacity, "batch worker started");
        Self {
            sender,
            shutdown,
            worker,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Queues a task without waiting. Fails when the queue is full or the
    /// worker has stopped.
    pub fn enqueue(&self, task: BatchTask) -> Result<(), AnalysisError> {
        self.sender.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => AnalysisError::JobQueue("queue is full".into()),
            mpsc::error::TrySendError::Closed(_) => {
                AnalysisError::JobQueue("batch worker is not running".into())
            }
        })
    }

    /// Stops the worker. The running job ends after its current chunk and every
    /// job still queued is failed with its unprocessed frame count.
    pub async fn shutdown(self) {
        self.tracker.request_stop();
        let _ = self.shutdown.send(true);
        drop(self.sender);
        if let Err(err) = self.worker.await {
            error!(error = %err, "batch worker ended abnormally");
        }
        info!("batch worker stopped");
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<BatchTask>,
    processor: Arc<dyn BatchProcessor>,
    tracker: Arc<JobTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            task = receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        run_job(task, &processor, &tracker).await;
    }

    receiver.close();
    while let Ok(task) = receiver.try_recv() {
        let interrupted = AnalysisError::Interrupted {
            unprocessed: task.frame_ids.len(),
        };
        tracker.report_terminal(&task.job_id, JobStatus::Failed, Some(interrupted.to_string()));
    }
}

async fn run_job(task: BatchTask, processor: &Arc<dyn BatchProcessor>, tracker: &Arc<JobTracker>) {
    let job_id = task.job_id.clone();
    tracker.mark_running(&job_id);
    info!(job_id = %job_id, pipeline = %task.pipeline_id, frames = task.frame_ids.len(), "job started");

    let processor = Arc::clone(processor);
    let reporter = Arc::clone(tracker);
    let outcome =
        tokio::task::spawn_blocking(move || processor.process(&task, reporter.as_ref())).await;

    match outcome {
        Ok(Ok(())) => {
            let partial = tracker
                .get(&job_id)
                .is_some_and(|job| !job.failures.is_empty());
            let error = partial.then(|| PARTIAL_FAILURE.to_string());
            tracker.report_terminal(&job_id, JobStatus::Done, error);
        }
        Ok(Err(err)) => {
            error!(job_id = %job_id, error = %err, "job failed");
            tracker.report_terminal(&job_id, JobStatus::Failed, Some(err.to_string()));
        }
        Err(join_err) => {
            error!(job_id = %job_id, error = %join_err, "job panicked");
            tracker.report_terminal(
                &job_id,
                JobStatus::Failed,
                Some(format!("batch worker panicked: {join_err}")),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Marks each frame processed, failing the odd ones.
    struct Counting;

    impl BatchProcessor for Counting {
        fn process(&self, task: &BatchTask, reporter: &dyn JobReporter) -> Result<(), AnalysisError> {
            let total = task.frame_ids.len();
            for (i, frame_id) in task.frame_ids.iter().enumerate() {
                if frame_id % 2 == 1 {
                    reporter.report_failure(
                        &task.job_id,
                        FrameFailure::new(*frame_id, &AnalysisError::FrameNotFound(*frame_id)),
                    );
                }
                reporter.report_progress(&task.job_id, i + 1, Some(total));
            }
            Ok(())
        }
    }

    struct Broken;

    impl BatchProcessor for Broken {
        fn process(&self, _task: &BatchTask, _reporter: &dyn JobReporter) -> Result<(), AnalysisError> {
            Err(AnalysisError::Pipeline(pipeline::PipelineError::unavailable(
                "clip_vitb32",
                "weights missing",
            )))
        }
    }

    /// Spins until asked to stop.
    struct Stalling;

    impl BatchProcessor for Stalling {
        fn process(&self, task: &BatchTask, reporter: &dyn JobReporter) -> Result<(), AnalysisError> {
            while !reporter.stop_requested() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(AnalysisError::Interrupted {
                unprocessed: task.frame_ids.len(),
            })
        }
    }

    fn task(tracker: &JobTracker, frames: Vec<FrameId>) -> BatchTask {
        let record = tracker.create("clip_vitb32", Some(frames.len()));
        BatchTask {
            job_id: record.id,
            pipeline_id: "clip_vitb32".into(),
            frame_ids: frames,
        }
    }

    async fn wait_for<F>(tracker: &JobTracker, job_id: &str, done: F) -> JobRecord
    where
        F: Fn(&JobRecord) -> bool,
    {
        for _ in 0..400 {
            if let Some(job) = tracker.get(job_id) {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} did not reach the expected state");
    }

    #[tokio::test]
    async fn job_runs_to_done_with_partial_failures() {
        let tracker = Arc::new(JobTracker::new());
        let runner = JobRunner::start(Arc::new(Counting), Arc::clone(&tracker), 4);

        let clean = task(&tracker, vec![2, 4]);
        let partial = task(&tracker, vec![1, 2, 3]);
        assert_eq!(tracker.get(&clean.job_id).unwrap().status, JobStatus::Queued);
        let (clean_id, partial_id) = (clean.job_id.clone(), partial.job_id.clone());
        runner.enqueue(clean).unwrap();
        runner.enqueue(partial).unwrap();

        let job = wait_for(&tracker, &clean_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.processed, 2);
        assert!(job.error.is_none());

        let job = wait_for(&tracker, &partial_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!((job.processed, job.total), (3, Some(3)));
        assert_eq!(job.error.as_deref(), Some(PARTIAL_FAILURE));
        assert_eq!(job.failures.len(), 2);
        assert!(job.finished_at.is_some());

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn unrecoverable_error_fails_job() {
        let tracker = Arc::new(JobTracker::new());
        let runner = JobRunner::start(Arc::new(Broken), Arc::clone(&tracker), 4);
        let job = task(&tracker, vec![1]);
        let job_id = job.job_id.clone();
        runner.enqueue(job).unwrap();

        let job = wait_for(&tracker, &job_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("weights missing"));
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_running_and_queued_jobs() {
        let tracker = Arc::new(JobTracker::new());
        let runner = JobRunner::start(Arc::new(Stalling), Arc::clone(&tracker), 4);
        let first = task(&tracker, vec![1, 2, 3]);
        let second = task(&tracker, vec![4, 5]);
        let (first_id, second_id) = (first.job_id.clone(), second.job_id.clone());
        runner.enqueue(first).unwrap();
        runner.enqueue(second).unwrap();

        wait_for(&tracker, &first_id, |j| j.status == JobStatus::Running).await;
        runner.shutdown().await;

        let first = tracker.get(&first_id).unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert!(first.error.unwrap().contains("3 frame(s) unprocessed"));
        let second = tracker.get(&second_id).unwrap();
        assert_eq!(second.status, JobStatus::Failed);
        assert!(second.error.unwrap().contains("2 frame(s) unprocessed"));
    }

    #[test]
    fn terminal_state_is_final() {
        let tracker = JobTracker::new();
        let job = tracker.create("clip_vitb32", None);
        tracker.report_terminal(&job.id, JobStatus::Done, None);
        tracker.report_progress(&job.id, 5, Some(5));
        tracker.report_terminal(&job.id, JobStatus::Failed, Some("late".into()));
        let job = tracker.get(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.processed, 0);
        assert!(job.error.is_none());
    }

    #[test]
    fn oldest_finished_jobs_are_evicted_past_the_cap() {
        let tracker = JobTracker::with_max_finished(2);
        let running = tracker.create("clip_vitb32", Some(1));
        tracker.mark_running(&running.id);
        let queued = tracker.create("clip_vitb32", Some(1));

        let finished: Vec<String> = (0..4)
            .map(|i| {
                let job = tracker.create("clip_vitb32", Some(1));
                let status = if i % 2 == 0 { JobStatus::Done } else { JobStatus::Failed };
                tracker.report_terminal(&job.id, status, None);
                std::thread::sleep(Duration::from_millis(2));
                job.id
            })
            .collect();

        assert!(tracker.get(&finished[0]).is_none());
        assert!(tracker.get(&finished[1]).is_none());
        assert!(tracker.get(&finished[2]).is_some());
        assert!(tracker.get(&finished[3]).is_some());
        assert_eq!(tracker.get(&running.id).unwrap().status, JobStatus::Running);
        assert_eq!(tracker.get(&queued.id).unwrap().status, JobStatus::Queued);
        assert_eq!(tracker.list().len(), 4);
    }

    #[test]
    fn zero_cap_keeps_only_unfinished_jobs() {
        let tracker = JobTracker::with_max_finished(0);
        let open = tracker.create("clip_vitb32", None);
        let done = tracker.create("clip_vitb32", None);
        tracker.report_terminal(&done.id, JobStatus::Done, None);
        assert!(tracker.get(&done.id).is_none());
        assert!(tracker.get(&open.id).is_some());
    }

    #[test]
    fn full_queue_is_reported() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let tracker = Arc::new(JobTracker::new());
            let runner = JobRunner::start(Arc::new(Stalling), Arc::clone(&tracker), 1);
            // The worker has not run yet on a current-thread runtime, so the
            // second task finds the single slot taken.
            runner.enqueue(task(&tracker, vec![1])).unwrap();
            let err = runner.enqueue(task(&tracker, vec![2])).unwrap_err();
            assert_eq!(err.kind(), "job_queue");
            runner.shutdown().await;
        });
    }
}
