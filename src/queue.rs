//! Generation queue
//!
//! Serializes work against the single-tenant SD engine while presenting
//! concurrent job contracts. A min-heap keyed by (priority, enqueue order)
//! feeds one background worker; the worker drives the gateway, polls
//! progress, runs the optional censor pass, and routes output through the
//! upload router.
//!
//! Invariants: at most one job is running at any time; terminal transitions
//! are one-way; a cancelled job never exposes an artifact; progress is
//! monotonically non-decreasing until terminal.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::error::{EaselError, Result};
use crate::sd::{CensorConfig, SdGateway, Txt2ImgRequest};
use crate::upload::{UploadMeta, UploadRouter};

/// Terminal jobs retained for the history tool
pub const HISTORY_CAP: usize = 50;
/// Default priority; lower runs first
pub const DEFAULT_PRIORITY: i64 = 5;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// A generation request plus routing context
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub request: Txt2ImgRequest,
    pub user_id: Option<String>,
    pub title: Option<String>,
}

/// Output of a completed job
#[derive(Debug, Clone, Serialize)]
pub struct JobOutput {
    pub image_urls: Vec<String>,
    pub sink: String,
    pub censored: bool,
    pub info: String,
}

struct Job {
    id: String,
    prompt: String,
    priority: i64,
    state: JobState,
    progress: f64,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    request: JobRequest,
    output: Option<JobOutput>,
    error: Option<String>,
}

/// Read-only view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub prompt: String,
    pub priority: i64,
    pub state: JobState,
    pub progress: f64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub output: Option<JobOutput>,
    pub error: Option<String>,
}

impl Job {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            prompt: self.prompt.clone(),
            priority: self.priority,
            state: self.state,
            progress: self.progress,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            output: self.output.clone(),
            error: self.error.clone(),
        }
    }
}

/// Aggregate queue counters
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: Option<String>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct Inner {
    // Min-heap on (priority, enqueue sequence); cancelled entries are
    // skipped lazily on pop
    heap: BinaryHeap<Reverse<(i64, u64, String)>>,
    jobs: HashMap<String, Job>,
    running: Option<String>,
    seq: u64,
    history: VecDeque<String>,
}

/// Priority-scheduled generation queue
pub struct QueueEngine {
    inner: Mutex<Inner>,
    notify: Notify,
    gateway: Arc<SdGateway>,
}

impl QueueEngine {
    pub fn new(gateway: Arc<SdGateway>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                jobs: HashMap::new(),
                running: None,
                seq: 0,
                history: VecDeque::new(),
            }),
            notify: Notify::new(),
            gateway,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner state never panics while locked; a poisoned mutex here means
        // the process is already lost
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a job. Lower priority runs first; equal priorities run FIFO.
    pub fn enqueue(&self, request: JobRequest, priority: i64) -> String {
        let id = crate::new_id();
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner.jobs.insert(
            id.clone(),
            Job {
                id: id.clone(),
                prompt: request.request.prompt.clone(),
                priority,
                state: JobState::Queued,
                progress: 0.0,
                created_at: crate::now_ms(),
                started_at: None,
                finished_at: None,
                request,
                output: None,
                error: None,
            },
        );
        inner.heap.push(Reverse((priority, seq, id.clone())));
        drop(inner);
        self.notify.notify_one();
        id
    }

    /// Snapshot one job
    pub fn get(&self, job_id: &str) -> Result<JobSnapshot> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|j| j.snapshot())
            .ok_or_else(|| EaselError::NotFound(format!("job '{}'", job_id)))
    }

    /// Snapshot the currently running job, if any
    pub fn current(&self) -> Option<JobSnapshot> {
        let inner = self.lock();
        inner
            .running
            .as_ref()
            .and_then(|id| inner.jobs.get(id))
            .map(|j| j.snapshot())
    }

    /// List jobs, optionally filtered by state
    pub fn list(&self, filter: Option<JobState>) -> Vec<JobSnapshot> {
        let inner = self.lock();
        let mut jobs: Vec<JobSnapshot> = inner
            .jobs
            .values()
            .filter(|j| filter.map(|f| j.state == f).unwrap_or(true))
            .map(|j| j.snapshot())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Terminal jobs, newest first, up to the retention cap
    pub fn history(&self, limit: usize) -> Vec<JobSnapshot> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .map(|j| j.snapshot())
            .take(limit.min(HISTORY_CAP))
            .collect()
    }

    /// Aggregate counters
    pub fn status(&self) -> QueueStatus {
        let inner = self.lock();
        let mut status = QueueStatus {
            queued: 0,
            running: inner.running.clone(),
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        for job in inner.jobs.values() {
            match job.state {
                JobState::Queued => status.queued += 1,
                JobState::Running => {}
                JobState::Completed => status.completed += 1,
                JobState::Failed => status.failed += 1,
                JobState::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    /// Cancel a job. Queued jobs are removed immediately; running jobs get
    /// an engine interrupt and are marked cancelled — any image returned
    /// after the interrupt is discarded by the worker.
    pub async fn cancel(&self, job_id: &str) -> Result<JobState> {
        let was_running = {
            let mut inner = self.lock();
            let state = inner
                .jobs
                .get(job_id)
                .map(|j| j.state)
                .ok_or_else(|| EaselError::NotFound(format!("job '{}'", job_id)))?;

            match state {
                JobState::Queued => {
                    let job = inner.jobs.get_mut(job_id).unwrap();
                    job.state = JobState::Cancelled;
                    job.finished_at = Some(crate::now_ms());
                    Self::push_history(&mut inner, job_id);
                    false
                }
                JobState::Running => {
                    let job = inner.jobs.get_mut(job_id).unwrap();
                    job.state = JobState::Cancelled;
                    job.finished_at = Some(crate::now_ms());
                    true
                }
                state => {
                    return Err(EaselError::Validation(format!(
                        "job '{}' is already {}",
                        job_id,
                        state.as_str()
                    )))
                }
            }
        };

        if was_running {
            if let Err(e) = self.gateway.interrupt().await {
                warn!("interrupt after cancel failed: {}", e);
            }
        }

        Ok(JobState::Cancelled)
    }

    fn push_history(inner: &mut Inner, job_id: &str) {
        inner.history.push_front(job_id.to_string());
        while inner.history.len() > HISTORY_CAP {
            if let Some(evicted) = inner.history.pop_back() {
                inner.jobs.remove(&evicted);
            }
        }
    }

    /// Pop the next runnable job and mark it running
    fn take_next(&self) -> Option<(String, JobRequest)> {
        let mut inner = self.lock();
        if inner.running.is_some() {
            return None;
        }
        while let Some(Reverse((_, _, id))) = inner.heap.pop() {
            let runnable = matches!(
                inner.jobs.get(&id).map(|j| j.state),
                Some(JobState::Queued)
            );
            if !runnable {
                continue; // cancelled while queued
            }
            let job = inner.jobs.get_mut(&id).unwrap();
            job.state = JobState::Running;
            job.started_at = Some(crate::now_ms());
            let request = job.request.clone();
            inner.running = Some(id.clone());
            return Some((id, request));
        }
        None
    }

    fn record_progress(&self, job_id: &str, progress: f64) {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            if job.state == JobState::Running {
                // Monotonic until terminal
                job.progress = job.progress.max(progress.clamp(0.0, 1.0));
            }
        }
    }

    fn finish(&self, job_id: &str, outcome: Result<JobOutput>) {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return;
        };

        if job.state == JobState::Cancelled {
            // Interrupted mid-flight; discard whatever came back
            job.output = None;
        } else {
            match outcome {
                Ok(output) => {
                    job.state = JobState::Completed;
                    job.progress = 1.0;
                    job.output = Some(output);
                }
                Err(e) => {
                    job.state = JobState::Failed;
                    job.error = Some(format!("[{}] {}", e.kind(), e));
                }
            }
        }
        job.finished_at.get_or_insert(crate::now_ms());
        inner.running = None;
        Self::push_history(&mut inner, job_id);
        drop(inner);
        self.notify.notify_one();
    }

    /// Fail whatever job is marked running. Used when the worker loop dies
    /// out from under it, so the job does not sit in `running` forever.
    fn fail_running(&self, reason: &str) {
        let mut inner = self.lock();
        let Some(id) = inner.running.take() else {
            return;
        };
        if let Some(job) = inner.jobs.get_mut(&id) {
            if !job.state.is_terminal() {
                job.state = JobState::Failed;
                job.error = Some(format!("[internal] {}", reason));
            }
            job.finished_at.get_or_insert(crate::now_ms());
        }
        Self::push_history(&mut inner, &id);
        drop(inner);
        self.notify.notify_one();
    }
}

/// Spawn the single background worker.
///
/// The worker owns the engine's txt2img path exclusively. Errors and panics
/// inside a job mark that job failed and the loop continues; if the loop
/// itself ever dies, the supervisor restarts it. The queue is never lost.
pub fn spawn_worker(
    engine: Arc<QueueEngine>,
    gateway: Arc<SdGateway>,
    uploader: Arc<UploadRouter>,
    censor: Option<CensorConfig>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let loop_handle = tokio::spawn(worker_loop(
                engine.clone(),
                gateway.clone(),
                uploader.clone(),
                censor.clone(),
            ));
            match loop_handle.await {
                Err(e) if e.is_panic() => {
                    error!("queue worker panicked, restarting");
                    engine.fail_running("worker panicked");
                }
                _ => break,
            }
        }
    })
}

async fn worker_loop(
    engine: Arc<QueueEngine>,
    gateway: Arc<SdGateway>,
    uploader: Arc<UploadRouter>,
    censor: Option<CensorConfig>,
) {
    loop {
        let notified = engine.notify.notified();
        let Some((job_id, request)) = engine.take_next() else {
            notified.await;
            continue;
        };

        info!(job = %job_id, "starting generation");

        // Per-job work runs on its own task so a panic inside it fails the
        // job instead of killing the loop
        let job_task = tokio::spawn(run_job(
            engine.clone(),
            gateway.clone(),
            uploader.clone(),
            censor.clone(),
            job_id.clone(),
            request,
        ));
        let outcome = match job_task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                Err(EaselError::Internal("job processing panicked".to_string()))
            }
            Err(_) => Err(EaselError::Internal("job task aborted".to_string())),
        };
        if let Err(e) = &outcome {
            error!(job = %job_id, "generation failed: {}", e);
        }
        engine.finish(&job_id, outcome);
    }
}

async fn run_job(
    engine: Arc<QueueEngine>,
    gateway: Arc<SdGateway>,
    uploader: Arc<UploadRouter>,
    censor: Option<CensorConfig>,
    job_id: String,
    request: JobRequest,
) -> Result<JobOutput> {
    // Progress poller runs alongside the generation call
    let done = Arc::new(AtomicBool::new(false));
    let poller = {
        let engine = engine.clone();
        let gateway = gateway.clone();
        let done = done.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;
                if done.load(Ordering::SeqCst) {
                    break;
                }
                // Also stop if the job went terminal without us, e.g. the
                // job task panicked and never flipped the flag
                match engine.get(&job_id) {
                    Ok(snapshot) if !snapshot.state.is_terminal() => {}
                    _ => break,
                }
                if let Ok(progress) = gateway.progress().await {
                    engine.record_progress(&job_id, progress.progress);
                }
            }
        })
    };

    let generated = gateway.txt2img(&request.request).await;
    done.store(true, Ordering::SeqCst);
    poller.abort();

    let generated = generated?;

    // Bail before post-processing if the job was cancelled mid-flight
    if engine.get(&job_id)?.state == JobState::Cancelled {
        return Err(EaselError::Internal("job cancelled".to_string()));
    }

    // Optional censor pass; unavailability falls back to the original image
    let mut censored_any = false;
    let mut images = Vec::with_capacity(generated.images.len());
    for image in generated.images {
        match &censor {
            Some(config) => match gateway.censor(&image, config).await {
                Ok(outcome) if outcome.has_nsfw => {
                    censored_any = true;
                    images.push(outcome.censored.unwrap_or(image));
                }
                Ok(_) => images.push(image),
                Err(e) => {
                    warn!("censor pass unavailable, using original image: {}", e);
                    images.push(image);
                }
            },
            None => images.push(image),
        }
    }

    // Route each image through the sink pipeline
    let mut image_urls = Vec::with_capacity(images.len());
    let mut sink = String::new();
    for image in &images {
        let outcome = uploader
            .upload(
                image,
                &UploadMeta {
                    extension: "png".to_string(),
                    title: request.title.clone(),
                    description: Some(format!("prompt: {}", request.request.prompt)),
                    user_id: request.user_id.clone(),
                },
            )
            .await?;
        sink = outcome.sink.clone();
        image_urls.push(outcome.url);
    }

    Ok(JobOutput {
        image_urls,
        sink,
        censored: censored_any,
        info: generated.info,
    })
}
