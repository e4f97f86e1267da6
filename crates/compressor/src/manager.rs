//! Job manager.
//!
//! A single dispatcher task owns every job record. The public API sends it
//! commands over an mpsc channel; runner events reach it the same way. After
//! each change the dispatcher publishes a snapshot into a shared table that
//! `query`/`list` read, and broadcasts it to subscribers.

use crate::concurrency::ConcurrencyPlan;
use crate::config::{Config, JobsConfig};
use crate::engine::{EngineError, EngineLease, EngineRuntime, FfmpegEngine};
use crate::error::{CompressError, JobFailure};
use crate::finalize::unique_destination;
use crate::history::JobHistory;
use crate::job::{Job, JobId, JobState};
use crate::plan::{CompressionTarget, PlanBuilder};
use crate::probe::{FfprobeProber, MediaProber};
use crate::runner::{JobOutcome, JobRunner, RunnerContext, RunnerEvent};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 256;
const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Submission rejected: {0}")]
    Rejected(#[from] CompressError),

    #[error("Job manager is shutting down")]
    ShuttingDown,

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was pending and is now Cancelled
    Cancelled,
    /// The job is active; its runner has been told to stop
    Cancelling,
    /// The job had already reached a terminal state
    AlreadyFinished,
}

/// Counts over the job table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent_jobs: u32,
}

enum Command {
    Submit {
        input: PathBuf,
        target: CompressionTarget,
        output: Option<PathBuf>,
        reply: oneshot::Sender<Result<JobId, ManagerError>>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<Result<CancelOutcome, ManagerError>>,
    },
    Runner {
        id: JobId,
        event: RunnerEvent,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct JobManager {
    commands: mpsc::Sender<Command>,
    table: Arc<RwLock<HashMap<JobId, Job>>>,
    updates: broadcast::Sender<Job>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    concurrency: ConcurrencyPlan,
}

impl JobManager {
    /// Start the dispatcher.
    ///
    /// Takes an engine lease for the manager's lifetime, so the engine is
    /// initialized here and shut down once the dispatcher exits. Finished
    /// jobs from `jobs.state_dir` are loaded into the table.
    pub async fn start(
        config: &Config,
        runtime: Arc<EngineRuntime>,
        prober: Arc<dyn MediaProber>,
    ) -> Result<Self, ManagerError> {
        let lease = tokio::task::spawn_blocking(move || runtime.acquire())
            .await
            .map_err(|e| EngineError::Unavailable(format!("engine initialization aborted: {}", e)))??;
        let concurrency = ConcurrencyPlan::derive(&config.jobs);

        let planner = PlanBuilder::new(config.plan.clone()).with_threads(concurrency.threads_per_job);
        let ctx = RunnerContext {
            prober,
            engine: lease.engine(),
            planner: Arc::new(planner),
            temp_dir: config.jobs.temp_dir.clone(),
            progress_interval: Duration::from_millis(config.engine.progress_interval_ms),
            duration_tolerance: config.jobs.duration_tolerance,
        };

        let history = config.jobs.state_dir.clone().map(JobHistory::new);
        let mut jobs = HashMap::new();
        if let Some(history) = history.clone() {
            let dir = history.dir().to_path_buf();
            match tokio::task::spawn_blocking(move || history.load()).await {
                Ok(Ok(loaded)) => {
                    info!("Loaded {} finished jobs from {}", loaded.len(), dir.display());
                    jobs.extend(loaded.into_iter().map(|job| (job.id, job)));
                }
                Ok(Err(e)) => warn!("Failed to load job history: {}", e),
                Err(e) => warn!("Job history load aborted: {}", e),
            }
        }

        let table = Arc::new(RwLock::new(jobs.clone()));
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let dispatcher = Dispatcher {
            ctx,
            jobs_config: config.jobs.clone(),
            extension: config.plan.container.extension(),
            max_active: concurrency.max_concurrent_jobs.max(1) as usize,
            jobs,
            pending: VecDeque::new(),
            active: HashMap::new(),
            reserved: HashSet::new(),
            table: Arc::clone(&table),
            updates: updates.clone(),
            history,
            commands: commands.downgrade(),
            shutdown_replies: Vec::new(),
            _lease: lease,
        };
        let handle = tokio::spawn(dispatcher.run(rx));

        info!(
            "Job manager started: {} concurrent jobs, {} threads each",
            concurrency.max_concurrent_jobs, concurrency.threads_per_job
        );

        Ok(Self {
            commands,
            table,
            updates,
            dispatcher: Mutex::new(Some(handle)),
            concurrency,
        })
    }

    /// Start with the ffmpeg engine and ffprobe prober from `config.engine`
    pub async fn with_ffmpeg(config: &Config) -> Result<Self, ManagerError> {
        let runtime = EngineRuntime::new(Arc::new(FfmpegEngine::new(&config.engine)));
        let prober = Arc::new(FfprobeProber::new(config.engine.ffprobe_path.clone()));
        Self::start(config, runtime, prober).await
    }

    pub fn concurrency(&self) -> ConcurrencyPlan {
        self.concurrency
    }

    /// Queue a job; the output lands next to the input (or in
    /// `jobs.output_dir`) under a name that does not collide.
    pub async fn submit(
        &self,
        input: impl Into<PathBuf>,
        target: CompressionTarget,
    ) -> Result<JobId, ManagerError> {
        self.submit_with_output(input, target, None).await
    }

    /// Queue a job with an explicit output path
    pub async fn submit_with_output(
        &self,
        input: impl Into<PathBuf>,
        target: CompressionTarget,
        output: Option<PathBuf>,
    ) -> Result<JobId, ManagerError> {
        let input = input.into();
        validate_submission(&input, &target).await?;

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                input,
                target,
                output,
                reply,
            })
            .await
            .map_err(|_| ManagerError::ShuttingDown)?;
        rx.await.map_err(|_| ManagerError::ShuttingDown)?
    }

    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel { id, reply })
            .await
            .map_err(|_| ManagerError::ShuttingDown)?;
        rx.await.map_err(|_| ManagerError::ShuttingDown)?
    }

    /// Latest published snapshot of a job
    pub async fn query(&self, id: JobId) -> Result<Job, ManagerError> {
        self.table
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ManagerError::JobNotFound(id))
    }

    /// Every job, oldest first
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.table.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Receive every job snapshot the dispatcher publishes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Job> {
        self.updates.subscribe()
    }

    pub async fn stats(&self) -> JobStats {
        let table = self.table.read().await;
        let mut stats = JobStats {
            total: table.len(),
            max_concurrent_jobs: self.concurrency.max_concurrent_jobs,
            ..JobStats::default()
        };
        for job in table.values() {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Probing | JobState::Planning | JobState::Running => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Wait until `id` reaches a terminal state
    pub async fn wait(&self, id: JobId) -> Result<Job, ManagerError> {
        let mut updates = self.subscribe();
        let job = self.query(id).await?;
        if job.is_terminal() {
            return Ok(job);
        }

        loop {
            match updates.recv().await {
                Ok(job) if job.id == id && job.is_terminal() => return Ok(job),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let job = self.query(id).await?;
                    if job.is_terminal() {
                        return Ok(job);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return self.query(id).await,
            }
        }
    }

    /// Cancel everything, wait for active runners to finish and stop the
    /// dispatcher. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Job dispatcher ended abnormally: {}", e);
            }
        }
        info!("Job manager stopped");
        Ok(())
    }
}

/// Checks that can fail synchronously at submit time
async fn validate_submission(input: &Path, target: &CompressionTarget) -> Result<(), CompressError> {
    if let CompressionTarget::TargetSize { bytes: 0 } = target {
        return Err(CompressError::InfeasiblePlan(
            "target size must be greater than zero".to_string(),
        ));
    }

    match tokio::fs::metadata(input).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(CompressError::UnreadableMedia {
            path: input.to_path_buf(),
            reason: "not a regular file".to_string(),
        }),
        Err(e) => Err(CompressError::UnreadableMedia {
            path: input.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Pick the output path for a new job.
///
/// An explicit path must not exist or be claimed; otherwise a free name is
/// derived from the input. Checks the filesystem, so callers run it on the
/// blocking pool.
fn resolve_destination(
    input: &Path,
    output: Option<PathBuf>,
    jobs: &JobsConfig,
    extension: &str,
    reserved: &HashSet<PathBuf>,
) -> Result<PathBuf, CompressError> {
    if let Some(path) = output {
        if path.exists() || reserved.contains(&path) {
            return Err(CompressError::Io {
                context: "reserving output path".to_string(),
                message: format!("{} already exists", path.display()),
            });
        }
        return Ok(path);
    }

    let dir = jobs
        .output_dir
        .clone()
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());

    Ok(unique_destination(
        &dir,
        &stem,
        &jobs.output_suffix,
        extension,
        |p| p.exists() || reserved.contains(p),
    ))
}

struct Dispatcher {
    ctx: RunnerContext,
    jobs_config: JobsConfig,
    extension: &'static str,
    max_active: usize,
    jobs: HashMap<JobId, Job>,
    /// FIFO of jobs waiting for a slot
    pending: VecDeque<JobId>,
    active: HashMap<JobId, CancellationToken>,
    /// Destinations claimed by unfinished jobs
    reserved: HashSet<PathBuf>,
    table: Arc<RwLock<HashMap<JobId, Job>>>,
    updates: broadcast::Sender<Job>,
    history: Option<JobHistory>,
    commands: mpsc::WeakSender<Command>,
    shutdown_replies: Vec<oneshot::Sender<()>>,
    _lease: EngineLease,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit {
                    input,
                    target,
                    output,
                    reply,
                } => {
                    let result = self.submit(input, target, output).await;
                    let _ = reply.send(result);
                }
                Command::Cancel { id, reply } => {
                    let result = self.cancel(id).await;
                    let _ = reply.send(result);
                }
                Command::Runner { id, event } => self.on_runner_event(id, event).await,
                Command::Shutdown { reply } => {
                    self.shutdown_replies.push(reply);
                    self.begin_shutdown().await;
                }
            }

            if !self.shutdown_replies.is_empty() && self.active.is_empty() {
                break;
            }
        }

        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        debug!("Job dispatcher exiting");
    }

    fn shutting_down(&self) -> bool {
        !self.shutdown_replies.is_empty()
    }

    async fn submit(
        &mut self,
        input: PathBuf,
        target: CompressionTarget,
        output: Option<PathBuf>,
    ) -> Result<JobId, ManagerError> {
        if self.shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }

        let reserved = self.reserved.clone();
        let jobs_config = self.jobs_config.clone();
        let extension = self.extension;
        let requested = input.clone();
        let destination = tokio::task::spawn_blocking(move || {
            resolve_destination(&requested, output, &jobs_config, extension, &reserved)
        })
        .await
        .map_err(|e| CompressError::Io {
            context: "reserving output path".to_string(),
            message: e.to_string(),
        })??;
        self.reserved.insert(destination.clone());

        let id = JobId::new();
        let mut job = Job::new(id, input, target);
        job.output_path = Some(destination);
        info!(
            "Job {} queued for {} ({} ahead)",
            id,
            job.input_path.display(),
            self.pending.len()
        );

        self.jobs.insert(id, job);
        self.pending.push_back(id);
        self.publish(id).await;
        self.start_next().await;
        Ok(id)
    }

    async fn cancel(&mut self, id: JobId) -> Result<CancelOutcome, ManagerError> {
        let state = self
            .jobs
            .get(&id)
            .map(|j| j.state)
            .ok_or(ManagerError::JobNotFound(id))?;

        if state.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }

        if let Some(token) = self.active.get(&id) {
            info!("Cancelling running job {}", id);
            token.cancel();
            return Ok(CancelOutcome::Cancelling);
        }

        self.cancel_pending(id).await;
        Ok(CancelOutcome::Cancelled)
    }

    /// Cancel a job that never got a runner
    async fn cancel_pending(&mut self, id: JobId) {
        self.pending.retain(|p| *p != id);
        if let Some(job) = self.jobs.get_mut(&id) {
            if job.transition(JobState::Cancelled) {
                if let Some(dest) = job.output_path.take() {
                    self.reserved.remove(&dest);
                }
                info!("Cancelled pending job {}", id);
            }
        }
        self.publish(id).await;
    }

    async fn begin_shutdown(&mut self) {
        info!(
            "Shutting down job manager: {} pending, {} active",
            self.pending.len(),
            self.active.len()
        );
        let pending: Vec<JobId> = self.pending.iter().copied().collect();
        for id in pending {
            self.cancel_pending(id).await;
        }
        for token in self.active.values() {
            token.cancel();
        }
    }

    async fn on_runner_event(&mut self, id: JobId, event: RunnerEvent) {
        let Some(job) = self.jobs.get_mut(&id) else {
            warn!("Event for unknown job {}", id);
            return;
        };

        let changed = match event {
            RunnerEvent::State(state) => {
                let moved = job.transition(state);
                if moved {
                    debug!("Job {} is {}", id, state);
                }
                moved
            }
            RunnerEvent::Probed(source) => {
                job.source = Some(source);
                job.touch();
                true
            }
            RunnerEvent::Planned(plan) => {
                job.plan = Some(plan);
                job.touch();
                true
            }
            RunnerEvent::Progress(progress) => {
                if let Some(note) = &progress.error {
                    warn!("Job {} engine reported: {}", id, note.message);
                }
                job.record_progress(progress.fraction)
            }
            RunnerEvent::Finished(outcome) => {
                let destination = job.output_path.clone();
                let moved = match outcome {
                    JobOutcome::Completed { output, size_bytes } => {
                        job.output_path = Some(output);
                        job.output_size_bytes = Some(size_bytes);
                        job.transition(JobState::Completed)
                    }
                    JobOutcome::Failed(err) => {
                        job.output_path = None;
                        job.fail(JobFailure::from(&err))
                    }
                    JobOutcome::Cancelled => {
                        job.output_path = None;
                        job.transition(JobState::Cancelled)
                    }
                };
                if let Some(dest) = destination {
                    self.reserved.remove(&dest);
                }
                self.active.remove(&id);
                moved
            }
        };

        if changed {
            self.publish(id).await;
        }
        self.start_next().await;
    }

    /// Fill free slots from the head of the queue
    async fn start_next(&mut self) {
        while self.active.len() < self.max_active && !self.shutting_down() {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            let Some(job) = self.jobs.get(&id) else {
                continue;
            };
            let Some(destination) = job.output_path.clone() else {
                continue;
            };
            if job.state != JobState::Pending {
                continue;
            }
            let Some(commands) = self.commands.upgrade() else {
                warn!("Command channel closed, not starting job {}", id);
                break;
            };

            let cancel = CancellationToken::new();
            let runner = JobRunner::new(
                self.ctx.clone(),
                id,
                job.input_path.clone(),
                job.target,
                destination,
            );
            let mut events = runner.run(cancel.clone());
            self.active.insert(id, cancel);
            info!("Job {} started ({} active)", id, self.active.len());

            tokio::spawn(async move {
                let mut finished = false;
                while let Some(event) = events.next().await {
                    finished |= matches!(event, RunnerEvent::Finished(_));
                    if commands.send(Command::Runner { id, event }).await.is_err() {
                        return;
                    }
                }
                if !finished {
                    warn!("Runner for job {} stopped without an outcome", id);
                    let event = RunnerEvent::Finished(JobOutcome::Failed(
                        CompressError::NativeEngineFailure {
                            code: None,
                            message: "runner ended unexpectedly".to_string(),
                        },
                    ));
                    let _ = commands.send(Command::Runner { id, event }).await;
                }
            });
        }
    }

    /// Copy a job into the shared table, broadcast it and persist it if it
    /// just finished
    async fn publish(&self, id: JobId) {
        let Some(job) = self.jobs.get(&id).cloned() else {
            return;
        };

        if let (true, Some(history)) = (job.is_terminal(), self.history.clone()) {
            let snapshot = job.clone();
            match tokio::task::spawn_blocking(move || history.save(&snapshot)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to save job {} to history: {}", id, e),
                Err(e) => warn!("Saving job {} to history aborted: {}", id, e),
            }
        }

        self.table.write().await.insert(id, job.clone());
        let _ = self.updates.send(job);
    }
}
