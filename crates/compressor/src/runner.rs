//! Single-job runner.
//!
//! A runner takes one job from Probing to a terminal outcome and reports
//! everything it learns as a stream of `RunnerEvent`s. The stream ends after
//! `RunnerEvent::Finished`; a runner cannot be restarted.

use crate::config::Container;
use crate::engine::{classify_engine_failure, EngineExit, EngineProgress, TranscodeEngine, TranscodeRequest};
use crate::error::{CompressError, ErrorKind, JobFailure};
use crate::finalize::{move_into_place, remove_partial};
use crate::job::{JobId, JobState};
use crate::plan::{CompressionTarget, EncodePlan, PlanBuilder};
use crate::probe::{MediaProber, SourceMedia};
use crate::verify::{check_duration, check_output};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Events buffered between a runner and its consumer
const EVENT_BUFFER: usize = 64;

/// Highest fraction engine progress may report; 1.0 is emitted only once
/// the output has been verified and moved into place.
const ENGINE_PROGRESS_CEILING: f32 = 0.99;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub fraction: f32,
    /// Non-fatal condition reported alongside this update
    pub error: Option<JobFailure>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { output: PathBuf, size_bytes: u64 },
    Failed(CompressError),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    State(JobState),
    Probed(SourceMedia),
    Planned(EncodePlan),
    Progress(ProgressEvent),
    /// Always the last event
    Finished(JobOutcome),
}

/// Collaborators shared by every runner
#[derive(Clone)]
pub struct RunnerContext {
    pub prober: Arc<dyn MediaProber>,
    pub engine: Arc<dyn TranscodeEngine>,
    pub planner: Arc<PlanBuilder>,
    pub temp_dir: PathBuf,
    /// Minimum spacing between forwarded progress updates
    pub progress_interval: Duration,
    /// Allowed output/source duration drift, as a fraction
    pub duration_tolerance: f64,
}

/// Rate-limits engine progress into non-decreasing `ProgressEvent`s.
///
/// Updates carrying an error always pass.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_fraction: f32,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_fraction: 0.0,
        }
    }

    pub fn offer(&mut self, progress: EngineProgress) -> Option<ProgressEvent> {
        self.offer_at(progress, Instant::now())
    }

    pub fn offer_at(&mut self, progress: EngineProgress, now: Instant) -> Option<ProgressEvent> {
        let fraction = (progress.fraction as f32)
            .clamp(0.0, ENGINE_PROGRESS_CEILING)
            .max(self.last_fraction);

        let error = progress.error.map(|message| JobFailure {
            kind: ErrorKind::NativeEngineFailure,
            message,
            retryable: true,
        });

        let due = match self.last_emit {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        };

        if error.is_none() && (!due || fraction <= self.last_fraction) {
            return None;
        }

        self.last_emit = Some(now);
        self.last_fraction = fraction;
        Some(ProgressEvent { fraction, error })
    }
}

pub struct JobRunner {
    ctx: RunnerContext,
    id: JobId,
    input: PathBuf,
    target: CompressionTarget,
    destination: PathBuf,
}

impl JobRunner {
    pub fn new(
        ctx: RunnerContext,
        id: JobId,
        input: PathBuf,
        target: CompressionTarget,
        destination: PathBuf,
    ) -> Self {
        Self {
            ctx,
            id,
            input,
            target,
            destination,
        }
    }

    /// Start the job and return its event stream.
    ///
    /// Consumes the runner, so a job runs at most once per runner. The
    /// stream always ends with `Finished`, even if a prober or engine
    /// panics mid-run.
    pub fn run(self, cancel: CancellationToken) -> ReceiverStream<RunnerEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let id = self.id;
        let temp_dir = self.ctx.temp_dir.clone();

        let events = tx.clone();
        let job = tokio::spawn(async move { self.execute(&events, &cancel).await });

        tokio::spawn(async move {
            let outcome = match job.await {
                Ok(Ok((output, size_bytes))) => {
                    info!(
                        "Job {} completed: {} ({} bytes)",
                        id,
                        output.display(),
                        size_bytes
                    );
                    JobOutcome::Completed { output, size_bytes }
                }
                Ok(Err(CompressError::Cancelled)) => {
                    info!("Job {} cancelled", id);
                    JobOutcome::Cancelled
                }
                Ok(Err(e)) => {
                    error!("Job {} failed: {}", id, e);
                    JobOutcome::Failed(e)
                }
                Err(e) => {
                    error!("Job {} runner ended unexpectedly: {}", id, e);
                    for container in [Container::Mp4, Container::Mkv] {
                        remove_partial(&partial_path(&temp_dir, id, container));
                    }
                    JobOutcome::Failed(CompressError::NativeEngineFailure {
                        code: None,
                        message: format!("runner ended unexpectedly: {}", e),
                    })
                }
            };
            let _ = tx.send(RunnerEvent::Finished(outcome)).await;
        });

        ReceiverStream::new(rx)
    }

    async fn execute(
        &self,
        tx: &mpsc::Sender<RunnerEvent>,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u64), CompressError> {
        if cancel.is_cancelled() {
            return Err(CompressError::Cancelled);
        }

        emit(tx, RunnerEvent::State(JobState::Probing)).await;
        info!("Job {} probing {}", self.id, self.input.display());
        let source = tokio::select! {
            _ = cancel.cancelled() => return Err(CompressError::Cancelled),
            probed = self.ctx.prober.probe(&self.input) => probed?,
        };
        emit(tx, RunnerEvent::Probed(source.clone())).await;

        emit(tx, RunnerEvent::State(JobState::Planning)).await;
        let plan = self.ctx.planner.build_plan(&source, self.target)?;
        info!(
            "Job {} planned {} {} at {} bps video, ~{} bytes",
            self.id,
            plan.video_codec.as_str(),
            plan.resolution,
            plan.video_bitrate_bps,
            plan.estimated_size_bytes
        );
        emit(tx, RunnerEvent::Planned(plan.clone())).await;

        if cancel.is_cancelled() {
            return Err(CompressError::Cancelled);
        }

        tokio::fs::create_dir_all(&self.ctx.temp_dir)
            .await
            .map_err(|e| CompressError::io("creating temp directory", &e))?;
        let temp = partial_path(&self.ctx.temp_dir, self.id, plan.container);

        emit(tx, RunnerEvent::State(JobState::Running)).await;
        emit(
            tx,
            RunnerEvent::Progress(ProgressEvent {
                fraction: 0.0,
                error: None,
            }),
        )
        .await;

        let result = self.transcode(tx, cancel, &source, plan, &temp).await;
        if result.is_err() {
            remove_partial(&temp);
        }
        result
    }

    async fn transcode(
        &self,
        tx: &mpsc::Sender<RunnerEvent>,
        cancel: &CancellationToken,
        source: &SourceMedia,
        plan: EncodePlan,
        temp: &Path,
    ) -> Result<(PathBuf, u64), CompressError> {
        let container = plan.container;
        let request = TranscodeRequest {
            input: self.input.clone(),
            output: temp.to_path_buf(),
            plan,
            duration_ms: source.duration_ms,
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(&self.ctx.engine);
        let engine_cancel = cancel.clone();
        let mut transcode =
            Box::pin(async move { engine.transcode(&request, progress_tx, engine_cancel).await });

        let mut throttle = ProgressThrottle::new(self.ctx.progress_interval);
        let exit = loop {
            tokio::select! {
                exit = &mut transcode => break exit,
                Some(update) = progress_rx.recv() => {
                    if let Some(event) = throttle.offer(update) {
                        debug!("Job {} progress {:.3}", self.id, event.fraction);
                        emit(tx, RunnerEvent::Progress(event)).await;
                    }
                }
            }
        };

        match exit {
            EngineExit::Success => {}
            EngineExit::Cancelled => return Err(CompressError::Cancelled),
            EngineExit::Failed { .. } if cancel.is_cancelled() => {
                return Err(CompressError::Cancelled)
            }
            EngineExit::Failed { code, message } => {
                return Err(classify_engine_failure(code, &message))
            }
        }

        if cancel.is_cancelled() {
            return Err(CompressError::Cancelled);
        }

        let checked = temp.to_path_buf();
        let size_bytes = tokio::task::spawn_blocking(move || check_output(&checked, container))
            .await
            .map_err(|e| CompressError::Io {
                context: "verifying output".to_string(),
                message: e.to_string(),
            })??;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(CompressError::Cancelled),
            probed = self.ctx.prober.probe(temp) => probed.map_err(|e| {
                CompressError::VerificationFailed(format!("output could not be probed: {}", e))
            })?,
        };
        check_duration(
            source.duration_ms,
            output.duration_ms,
            self.ctx.duration_tolerance,
        )?;

        if cancel.is_cancelled() {
            return Err(CompressError::Cancelled);
        }

        let from = temp.to_path_buf();
        let dest = self.destination.clone();
        tokio::task::spawn_blocking(move || move_into_place(&from, &dest))
            .await
            .map_err(|e| CompressError::Io {
                context: "moving output into place".to_string(),
                message: e.to_string(),
            })?
            .map_err(|e| CompressError::Io {
                context: "moving output into place".to_string(),
                message: e.to_string(),
            })?;

        emit(
            tx,
            RunnerEvent::Progress(ProgressEvent {
                fraction: 1.0,
                error: None,
            }),
        )
        .await;

        Ok((self.destination.clone(), size_bytes))
    }
}

/// Where a job's output is written before verification
fn partial_path(temp_dir: &Path, id: JobId, container: Container) -> PathBuf {
    temp_dir.join(format!("{}.partial.{}", id, container.extension()))
}

/// Send an event; a dropped consumer does not stop the job
async fn emit(tx: &mpsc::Sender<RunnerEvent>, event: RunnerEvent) {
    if tx.send(event).await.is_err() {
        debug!("Runner event dropped, consumer is gone");
    }
}
