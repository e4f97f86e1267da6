//! Video Compressor
//!
//! Job pipeline that probes a video, derives an encode plan from a quality
//! or size target, drives a native transcoder and tracks jobs for a host UI.

pub mod concurrency;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod history;
pub mod job;
pub mod manager;
pub mod plan;
pub mod probe;
pub mod runner;
pub mod server;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use video_compressor_config as config;
pub use video_compressor_config::Config;
pub use concurrency::ConcurrencyPlan;
pub use engine::{
    EngineError, EngineExit, EngineLease, EngineProgress, EngineRuntime, FfmpegEngine,
    TranscodeEngine, TranscodeRequest,
};
pub use error::{CompressError, ErrorKind, JobFailure};
pub use job::{Job, JobId, JobState};
pub use manager::{CancelOutcome, JobManager, JobStats, ManagerError};
pub use plan::{build_plan, CompressionTarget, EncodePlan, PlanBuilder, QualityLevel};
pub use probe::{FfprobeProber, MediaProber, Resolution, SourceMedia};
pub use runner::{JobOutcome, JobRunner, ProgressEvent, RunnerContext, RunnerEvent};
pub use server::{create_router, run_server, ServerError};
