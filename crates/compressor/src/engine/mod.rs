//! Transcoding engine adapter
//!
//! The pipeline talks to the native transcoder through `TranscodeEngine`.
//! `FfmpegEngine` drives an ffmpeg binary; tests substitute a fake.

mod ffmpeg;
mod runtime;

pub use ffmpeg::{build_ffmpeg_command, parse_ffmpeg_version, FfmpegEngine, ProgressParser};
pub use runtime::{EngineLease, EngineRuntime};

use crate::error::CompressError;
use crate::plan::EncodePlan;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One transcode invocation
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    /// Temporary output location; the runner moves it into place afterwards
    pub output: PathBuf,
    pub plan: EncodePlan,
    /// Source duration used to turn timestamps into a fraction
    pub duration_ms: u64,
}

/// Progress report from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineProgress {
    /// Fraction of the source processed, in [0, 1]
    pub fraction: f64,
    /// Non-fatal condition the engine reported alongside this update
    pub error: Option<String>,
}

impl EngineProgress {
    pub fn at(fraction: f64) -> Self {
        Self {
            fraction,
            error: None,
        }
    }
}

/// How a transcode ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    Success,
    Failed { code: Option<i32>, message: String },
    Cancelled,
}

/// Error bringing the engine up
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transcoding engine unavailable: {0}")]
    Unavailable(String),
}

/// A native transcoder.
///
/// `initialize` runs once before the first transcode and `shutdown` once
/// after the last lease is released; `EngineRuntime` enforces this.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn shutdown(&self) {}

    /// Transcode `request.input` to `request.output` following the plan.
    ///
    /// Must return promptly with `EngineExit::Cancelled` once `cancel` fires.
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: mpsc::UnboundedSender<EngineProgress>,
        cancel: CancellationToken,
    ) -> EngineExit;
}

/// Map a failed engine exit onto the error taxonomy
pub fn classify_engine_failure(code: Option<i32>, message: &str) -> CompressError {
    let lower = message.to_lowercase();
    if lower.contains("no space left on device") || lower.contains("permission denied") {
        return CompressError::Io {
            context: "writing transcoded output".to_string(),
            message: message.to_string(),
        };
    }
    CompressError::NativeEngineFailure {
        code,
        message: message.to_string(),
    }
}
