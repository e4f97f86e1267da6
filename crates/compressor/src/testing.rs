//! Test doubles for the prober and engine seams.

use crate::engine::{EngineError, EngineExit, EngineProgress, TranscodeEngine, TranscodeRequest};
use crate::error::CompressError;
use crate::probe::{MediaProber, Resolution, SourceMedia};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

pub(crate) const MP4_HEADER: &[u8] = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00isomiso2avc1mp41";

/// Prober that answers from fixed metadata.
///
/// Paths containing "unreadable" fail with `UnreadableMedia`; paths
/// containing "audio_only" fail with `UnsupportedFormat`. Temp outputs
/// (".partial.") report `output_duration_ms` when set.
#[derive(Debug)]
pub(crate) struct FakeProber {
    pub duration_ms: u64,
    pub bitrate_bps: u64,
    pub resolution: Resolution,
    pub output_duration_ms: Option<u64>,
    calls: AtomicUsize,
}

impl FakeProber {
    pub fn new() -> Self {
        Self {
            duration_ms: 120_000,
            bitrate_bps: 8_000_000,
            resolution: Resolution::new(1920, 1080),
            output_duration_ms: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_output_duration(mut self, ms: u64) -> Self {
        self.output_duration_ms = Some(ms);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProber for FakeProber {
    async fn probe(&self, path: &Path) -> Result<SourceMedia, CompressError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = path.to_string_lossy();

        if name.contains("unreadable") {
            return Err(CompressError::UnreadableMedia {
                path: path.to_path_buf(),
                reason: "moov atom not found".to_string(),
            });
        }
        if name.contains("audio_only") {
            return Err(CompressError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: "no video stream".to_string(),
            });
        }

        let duration_ms = match self.output_duration_ms {
            Some(ms) if name.contains(".partial.") => ms,
            _ => self.duration_ms,
        };

        Ok(SourceMedia {
            path: path.to_path_buf(),
            duration_ms,
            resolution: self.resolution,
            container: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: Some("aac".to_string()),
            bitrate_bps: self.bitrate_bps,
            size_bytes: self.bitrate_bps * duration_ms / 8000,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EngineMode {
    /// Write a valid output and report progress
    Succeed,
    /// Write a partial output, then fail
    Fail { code: i32, message: String },
    /// Wait for `release` (or cancellation), then succeed
    Block,
    /// Exit cleanly without producing anything useful
    WriteEmpty,
    /// Write a partial output, then panic
    Panic,
}

/// Engine double that records how it was driven
#[derive(Debug)]
pub(crate) struct FakeEngine {
    mode: EngineMode,
    fail_init: bool,
    gate: Semaphore,
    transcodes: AtomicUsize,
    inits: AtomicUsize,
    shutdowns: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new(mode: EngineMode) -> Self {
        Self {
            mode,
            fail_init: false,
            gate: Semaphore::new(0),
            transcodes: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Let `n` blocked transcodes finish
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn transcode_calls(&self) -> usize {
        self.transcodes.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Inputs in the order transcodes started
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().map(|v| v.clone()).unwrap_or_default()
    }

    async fn drive(
        &self,
        request: &TranscodeRequest,
        progress: &mpsc::UnboundedSender<EngineProgress>,
        cancel: &CancellationToken,
    ) -> EngineExit {
        match &self.mode {
            EngineMode::Succeed => write_success(request, progress).await,
            EngineMode::Fail { code, message } => {
                let _ = tokio::fs::write(&request.output, &MP4_HEADER[..8]).await;
                let _ = progress.send(EngineProgress::at(0.1));
                EngineExit::Failed {
                    code: Some(*code),
                    message: message.clone(),
                }
            }
            EngineMode::Block => {
                let _ = tokio::fs::write(&request.output, &MP4_HEADER[..8]).await;
                let _ = progress.send(EngineProgress::at(0.1));
                tokio::select! {
                    _ = cancel.cancelled() => EngineExit::Cancelled,
                    permit = self.gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                        write_success(request, progress).await
                    }
                }
            }
            EngineMode::WriteEmpty => {
                let _ = tokio::fs::write(&request.output, b"").await;
                EngineExit::Success
            }
            EngineMode::Panic => {
                let _ = tokio::fs::write(&request.output, &MP4_HEADER[..8]).await;
                panic!("fake engine crashed");
            }
        }
    }
}

async fn write_success(
    request: &TranscodeRequest,
    progress: &mpsc::UnboundedSender<EngineProgress>,
) -> EngineExit {
    for step in [0.25, 0.5, 0.75, 1.0] {
        let _ = progress.send(EngineProgress::at(step));
    }
    match tokio::fs::write(&request.output, MP4_HEADER).await {
        Ok(()) => EngineExit::Success,
        Err(e) => EngineExit::Failed {
            code: None,
            message: e.to_string(),
        },
    }
}

#[async_trait]
impl TranscodeEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn initialize(&self) -> Result<(), EngineError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(EngineError::Unavailable("fake init failure".to_string()));
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: mpsc::UnboundedSender<EngineProgress>,
        cancel: CancellationToken,
    ) -> EngineExit {
        self.transcodes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(request.input.to_string_lossy().to_string());
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let exit = self.drive(request, &progress, &cancel).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        exit
    }
}
