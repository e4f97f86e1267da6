//! ffmpeg-backed engine.
//!
//! Progress comes from `-progress pipe:1`, which writes `key=value` blocks
//! terminated by a `progress=continue` or `progress=end` line.

use super::{EngineError, EngineExit, EngineProgress, TranscodeEngine, TranscodeRequest};
use crate::config::{Container, EngineConfig, VideoCodec};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr kept for the failure message
const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_path: PathBuf,
    cancel_grace: Duration,
}

impl FfmpegEngine {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            ffmpeg_path: cfg.ffmpeg_path.clone(),
            cancel_grace: Duration::from_millis(cfg.cancel_grace_ms),
        }
    }

    /// Kill the child and wait up to the grace period for it to exit
    async fn stop(&self, child: &mut Child) -> EngineExit {
        if let Err(e) = child.start_kill() {
            warn!("Failed to signal ffmpeg: {}", e);
        }
        if tokio::time::timeout(self.cancel_grace, child.wait())
            .await
            .is_err()
        {
            warn!(
                "ffmpeg did not exit within {:?} of cancellation",
                self.cancel_grace
            );
        }
        EngineExit::Cancelled
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn initialize(&self) -> Result<(), EngineError> {
        let output = std::process::Command::new(&self.ffmpeg_path)
            .arg("-version")
            .output()
            .map_err(|e| {
                EngineError::Unavailable(format!(
                    "failed to run {} -version: {}",
                    self.ffmpeg_path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(EngineError::Unavailable(format!(
                "{} -version exited with {}",
                self.ffmpeg_path.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_ffmpeg_version(&stdout) {
            Some(major) => info!("Found ffmpeg major version {}", major),
            None => warn!("Could not determine ffmpeg version, continuing"),
        }
        Ok(())
    }

    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: mpsc::UnboundedSender<EngineProgress>,
        cancel: CancellationToken,
    ) -> EngineExit {
        let mut cmd = tokio::process::Command::from(build_ffmpeg_command(&self.ffmpeg_path, request));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning {:?}", cmd.as_std());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return EngineExit::Failed {
                    code: None,
                    message: format!("failed to start {}: {}", self.ffmpeg_path.display(), e),
                }
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return EngineExit::Failed {
                code: None,
                message: "ffmpeg pipes were not captured".to_string(),
            };
        };

        // Keep the stderr tail for diagnostics and forward error lines as
        // non-fatal progress notes.
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<String>();
        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.to_lowercase().contains("error") {
                    let _ = note_tx.send(line.clone());
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let mut parser = ProgressParser::new(request.duration_ms);
        let mut last_fraction = 0.0;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return self.stop(&mut child).await,
                Some(note) = note_rx.recv() => {
                    let _ = progress.send(EngineProgress {
                        fraction: last_fraction,
                        error: Some(note),
                    });
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(fraction) = parser.feed(&line) {
                            last_fraction = fraction;
                            let _ = progress.send(EngineProgress::at(fraction));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read ffmpeg progress: {}", e);
                        break;
                    }
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return self.stop(&mut child).await,
            status = child.wait() => status,
        };

        let tail = stderr_task.await.unwrap_or_default();

        match status {
            Ok(status) if status.success() => EngineExit::Success,
            Ok(status) => {
                let message = tail
                    .iter()
                    .filter(|l| !l.trim().is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                EngineExit::Failed {
                    code: status.code(),
                    message: if message.is_empty() {
                        format!("ffmpeg exited with {}", status)
                    } else {
                        message
                    },
                }
            }
            Err(e) => EngineExit::Failed {
                code: None,
                message: format!("failed to wait for ffmpeg: {}", e),
            },
        }
    }
}

fn encoder_for(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::H265 => "libx265",
    }
}

fn muxer_for(container: Container) -> &'static str {
    match container {
        Container::Mp4 => "mp4",
        Container::Mkv => "matroska",
    }
}

/// Build the ffmpeg invocation for a transcode request
pub fn build_ffmpeg_command(ffmpeg: &Path, request: &TranscodeRequest) -> std::process::Command {
    let plan = &request.plan;
    let mut cmd = std::process::Command::new(ffmpeg);

    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.arg("-i").arg(&request.input);

    // Capital V skips attached pictures such as cover art
    cmd.args(["-map", "0:V:0"]);
    if plan.audio_codec.is_some() {
        cmd.args(["-map", "0:a:0"]);
    }

    cmd.args(["-c:v", encoder_for(plan.video_codec)]);
    if plan.video_codec == VideoCodec::H265 && plan.container == Container::Mp4 {
        // Apple players refuse the default hev1 tag
        cmd.args(["-tag:v", "hvc1"]);
    }

    let video_bps = plan.video_bitrate_bps.to_string();
    cmd.arg("-b:v").arg(&video_bps);
    cmd.arg("-maxrate").arg(&video_bps);
    cmd.arg("-bufsize")
        .arg(plan.video_bitrate_bps.saturating_mul(2).to_string());

    if plan.downscaled {
        cmd.arg("-vf").arg(format!(
            "scale={}:{}",
            plan.resolution.width, plan.resolution.height
        ));
    }

    if plan.threads > 0 {
        cmd.arg("-threads").arg(plan.threads.to_string());
    }

    match &plan.audio_codec {
        Some(codec) => {
            cmd.arg("-c:a").arg(codec);
            cmd.arg("-b:a").arg(plan.audio_bitrate_bps.to_string());
        }
        None => {
            cmd.arg("-an");
        }
    }

    if plan.container == Container::Mp4 {
        cmd.args(["-movflags", "+faststart"]);
    }

    cmd.args(["-f", muxer_for(plan.container)]);
    cmd.args(["-progress", "pipe:1", "-nostats"]);
    cmd.arg(&request.output);

    cmd
}

/// Incremental parser for `-progress` output
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_us: u64,
    out_time_us: Option<u64>,
}

impl ProgressParser {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_us: duration_ms.saturating_mul(1000),
            out_time_us: None,
        }
    }

    /// Feed one line; returns a fraction at the end of each block
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();

        // out_time_ms is also in microseconds; older builds only print that
        if let Some(value) = line
            .strip_prefix("out_time_us=")
            .or_else(|| line.strip_prefix("out_time_ms="))
        {
            if let Ok(us) = value.trim().parse::<i64>() {
                self.out_time_us = Some(us.max(0) as u64);
            }
            return None;
        }

        let state = line.strip_prefix("progress=")?;
        if state.trim() == "end" {
            return Some(1.0);
        }

        match (self.out_time_us, self.duration_us) {
            (Some(out), dur) if dur > 0 => Some((out as f64 / dur as f64).clamp(0.0, 1.0)),
            _ => None,
        }
    }
}

/// Extract the major version from `ffmpeg -version` output.
///
/// Handles release strings ("ffmpeg version 6.1.1") and n-prefixed builds
/// ("ffmpeg version n7.0-2-g..."). Git snapshots ("N-112233-g...") yield None.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|l| l.contains("ffmpeg version"))?;

    let version = line
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .trim_start_matches('n');

    version.split(['.', '-']).next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::EncodePlan;
    use crate::probe::Resolution;

    fn get_command_args(cmd: &std::process::Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    fn plan() -> EncodePlan {
        EncodePlan {
            video_codec: VideoCodec::H264,
            audio_codec: Some("aac".to_string()),
            container: Container::Mp4,
            resolution: Resolution::new(1920, 1080),
            video_bitrate_bps: 683_050,
            audio_bitrate_bps: 16_000,
            estimated_size_bytes: 10_485_750,
            quality_below_target: false,
            downscaled: false,
            threads: 4,
        }
    }

    fn request(plan: EncodePlan) -> TranscodeRequest {
        TranscodeRequest {
            input: PathBuf::from("/in/clip.mov"),
            output: PathBuf::from("/tmp/job.partial.mp4"),
            plan,
            duration_ms: 120_000,
        }
    }

    #[test]
    fn test_h264_mp4_command() {
        let cmd = build_ffmpeg_command(Path::new("/usr/bin/ffmpeg"), &request(plan()));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), "/usr/bin/ffmpeg");
        assert_eq!(flag_value(&args, "-i"), Some("/in/clip.mov"));
        assert_eq!(flag_value(&args, "-map"), Some("0:V:0"));
        assert_eq!(flag_value(&args, "-c:v"), Some("libx264"));
        assert_eq!(flag_value(&args, "-b:v"), Some("683050"));
        assert_eq!(flag_value(&args, "-maxrate"), Some("683050"));
        assert_eq!(flag_value(&args, "-bufsize"), Some("1366100"));
        assert_eq!(flag_value(&args, "-c:a"), Some("aac"));
        assert_eq!(flag_value(&args, "-b:a"), Some("16000"));
        assert_eq!(flag_value(&args, "-threads"), Some("4"));
        assert_eq!(flag_value(&args, "-movflags"), Some("+faststart"));
        assert_eq!(flag_value(&args, "-f"), Some("mp4"));
        assert_eq!(flag_value(&args, "-progress"), Some("pipe:1"));
        assert!(args.contains(&"0:a:0".to_string()));
        assert!(!args.contains(&"-vf".to_string()));
        assert!(!args.contains(&"-tag:v".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/job.partial.mp4"));
    }

    #[test]
    fn test_downscaled_hevc_mkv_without_audio() {
        let mut p = plan();
        p.video_codec = VideoCodec::H265;
        p.container = Container::Mkv;
        p.audio_codec = None;
        p.audio_bitrate_bps = 0;
        p.resolution = Resolution::new(1280, 720);
        p.downscaled = true;
        p.threads = 0;

        let args = get_command_args(&build_ffmpeg_command(Path::new("ffmpeg"), &request(p)));

        assert_eq!(flag_value(&args, "-c:v"), Some("libx265"));
        assert_eq!(flag_value(&args, "-vf"), Some("scale=1280:720"));
        assert_eq!(flag_value(&args, "-f"), Some("matroska"));
        assert!(args.contains(&"-an".to_string()));
        assert!(!args.contains(&"0:a:0".to_string()));
        assert!(!args.contains(&"-threads".to_string()));
        assert!(!args.contains(&"-movflags".to_string()));
        assert!(!args.contains(&"-tag:v".to_string()));
    }

    #[test]
    fn test_hevc_in_mp4_gets_hvc1_tag() {
        let mut p = plan();
        p.video_codec = VideoCodec::H265;
        let args = get_command_args(&build_ffmpeg_command(Path::new("ffmpeg"), &request(p)));
        assert_eq!(flag_value(&args, "-tag:v"), Some("hvc1"));
    }

    #[test]
    fn test_progress_parser_blocks() {
        let mut parser = ProgressParser::new(10_000);

        assert_eq!(parser.feed("frame=120"), None);
        assert_eq!(parser.feed("out_time_us=2500000"), None);
        assert_eq!(parser.feed("out_time_ms=2500000"), None);
        assert_eq!(parser.feed("progress=continue"), Some(0.25));

        parser.feed("out_time_us=N/A");
        assert_eq!(parser.feed("progress=continue"), Some(0.25));

        parser.feed("out_time_us=12000000");
        assert_eq!(parser.feed("progress=continue"), Some(1.0));
        assert_eq!(parser.feed("progress=end"), Some(1.0));
    }

    #[test]
    fn test_progress_parser_without_duration() {
        let mut parser = ProgressParser::new(0);
        parser.feed("out_time_us=2500000");
        assert_eq!(parser.feed("progress=continue"), None);
        assert_eq!(parser.feed("progress=end"), Some(1.0));
    }

    #[test]
    fn test_progress_parser_negative_start_time() {
        let mut parser = ProgressParser::new(1_000);
        parser.feed("out_time_us=-40000");
        assert_eq!(parser.feed("progress=continue"), Some(0.0));
    }

    #[test]
    fn test_parse_ffmpeg_version() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 6.1.1 Copyright (c) 2000-2023"),
            Some(6)
        );
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version n7.0-2-gabcdef Copyright"),
            Some(7)
        );
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 8.0-full_build-www.gyan.dev"),
            Some(8)
        );
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-112233-g0123abc"), None);
        assert_eq!(parse_ffmpeg_version("not ffmpeg"), None);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let engine = FfmpegEngine::new(&EngineConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ..EngineConfig::default()
        });
        assert!(matches!(
            engine.initialize(),
            Err(EngineError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_failed_exit() {
        let engine = FfmpegEngine::new(&EngineConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ..EngineConfig::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let exit = engine
            .transcode(&request(plan()), tx, CancellationToken::new())
            .await;
        assert!(matches!(exit, EngineExit::Failed { code: None, .. }));
    }
}
