//! Media prober module.
//!
//! Inspects an input file with ffprobe and reduces the output to the
//! `SourceMedia` record the planner works from. Probing never writes.

use crate::error::CompressError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Length of the shorter side; resolution tiers are measured on it so
    /// portrait phone footage lands on the same rung as landscape.
    pub fn short_side(&self) -> u32 {
        self.width.min(self.height)
    }

    /// Scale so the shorter side equals `lines`, keeping the aspect ratio.
    ///
    /// Both sides are rounded to even numbers as required by 4:2:0 encoders.
    pub fn scale_short_side_to(&self, lines: u32) -> Resolution {
        let short = self.short_side().max(1) as f64;
        let factor = lines as f64 / short;
        let scale = |side: u32| -> u32 {
            let scaled = (side as f64 * factor / 2.0).round() as u32 * 2;
            scaled.max(2)
        };
        Resolution {
            width: scale(self.width),
            height: scale(self.height),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Container and codec metadata of a probed input. Immutable once probed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMedia {
    pub path: PathBuf,
    pub duration_ms: u64,
    pub resolution: Resolution,
    /// ffprobe `format_name`, e.g. `mov,mp4,m4a,3gp,3g2,mj2`
    pub container: String,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    /// Overall bitrate in bits per second
    pub bitrate_bps: u64,
    pub size_bytes: u64,
}

impl SourceMedia {
    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

/// Read-only media inspection.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Inspect `path`.
    ///
    /// Fails with `UnreadableMedia` when the file cannot be opened or parsed,
    /// and `UnsupportedFormat` when it has no decodable video stream.
    async fn probe(&self, path: &Path) -> Result<SourceMedia, CompressError>;
}

/// Prober backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<SourceMedia, CompressError> {
        let unreadable = |reason: String| CompressError::UnreadableMedia {
            path: path.to_path_buf(),
            reason,
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| unreadable(e.to_string()))?;
        if !metadata.is_file() {
            return Err(unreadable("not a regular file".to_string()));
        }

        debug!(path = %path.display(), "probing media");

        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                unreadable(format!(
                    "failed to run {}: {}",
                    self.ffprobe_path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unreadable(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut media = parse_ffprobe_output(path, &stdout)?;
        if media.size_bytes == 0 {
            media.size_bytes = metadata.len();
        }
        Ok(media)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub duration: Option<String>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub attached_pic: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

fn parse_secs_to_ms(value: Option<&String>) -> Option<u64> {
    value
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(|secs| (secs * 1000.0).round() as u64)
}

/// Parses ffprobe JSON output into a `SourceMedia`.
///
/// Cover art (`attached_pic`) does not count as a video stream. When the
/// container reports no bitrate it is estimated from size and duration.
pub fn parse_ffprobe_output(path: &Path, json_str: &str) -> Result<SourceMedia, CompressError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| CompressError::UnreadableMedia {
            path: path.to_path_buf(),
            reason: format!("failed to parse ffprobe output: {}", e),
        })?;

    let format = ffprobe.format.ok_or_else(|| CompressError::UnreadableMedia {
        path: path.to_path_buf(),
        reason: "missing format information in ffprobe output".to_string(),
    })?;
    let streams = ffprobe.streams.unwrap_or_default();

    let video = streams.iter().find(|s| {
        s.codec_type.as_deref() == Some("video")
            && s.disposition.as_ref().map_or(true, |d| d.attached_pic == 0)
            && s.width.unwrap_or(0) > 0
            && s.height.unwrap_or(0) > 0
    });
    let video = video.ok_or_else(|| CompressError::UnsupportedFormat {
        path: path.to_path_buf(),
        reason: "no decodable video stream".to_string(),
    })?;
    let video_codec = video
        .codec_name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| CompressError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "video stream has no known codec".to_string(),
        })?;

    let audio_codec = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| s.codec_name.clone());

    let duration_ms = parse_secs_to_ms(format.duration.as_ref())
        .or_else(|| parse_secs_to_ms(video.duration.as_ref()))
        .unwrap_or(0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let bitrate_bps = format
        .bit_rate
        .as_ref()
        .and_then(|b| b.parse::<u64>().ok())
        .unwrap_or_else(|| {
            if size_bytes > 0 && duration_ms > 0 {
                size_bytes * 8 * 1000 / duration_ms
            } else {
                0
            }
        });

    Ok(SourceMedia {
        path: path.to_path_buf(),
        duration_ms,
        resolution: Resolution::new(video.width.unwrap_or(0), video.height.unwrap_or(0)),
        container: format.format_name.unwrap_or_default(),
        video_codec,
        audio_codec,
        bitrate_bps,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHONE_CLIP: &str = r#"{
        "streams": [
            {
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 1080,
                "height": 1920,
                "duration": "120.040000",
                "disposition": { "attached_pic": 0 }
            },
            {
                "codec_type": "audio",
                "codec_name": "aac",
                "channels": 2
            }
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "120.050000",
            "size": "180000000",
            "bit_rate": "11995000"
        }
    }"#;

    #[test]
    fn test_parse_phone_clip() {
        let media = parse_ffprobe_output(Path::new("/dcim/clip.mp4"), PHONE_CLIP).unwrap();

        assert_eq!(media.path, PathBuf::from("/dcim/clip.mp4"));
        assert_eq!(media.duration_ms, 120_050);
        assert_eq!(media.resolution, Resolution::new(1080, 1920));
        assert_eq!(media.video_codec, "hevc");
        assert_eq!(media.audio_codec.as_deref(), Some("aac"));
        assert_eq!(media.bitrate_bps, 11_995_000);
        assert_eq!(media.size_bytes, 180_000_000);
        assert_eq!(media.container, "mov,mp4,m4a,3gp,3g2,mj2");
    }

    #[test]
    fn test_parse_estimates_missing_bitrate() {
        let json = r#"{
            "streams": [{ "codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720 }],
            "format": { "format_name": "matroska,webm", "duration": "10.0", "size": "5000000" }
        }"#;
        let media = parse_ffprobe_output(Path::new("a.mkv"), json).unwrap();

        assert_eq!(media.bitrate_bps, 4_000_000);
        assert!(!media.has_audio());
    }

    #[test]
    fn test_parse_falls_back_to_stream_duration() {
        let json = r#"{
            "streams": [{ "codec_type": "video", "codec_name": "h264", "width": 640, "height": 360, "duration": "3.5" }],
            "format": { "format_name": "avi" }
        }"#;
        let media = parse_ffprobe_output(Path::new("a.avi"), json).unwrap();
        assert_eq!(media.duration_ms, 3_500);
    }

    #[test]
    fn test_audio_only_is_unsupported() {
        let json = r#"{
            "streams": [{ "codec_type": "audio", "codec_name": "mp3" }],
            "format": { "format_name": "mp3", "duration": "200.0" }
        }"#;
        let err = parse_ffprobe_output(Path::new("song.mp3"), json).unwrap_err();
        assert!(matches!(err, CompressError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_cover_art_is_not_video() {
        let json = r#"{
            "streams": [
                { "codec_type": "audio", "codec_name": "aac" },
                { "codec_type": "video", "codec_name": "mjpeg", "width": 600, "height": 600,
                  "disposition": { "attached_pic": 1 } }
            ],
            "format": { "format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "180.0" }
        }"#;
        let err = parse_ffprobe_output(Path::new("podcast.m4a"), json).unwrap_err();
        assert!(matches!(err, CompressError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_garbage_is_unreadable() {
        let err = parse_ffprobe_output(Path::new("x"), "not json").unwrap_err();
        assert!(matches!(err, CompressError::UnreadableMedia { .. }));

        let err = parse_ffprobe_output(Path::new("x"), r#"{"streams": []}"#).unwrap_err();
        assert!(matches!(err, CompressError::UnreadableMedia { .. }));
    }

    #[test]
    fn test_scale_short_side_keeps_aspect_and_parity() {
        let landscape = Resolution::new(1920, 1080);
        assert_eq!(landscape.scale_short_side_to(720), Resolution::new(1280, 720));

        let portrait = Resolution::new(1080, 1920);
        assert_eq!(portrait.scale_short_side_to(480), Resolution::new(480, 854));

        let odd = Resolution::new(1366, 768);
        let scaled = odd.scale_short_side_to(360);
        assert_eq!(scaled.height, 360);
        assert_eq!(scaled.width % 2, 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_unreadable() {
        let prober = FfprobeProber::default();
        let err = prober
            .probe(Path::new("/nonexistent/dir/video.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompressError::UnreadableMedia { .. }));
    }
}
