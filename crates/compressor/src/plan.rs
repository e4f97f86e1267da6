//! Encode plan builder.
//!
//! Turns probed source metadata and a user target (quality level or output
//! size) into concrete encoder parameters. All ladder values come from
//! `PlanConfig`.

use crate::config::{Container, PlanConfig, ResolutionTier, VideoCodec};
use crate::error::CompressError;
use crate::probe::{Resolution, SourceMedia};
use serde::{Deserialize, Serialize};

/// Audio codec used whenever the source carries audio
pub const AUDIO_CODEC: &str = "aac";

/// Coarse quality choice offered to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
}

impl std::str::FromStr for QualityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(QualityLevel::Low),
            "medium" => Ok(QualityLevel::Medium),
            "high" => Ok(QualityLevel::High),
            other => Err(format!("unknown quality level '{}'", other)),
        }
    }
}

/// What the user asked the compression to achieve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompressionTarget {
    Quality { level: QualityLevel },
    TargetSize { bytes: u64 },
}

impl CompressionTarget {
    pub fn quality(level: QualityLevel) -> Self {
        CompressionTarget::Quality { level }
    }

    pub fn target_size(bytes: u64) -> Self {
        CompressionTarget::TargetSize { bytes }
    }
}

/// Concrete encoder parameters for one job. Immutable once derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodePlan {
    pub video_codec: VideoCodec,
    /// None when the source has no audio stream
    pub audio_codec: Option<String>,
    pub container: Container,
    pub resolution: Resolution,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub estimated_size_bytes: u64,
    /// The size target forced the bitrate up to the floor
    pub quality_below_target: bool,
    pub downscaled: bool,
    /// Encoder threads (0 = let the engine decide)
    pub threads: u32,
}

/// Derives `EncodePlan`s from a `PlanConfig`.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    config: PlanConfig,
    /// Tiers sorted by height, tallest first
    tiers: Vec<ResolutionTier>,
    threads: u32,
}

impl PlanBuilder {
    pub fn new(config: PlanConfig) -> Self {
        let mut tiers = config.tiers.clone();
        tiers.sort_by(|a, b| b.height.cmp(&a.height));
        Self {
            config,
            tiers,
            threads: 0,
        }
    }

    /// Set the encoder thread count stamped onto every plan
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    /// Build the plan for `source` under `target`.
    ///
    /// Size targets: `video = target_bits / duration - audio_reserve`. A
    /// result under the floor is raised to the floor (flagging
    /// `quality_below_target`) only while the floor plan stays within the
    /// configured overshoot of the target; otherwise `InfeasiblePlan`.
    ///
    /// Quality targets: a fixed fraction of the source video bitrate, never
    /// under the floor.
    ///
    /// Resolution only ever goes down, and only when the bitrate cannot
    /// sustain the source resolution.
    pub fn build_plan(
        &self,
        source: &SourceMedia,
        target: CompressionTarget,
    ) -> Result<EncodePlan, CompressError> {
        let audio_bps = if source.has_audio() {
            self.config.audio_bitrate_bps
        } else {
            0
        };
        let duration_secs = source.duration_secs();

        let (video_bps, quality_below_target) = match target {
            CompressionTarget::TargetSize { bytes } => {
                self.size_target_bitrate(bytes, duration_secs, audio_bps, source)?
            }
            CompressionTarget::Quality { level } => {
                (self.quality_bitrate(level, audio_bps, source), false)
            }
        };

        let (resolution, downscaled) = self.choose_resolution(source.resolution, video_bps);

        Ok(EncodePlan {
            video_codec: self.config.video_codec,
            audio_codec: source.audio_codec.as_ref().map(|_| AUDIO_CODEC.to_string()),
            container: self.config.container,
            resolution,
            video_bitrate_bps: video_bps,
            audio_bitrate_bps: audio_bps,
            estimated_size_bytes: estimate_size_bytes(video_bps, audio_bps, duration_secs),
            quality_below_target,
            downscaled,
            threads: self.threads,
        })
    }

    fn size_target_bitrate(
        &self,
        bytes: u64,
        duration_secs: f64,
        audio_bps: u64,
        source: &SourceMedia,
    ) -> Result<(u64, bool), CompressError> {
        let floor = self.config.min_video_bitrate_bps;

        if bytes == 0 {
            return Err(CompressError::InfeasiblePlan(
                "target size must be greater than zero".to_string(),
            ));
        }
        if duration_secs <= 0.0 {
            return Err(CompressError::InfeasiblePlan(
                "source duration is unknown, a size target cannot be met".to_string(),
            ));
        }

        let total_bps = bytes as f64 * 8.0 / duration_secs;
        let derived = total_bps - audio_bps as f64;

        if derived <= 0.0 {
            return Err(CompressError::InfeasiblePlan(format!(
                "{} bytes over {:.1}s leaves no room for video after {} bps of audio",
                bytes, duration_secs, audio_bps
            )));
        }

        if derived < floor as f64 {
            let floor_size = estimate_size_bytes(floor, audio_bps, duration_secs);
            let allowed = bytes as f64 * (1.0 + self.config.size_overshoot_tolerance);
            if floor_size as f64 > allowed {
                return Err(CompressError::InfeasiblePlan(format!(
                    "{} bytes needs {:.0} bps of video, below the {} bps floor \
                     (floor output would be ~{} bytes)",
                    bytes, derived, floor, floor_size
                )));
            }
            return Ok((floor, true));
        }

        // Asking for more than the source already spends buys nothing
        let mut video_bps = derived.floor() as u64;
        let source_video = source_video_bitrate(source, audio_bps);
        if source_video > 0 {
            video_bps = video_bps.min(source_video.max(floor));
        }
        Ok((video_bps, false))
    }

    fn quality_bitrate(&self, level: QualityLevel, audio_bps: u64, source: &SourceMedia) -> u64 {
        let floor = self.config.min_video_bitrate_bps;
        let ratio = match level {
            QualityLevel::Low => self.config.quality.low,
            QualityLevel::Medium => self.config.quality.medium,
            QualityLevel::High => self.config.quality.high,
        };

        let mut source_video = source_video_bitrate(source, audio_bps);
        if source_video == 0 {
            source_video = self.required_bitrate(source.resolution.short_side());
        }

        let scaled = (source_video as f64 * ratio.max(0.0)).round() as u64;
        scaled.min(source_video).max(floor)
    }

    /// Minimum bitrate that sustains `lines` on the short side: the
    /// requirement of the smallest tier at or above it.
    pub fn required_bitrate(&self, lines: u32) -> u64 {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.height >= lines)
            .or_else(|| self.tiers.first())
            .map(|t| t.min_bitrate_bps)
            .unwrap_or(0)
    }

    /// Pick the output resolution for `video_bps`.
    ///
    /// Returns the source unchanged when the bitrate sustains it, otherwise
    /// the tallest tier strictly below the source that the bitrate sustains,
    /// falling back to the lowest tier below the source.
    pub fn choose_resolution(&self, source: Resolution, video_bps: u64) -> (Resolution, bool) {
        let lines = source.short_side();
        if video_bps >= self.required_bitrate(lines) {
            return (source, false);
        }

        let below: Vec<&ResolutionTier> = self.tiers.iter().filter(|t| t.height < lines).collect();
        let chosen = below
            .iter()
            .find(|t| t.min_bitrate_bps <= video_bps)
            .or_else(|| below.last());

        match chosen {
            Some(tier) => (source.scale_short_side_to(tier.height), true),
            None => (source, false),
        }
    }
}

/// Video share of the source bitrate (overall bitrate minus audio)
fn source_video_bitrate(source: &SourceMedia, audio_bps: u64) -> u64 {
    source.bitrate_bps.saturating_sub(audio_bps)
}

/// Expected output size for the given bitrates and duration
pub fn estimate_size_bytes(video_bps: u64, audio_bps: u64, duration_secs: f64) -> u64 {
    ((video_bps + audio_bps) as f64 * duration_secs.max(0.0) / 8.0).round() as u64
}

/// Build a plan with a throwaway builder
pub fn build_plan(
    source: &SourceMedia,
    target: CompressionTarget,
    cfg: &PlanConfig,
) -> Result<EncodePlan, CompressError> {
    PlanBuilder::new(cfg.clone()).build_plan(source, target)
}
