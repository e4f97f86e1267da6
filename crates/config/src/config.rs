//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Target video codec
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264" | "avc" => Ok(VideoCodec::H264),
            "h265" | "hevc" => Ok(VideoCodec::H265),
            other => Err(format!("unknown video codec '{}'", other)),
        }
    }
}

/// Target container format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
}

impl Container {
    /// File extension without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
        }
    }
}

/// One rung of the resolution ladder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionTier {
    /// Frame height in lines
    pub height: u32,
    /// Lowest video bitrate (bits/s) that sustains this height
    pub min_bitrate_bps: u64,
}

fn default_tiers() -> Vec<ResolutionTier> {
    [
        (2160, 8_000_000),
        (1440, 4_000_000),
        (1080, 2_000_000),
        (720, 1_000_000),
        (480, 500_000),
        (360, 250_000),
        (240, 150_000),
    ]
    .into_iter()
    .map(|(height, min_bitrate_bps)| ResolutionTier {
        height,
        min_bitrate_bps,
    })
    .collect()
}

/// Native engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Path to the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Path to the ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// How long to wait for a killed transcode to exit after cancellation (ms)
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Minimum spacing between progress events (ms)
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_progress_interval_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            cancel_grace_ms: default_cancel_grace_ms(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// Job scheduling and file placement configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Maximum concurrent jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Directory for in-progress output files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Directory for finished outputs (None = next to the input)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Directory for persisted job history (None = no history)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Suffix appended to the input file stem for the output name
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
    /// Allowed relative difference between source and output duration
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance: f64,
}

fn default_temp_dir() -> PathBuf {
    env::temp_dir().join("video-compressor")
}

fn default_output_suffix() -> String {
    "_compressed".to_string()
}

fn default_duration_tolerance() -> f64 {
    0.01
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            temp_dir: default_temp_dir(),
            output_dir: None,
            state_dir: None,
            output_suffix: default_output_suffix(),
            duration_tolerance: default_duration_tolerance(),
        }
    }
}

/// Bitrate ratios applied to the source bitrate per quality level
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityRatios {
    #[serde(default = "default_low_ratio")]
    pub low: f64,
    #[serde(default = "default_medium_ratio")]
    pub medium: f64,
    #[serde(default = "default_high_ratio")]
    pub high: f64,
}

fn default_low_ratio() -> f64 {
    0.35
}

fn default_medium_ratio() -> f64 {
    0.5
}

fn default_high_ratio() -> f64 {
    0.7
}

impl Default for QualityRatios {
    fn default() -> Self {
        Self {
            low: default_low_ratio(),
            medium: default_medium_ratio(),
            high: default_high_ratio(),
        }
    }
}

/// Encode plan policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanConfig {
    /// Video bitrate floor (bits/s); no plan goes below it
    #[serde(default = "default_min_video_bitrate_bps")]
    pub min_video_bitrate_bps: u64,
    /// Audio bitrate (bits/s), also reserved out of size targets
    #[serde(default = "default_audio_bitrate_bps")]
    pub audio_bitrate_bps: u64,
    /// How far over a size target a floor-clamped plan may land (0.1 = 10%)
    #[serde(default = "default_size_overshoot_tolerance")]
    pub size_overshoot_tolerance: f64,
    #[serde(default)]
    pub video_codec: VideoCodec,
    #[serde(default)]
    pub container: Container,
    #[serde(default)]
    pub quality: QualityRatios,
    /// Resolution ladder, any order
    #[serde(default = "default_tiers")]
    pub tiers: Vec<ResolutionTier>,
}

fn default_min_video_bitrate_bps() -> u64 {
    200_000
}

fn default_audio_bitrate_bps() -> u64 {
    128_000
}

fn default_size_overshoot_tolerance() -> f64 {
    0.10
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            min_video_bitrate_bps: default_min_video_bitrate_bps(),
            audio_bitrate_bps: default_audio_bitrate_bps(),
            size_overshoot_tolerance: default_size_overshoot_tolerance(),
            video_codec: VideoCodec::default(),
            container: Container::default(),
            quality: QualityRatios::default(),
            tiers: default_tiers(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub plan: PlanConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - COMPRESSOR_FFMPEG_PATH -> engine.ffmpeg_path
    /// - COMPRESSOR_FFPROBE_PATH -> engine.ffprobe_path
    /// - COMPRESSOR_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    /// - COMPRESSOR_TEMP_DIR -> jobs.temp_dir
    /// - COMPRESSOR_OUTPUT_DIR -> jobs.output_dir
    /// - COMPRESSOR_MIN_VIDEO_BITRATE -> plan.min_video_bitrate_bps
    /// - COMPRESSOR_AUDIO_BITRATE -> plan.audio_bitrate_bps
    /// - COMPRESSOR_VIDEO_CODEC -> plan.video_codec
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("COMPRESSOR_FFMPEG_PATH") {
            if !val.is_empty() {
                self.engine.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("COMPRESSOR_FFPROBE_PATH") {
            if !val.is_empty() {
                self.engine.ffprobe_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("COMPRESSOR_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("COMPRESSOR_TEMP_DIR") {
            if !val.is_empty() {
                self.jobs.temp_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("COMPRESSOR_OUTPUT_DIR") {
            if !val.is_empty() {
                self.jobs.output_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("COMPRESSOR_MIN_VIDEO_BITRATE") {
            if let Ok(bps) = val.parse::<u64>() {
                self.plan.min_video_bitrate_bps = bps;
            }
        }

        if let Ok(val) = env::var("COMPRESSOR_AUDIO_BITRATE") {
            if let Ok(bps) = val.parse::<u64>() {
                self.plan.audio_bitrate_bps = bps;
            }
        }

        // Unknown codec names keep the existing value
        if let Ok(val) = env::var("COMPRESSOR_VIDEO_CODEC") {
            if let Ok(codec) = val.parse::<VideoCodec>() {
                self.plan.video_codec = codec;
            }
        }
    }

    /// Reject values that parse but cannot drive the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plan.tiers.is_empty() {
            return Err(ConfigError::Invalid(
                "plan.tiers must contain at least one resolution tier".to_string(),
            ));
        }
        if self.plan.tiers.iter().any(|t| t.height == 0) {
            return Err(ConfigError::Invalid(
                "plan.tiers heights must be non-zero".to_string(),
            ));
        }
        if self.plan.min_video_bitrate_bps == 0 {
            return Err(ConfigError::Invalid(
                "plan.min_video_bitrate_bps must be non-zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jobs.duration_tolerance) {
            return Err(ConfigError::Invalid(format!(
                "jobs.duration_tolerance must be in [0, 1), got {}",
                self.jobs.duration_tolerance
            )));
        }
        if self.plan.size_overshoot_tolerance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "plan.size_overshoot_tolerance must not be negative, got {}",
                self.plan.size_overshoot_tolerance
            )));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
