//! Job records.
//!
//! A `Job` is owned by the manager's dispatcher; everything else sees
//! snapshots (clones).

use crate::error::JobFailure;
use crate::plan::{CompressionTarget, EncodePlan};
use crate::probe::SourceMedia;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a free slot
    Pending,
    Probing,
    Planning,
    /// The engine is transcoding
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Probing => "probing",
            JobState::Planning => "planning",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Probing => 1,
            JobState::Planning => 2,
            JobState::Running => 3,
            JobState::Completed | JobState::Failed | JobState::Cancelled => 4,
        }
    }

    /// Whether `self -> next` is a legal edge.
    ///
    /// States only move forward. Completed is reachable from Running only;
    /// Failed and Cancelled from any non-terminal state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Completed => *self == JobState::Running,
            JobState::Failed | JobState::Cancelled => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compression job and everything learned about it so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_path: PathBuf,
    pub target: CompressionTarget,
    /// Where the verified output lands
    pub output_path: Option<PathBuf>,
    /// Size of the verified output, set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size_bytes: Option<u64>,
    pub source: Option<SourceMedia>,
    pub plan: Option<EncodePlan>,
    pub state: JobState,
    /// Fraction complete, in [0, 1]
    pub progress: f32,
    pub error: Option<JobFailure>,
    /// Unix timestamp (milliseconds)
    pub created_at: i64,
    /// Unix timestamp (milliseconds)
    pub updated_at: i64,
}

impl Job {
    pub fn new(id: JobId, input_path: PathBuf, target: CompressionTarget) -> Self {
        let now = current_timestamp_ms();
        Self {
            id,
            input_path,
            target,
            output_path: None,
            output_size_bytes: None,
            source: None,
            plan: None,
            state: JobState::Pending,
            progress: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms().max(self.updated_at);
    }

    /// Move to `next` if the edge is legal. Returns whether it moved.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next == JobState::Completed {
            self.progress = 1.0;
        }
        self.touch();
        true
    }

    /// Record progress while Running. Values never go backwards.
    pub fn record_progress(&mut self, fraction: f32) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction < self.progress {
            return false;
        }
        self.progress = fraction;
        self.touch();
        true
    }

    pub fn fail(&mut self, failure: JobFailure) -> bool {
        if !self.transition(JobState::Failed) {
            return false;
        }
        self.error = Some(failure);
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Current timestamp in milliseconds since the Unix epoch
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
