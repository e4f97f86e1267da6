//! Error taxonomy shared by every pipeline stage.
//!
//! `CompressError` is what runners and the manager hand around; `JobFailure`
//! is its serializable form stored on a failed job snapshot.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Classification the host UI uses to pick a retry affordance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnreadableMedia,
    UnsupportedFormat,
    InfeasiblePlan,
    NativeEngineFailure,
    VerificationFailed,
    Cancelled,
    IoFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnreadableMedia => "unreadable_media",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::InfeasiblePlan => "infeasible_plan",
            ErrorKind::NativeEngineFailure => "native_engine_failure",
            ErrorKind::VerificationFailed => "verification_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::IoFailure => "io_failure",
        }
    }

    /// Whether resubmitting the same input and target can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NativeEngineFailure
                | ErrorKind::VerificationFailed
                | ErrorKind::Cancelled
                | ErrorKind::IoFailure
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised while probing, planning, transcoding or finalizing a job
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompressError {
    #[error("cannot read media '{}': {reason}", .path.display())]
    UnreadableMedia { path: PathBuf, reason: String },

    #[error("unsupported media '{}': {reason}", .path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("infeasible encode plan: {0}")]
    InfeasiblePlan(String),

    #[error("transcoding engine failed{}: {message}", exit_code_suffix(.code))]
    NativeEngineFailure { code: Option<i32>, message: String },

    #[error("output verification failed: {0}")]
    VerificationFailed(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("I/O failure while {context}: {message}")]
    Io { context: String, message: String },
}

fn exit_code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" with exit code {}", c))
        .unwrap_or_default()
}

impl CompressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompressError::UnreadableMedia { .. } => ErrorKind::UnreadableMedia,
            CompressError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            CompressError::InfeasiblePlan(_) => ErrorKind::InfeasiblePlan,
            CompressError::NativeEngineFailure { .. } => ErrorKind::NativeEngineFailure,
            CompressError::VerificationFailed(_) => ErrorKind::VerificationFailed,
            CompressError::Cancelled => ErrorKind::Cancelled,
            CompressError::Io { .. } => ErrorKind::IoFailure,
        }
    }

    /// Wrap an I/O error with a short description of what was being done
    pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        CompressError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

/// Serializable failure attached to a failed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&CompressError> for JobFailure {
    fn from(err: &CompressError) -> Self {
        let kind = err.kind();
        Self {
            kind,
            message: err.to_string(),
            retryable: kind.is_retryable(),
        }
    }
}
