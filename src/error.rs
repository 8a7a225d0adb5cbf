#![forbid(unsafe_code)]

//! Error taxonomy shared by the cache, scheduler, and HTTP layer.
//!
//! Failures that happen after a task was accepted never travel through these
//! types to the submitter; the owning worker writes them into the task record
//! instead. What remains here are the synchronous failures callers can see.

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::TaskState;

/// Operator guidance attached to bot-detection failures.
pub const BOT_DETECTION_GUIDANCE: &str = "The server administrator needs to configure \
platform cookies (YOUTUBE_COOKIES_BASE64, YOUTUBE_COOKIES, or a cookies file) so requests \
are authenticated.";

#[derive(Debug, Error)]
pub enum FetchError {
    /// Missing or malformed input. Rejected before any task exists.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    MetadataFetch(String),

    /// The platform demanded a sign-in or bot challenge. `technical` keeps the
    /// raw tool output for diagnostics.
    #[error("Bot detection triggered. Server needs cookies configured.")]
    BotDetection { technical: String },

    #[error("requested format is not available: {0}")]
    FormatUnavailable(String),

    #[error("Download completed but file not found: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("Download not found")]
    TaskNotFound,

    #[error("Download not completed. Status: {0}")]
    TaskNotReady(TaskState),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Short machine-friendly label, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Validation(_) => "validation",
            FetchError::MetadataFetch(_) => "metadata_fetch",
            FetchError::BotDetection { .. } => "bot_detection",
            FetchError::FormatUnavailable(_) => "format_unavailable",
            FetchError::ArtifactMissing(_) => "artifact_missing",
            FetchError::TaskNotFound => "task_not_found",
            FetchError::TaskNotReady(_) => "task_not_ready",
            FetchError::ShuttingDown => "shutting_down",
            FetchError::Io(_) => "io",
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
