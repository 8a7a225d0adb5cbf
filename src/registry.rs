#![forbid(unsafe_code)]

//! In-memory table of download tasks.
//!
//! Records are keyed by an opaque random [`TaskId`]. State only moves forward
//! (`pending -> running -> completed | failed`); the transition helpers refuse
//! anything else so a stray writer cannot resurrect or rewind a task. Only the
//! retention sweeper removes records.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::format::DownloadOptions;
use crate::progress::SubscriberId;

/// Extensions tried when a recorded artifact has been renamed by a
/// post-processor.
pub const RECOVERY_EXTENSIONS: &[&str] = &["mp3", "m4a", "opus", "flac", "mp4", "webm", "mkv"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Forward-only: pending may fail directly (e.g. worker setup errors), but
    /// nothing leaves a terminal state.
    pub fn can_transition_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskRecord {
    #[serde(rename = "task_id")]
    pub id: TaskId,
    pub url: String,
    pub options: DownloadOptions,
    #[serde(rename = "status")]
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub subscriber: Option<SubscriberId>,
}

impl TaskRecord {
    pub fn pending(url: String, options: DownloadOptions, subscriber: Option<SubscriberId>) -> Self {
        Self {
            id: TaskId::new(),
            url,
            options,
            state: TaskState::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            artifact: None,
            filename: None,
            error: None,
            subscriber,
        }
    }

    /// Timestamp of the most recent state change.
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task {0} is not registered")]
    NotFound(TaskId),
    #[error("task {id} cannot move from {from} to {to}")]
    Invalid {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },
    #[error("artifact {} does not exist", .0.display())]
    ArtifactMissing(PathBuf),
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TaskRecord) -> TaskId {
        let id = record.id;
        self.tasks.lock().insert(id, record);
        id
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.lock().get(&id).cloned()
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.lock().get(&id).map(|record| record.state)
    }

    pub fn mark_running(&self, id: TaskId) -> Result<TaskRecord, TransitionError> {
        self.transition(id, TaskState::Running, |record| {
            record.started_at = Some(Utc::now());
        })
    }

    /// Completes a task. The artifact is checked on disk before the table is
    /// locked; a missing file is rejected and the record stays untouched.
    pub fn mark_completed(&self, id: TaskId, artifact: PathBuf) -> Result<TaskRecord, TransitionError> {
        if !artifact.is_file() {
            return Err(TransitionError::ArtifactMissing(artifact));
        }
        let filename = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        self.transition(id, TaskState::Completed, move |record| {
            record.completed_at = Some(Utc::now());
            record.filename = filename;
            record.artifact = Some(artifact);
        })
    }

    pub fn mark_failed(&self, id: TaskId, error: impl Into<String>) -> Result<TaskRecord, TransitionError> {
        let error = error.into();
        self.transition(id, TaskState::Failed, move |record| {
            record.completed_at = Some(Utc::now());
            record.error = Some(error);
        })
    }

    fn transition(
        &self,
        id: TaskId,
        next: TaskState,
        apply: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, TransitionError> {
        let mut tasks = self.tasks.lock();
        let record = tasks.get_mut(&id).ok_or(TransitionError::NotFound(id))?;
        if !record.state.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                id,
                from: record.state,
                to: next,
            });
        }
        record.state = next;
        apply(record);
        Ok(record.clone())
    }

    pub fn remove(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|record| record.state == state)
            .count()
    }

    /// Terminal records whose last transition is older than `retention`.
    pub fn expired(&self, now: DateTime<Utc>, retention: ChronoDuration) -> Vec<TaskRecord> {
        self.tasks
            .lock()
            .values()
            .filter(|record| record.state.is_terminal())
            .filter(|record| now - record.last_transition_at() > retention)
            .cloned()
            .collect()
    }
}

/// Finds the file backing an artifact path, probing sibling extensions when a
/// post-processor renamed it.
pub async fn resolve_artifact(path: &Path) -> Option<PathBuf> {
    if is_file(path).await {
        return Some(path.to_path_buf());
    }
    for ext in RECOVERY_EXTENSIONS {
        let candidate = path.with_extension(ext);
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
