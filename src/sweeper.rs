#![forbid(unsafe_code)]

//! Periodic retention sweep over finished tasks and stale metadata.

use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::registry::{TaskId, TaskRegistry, TaskState};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub tasks_removed: usize,
    pub files_deleted: usize,
    pub file_errors: usize,
    pub cache_entries_purged: usize,
}

#[derive(Clone)]
pub struct RetentionSweeper {
    registry: Arc<TaskRegistry>,
    cache: Arc<MetadataCache>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(registry: Arc<TaskRegistry>, cache: Arc<MetadataCache>, retention: Duration) -> Self {
        Self {
            registry,
            cache,
            retention,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Evicts terminal records whose last transition is older than the
    /// retention window, deleting completed artifacts on the way. A failed
    /// delete is logged and the record is evicted anyway. Pending and running
    /// records are never touched.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let mut report = SweepReport::default();

        for record in self.registry.expired(now, retention) {
            if record.state == TaskState::Completed
                && let Some(artifact) = record.artifact.as_deref()
            {
                match delete_artifact(record.id, artifact).await {
                    Ok(true) => {
                        debug!(task = %record.id, path = %artifact.display(), "artifact deleted");
                        report.files_deleted += 1;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(task = %record.id, error = %err, "cannot delete artifact");
                        report.file_errors += 1;
                    }
                }
            }
            if self.registry.remove(record.id).is_some() {
                report.tasks_removed += 1;
            }
        }

        report.cache_entries_purged = self.cache.purge_expired();
        if report != SweepReport::default() {
            info!(
                tasks_removed = report.tasks_removed,
                files_deleted = report.files_deleted,
                file_errors = report.file_errors,
                cache_entries_purged = report.cache_entries_purged,
                "retention sweep finished"
            );
        }
        report
    }

    /// Runs a sweep every `period` until the handle is stopped.
    pub fn start(&self, period: Duration) -> SweeperHandle {
        let token = CancellationToken::new();
        let sweeper = self.clone();
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        sweeper.sweep().await;
                    }
                }
            }
            debug!("retention sweeper stopped");
        });
        SweeperHandle { token, task }
    }
}

/// Removes exactly the recorded file, then the task's own output folder if
/// the file lives in one. Files belonging to other tasks are never touched.
async fn delete_artifact(id: TaskId, artifact: &Path) -> std::io::Result<bool> {
    let mut removed = match tokio::fs::remove_file(artifact).await {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => return Err(err),
    };
    if let Some(folder) = artifact.parent()
        && folder.file_name().is_some_and(|name| name == id.to_string().as_str())
    {
        match tokio::fs::remove_dir_all(folder).await {
            Ok(()) => removed = true,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(removed)
}

pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_METADATA_TTL;
    use crate::format::DownloadOptions;
    use crate::registry::TaskRecord;
    use crate::testing::{Outcome, StubExtractor};
    use std::{fs, path::PathBuf};
    use tempfile::tempdir;

    fn sweeper(dir: &Path) -> (RetentionSweeper, Arc<TaskRegistry>) {
        let registry = Arc::new(TaskRegistry::new());
        let cache = Arc::new(MetadataCache::new(
            Arc::new(StubExtractor::new(dir, Outcome::Succeed)),
            DEFAULT_METADATA_TTL,
        ));
        (
            RetentionSweeper::new(Arc::clone(&registry), cache, DEFAULT_RETENTION),
            registry,
        )
    }

    fn record() -> TaskRecord {
        TaskRecord::pending("https://example.com/v".into(), DownloadOptions::default(), None)
    }

    /// A record that finished `age` ago with `artifact` on disk.
    fn finished(
        base: TaskRecord,
        state: TaskState,
        artifact: Option<PathBuf>,
        age: chrono::Duration,
    ) -> TaskRecord {
        let at = Utc::now() - age;
        TaskRecord {
            state,
            started_at: Some(at),
            completed_at: Some(at),
            filename: artifact
                .as_deref()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned()),
            artifact,
            ..base
        }
    }

    fn write(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"media").unwrap();
    }

    #[tokio::test]
    async fn old_terminal_records_are_evicted_with_their_files() {
        let dir = tempdir().unwrap();
        let (sweeper, registry) = sweeper(dir.path());

        let artifact = dir.path().join("clip.mp4");
        fs::write(&artifact, b"media").unwrap();
        let done = registry.insert(record());
        registry.mark_running(done).unwrap();
        registry.mark_completed(done, artifact.clone()).unwrap();

        let failed = registry.insert(record());
        registry.mark_failed(failed, "boom").unwrap();

        let fresh = registry.insert(record());
        registry.mark_running(fresh).unwrap();

        // Nothing is old enough yet.
        assert_eq!(sweeper.sweep().await.tasks_removed, 0);

        let later = Utc::now() + chrono::Duration::hours(2);
        let report = sweeper.sweep_at(later).await;
        assert_eq!(report.tasks_removed, 2);
        assert_eq!(report.files_deleted, 1);
        assert!(!artifact.exists());
        assert!(registry.get(done).is_none());
        assert!(registry.get(failed).is_none());
        assert_eq!(registry.state(fresh), Some(TaskState::Running));
    }

    #[tokio::test]
    async fn pending_records_survive_any_age() {
        let dir = tempdir().unwrap();
        let (sweeper, registry) = sweeper(dir.path());
        let queued = registry.insert(record());

        let report = sweeper
            .sweep_at(Utc::now() + chrono::Duration::days(30))
            .await;
        assert_eq!(report.tasks_removed, 0);
        assert_eq!(registry.state(queued), Some(TaskState::Pending));
    }

    #[tokio::test]
    async fn task_folder_is_removed_even_after_a_rename() {
        let dir = tempdir().unwrap();
        let (sweeper, registry) = sweeper(dir.path());

        let base = record();
        let folder = dir.path().join(base.id.to_string());
        let recorded = folder.join("clip.mp4");
        write(&recorded);
        // A post-processor renamed the file after completion.
        let renamed = folder.join("clip.mkv");
        fs::rename(&recorded, &renamed).unwrap();
        registry.insert(finished(
            base,
            TaskState::Completed,
            Some(recorded),
            chrono::Duration::hours(2),
        ));

        let report = sweeper.sweep().await;
        assert_eq!(report.tasks_removed, 1);
        assert_eq!(report.files_deleted, 1);
        assert!(!folder.exists());
    }

    #[tokio::test]
    async fn younger_task_with_the_same_title_keeps_its_file() {
        let dir = tempdir().unwrap();
        let (sweeper, registry) = sweeper(dir.path());

        let old = record();
        let old_file = dir.path().join(old.id.to_string()).join("Sample Clip.mp4");
        write(&old_file);
        registry.insert(finished(
            old,
            TaskState::Completed,
            Some(old_file.clone()),
            chrono::Duration::hours(2),
        ));

        let young = record();
        let young_file = dir.path().join(young.id.to_string()).join("Sample Clip.mp4");
        write(&young_file);
        let young = registry.insert(finished(
            young,
            TaskState::Completed,
            Some(young_file.clone()),
            chrono::Duration::seconds(60),
        ));

        let report = sweeper.sweep().await;
        assert_eq!(report.tasks_removed, 1);
        assert!(!old_file.exists());
        assert_eq!(registry.state(young), Some(TaskState::Completed));
        assert!(young_file.is_file());
    }

    #[tokio::test]
    async fn missing_file_never_leads_to_a_sibling() {
        let dir = tempdir().unwrap();
        let (sweeper, registry) = sweeper(dir.path());

        registry.insert(finished(
            record(),
            TaskState::Completed,
            Some(dir.path().join("Talk.mp4")),
            chrono::Duration::hours(2),
        ));
        let audio = dir.path().join("Talk.mp3");
        write(&audio);
        let young = registry.insert(finished(
            record(),
            TaskState::Completed,
            Some(audio.clone()),
            chrono::Duration::seconds(60),
        ));

        let report = sweeper.sweep().await;
        assert_eq!(report.tasks_removed, 1);
        assert_eq!(report.files_deleted, 0);
        assert_eq!(registry.state(young), Some(TaskState::Completed));
        assert!(audio.is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweeps_run_until_stopped() {
        let dir = tempdir().unwrap();
        let (sweeper, registry) = sweeper(dir.path());
        let handle = sweeper.start(Duration::from_secs(60));

        let swept = registry.insert(finished(
            record(),
            TaskState::Failed,
            None,
            chrono::Duration::hours(2),
        ));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(registry.get(swept).is_none());

        handle.stop().await;
        let kept = registry.insert(finished(
            record(),
            TaskState::Failed,
            None,
            chrono::Duration::hours(2),
        ));
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(registry.state(kept), Some(TaskState::Failed));
    }
}
