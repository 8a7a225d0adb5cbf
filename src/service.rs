#![forbid(unsafe_code)]

//! Lifecycle-scoped owner of the cache, registry, progress channel, scheduler,
//! and sweeper. Request handlers hold a cheap clone of [`DownloadService`]
//! and never reach into the parts directly.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::MetadataCache;
use crate::error::{FetchError, FetchResult};
use crate::extractor::{MediaExtractor, MediaFormat};
use crate::format::{DownloadOptions, format_duration, format_size};
use crate::progress::{ProgressChannel, SubscriberId};
use crate::registry::{TaskId, TaskRecord, TaskRegistry, TaskState, resolve_artifact};
use crate::scheduler::Scheduler;
use crate::security::is_within;
use crate::sweeper::{RetentionSweeper, SweeperHandle};

const MAX_VIDEO_FORMATS: usize = 10;
const MAX_AUDIO_FORMATS: usize = 5;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Knobs the service needs; the binary fills these from its settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub download_dir: PathBuf,
    pub workers: usize,
    pub metadata_ttl: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataSummary {
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub duration_human: String,
    pub uploader: Option<String>,
    pub id: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoFormatEntry {
    pub id: String,
    pub resolution: String,
    pub ext: Option<String>,
    pub size: String,
    pub quality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFormatEntry {
    pub id: String,
    pub quality: String,
    pub ext: Option<String>,
    pub size: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormatListing {
    pub video_formats: Vec<VideoFormatEntry>,
    pub audio_formats: Vec<AudioFormatEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub active_task_count: usize,
    pub cached_metadata_count: usize,
}

#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: ServiceConfig,
    cache: Arc<MetadataCache>,
    registry: Arc<TaskRegistry>,
    progress: ProgressChannel,
    scheduler: Scheduler,
    sweeper: RetentionSweeper,
    sweeper_handle: Mutex<Option<SweeperHandle>>,
}

impl DownloadService {
    /// Builds every component and starts the worker pool. Must run inside a
    /// tokio runtime.
    pub fn new(config: ServiceConfig, extractor: Arc<dyn MediaExtractor>) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let progress = ProgressChannel::new();
        let cache = Arc::new(MetadataCache::new(
            Arc::clone(&extractor),
            config.metadata_ttl,
        ));
        let scheduler = Scheduler::start(
            config.workers,
            Arc::clone(&registry),
            progress.clone(),
            extractor,
        );
        let sweeper =
            RetentionSweeper::new(Arc::clone(&registry), Arc::clone(&cache), config.retention);

        Self {
            inner: Arc::new(ServiceInner {
                config,
                cache,
                registry,
                progress,
                scheduler,
                sweeper,
                sweeper_handle: Mutex::new(None),
            }),
        }
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.inner.progress
    }

    pub async fn metadata(&self, url: &str) -> FetchResult<MetadataSummary> {
        let metadata = self.inner.cache.get_or_fetch(url).await?;
        Ok(MetadataSummary {
            title: metadata.title.clone(),
            duration_seconds: metadata.duration,
            duration_human: format_duration(metadata.duration),
            uploader: metadata.uploader.clone(),
            id: metadata.id.clone(),
            thumbnail_url: format!("https://img.youtube.com/vi/{}/maxresdefault.jpg", metadata.id),
        })
    }

    pub async fn formats(&self, url: &str) -> FetchResult<FormatListing> {
        let metadata = self.inner.cache.get_or_fetch(url).await?;
        Ok(list_formats(&metadata.formats))
    }

    /// Validates and enqueues a download. Returns once the task is registered.
    pub fn submit(
        &self,
        url: &str,
        options: DownloadOptions,
        subscriber: Option<SubscriberId>,
    ) -> FetchResult<TaskId> {
        let url = url.trim();
        if url.is_empty() {
            return Err(FetchError::Validation("URL is required".to_string()));
        }
        let id = self
            .inner
            .scheduler
            .submit(url.to_string(), options, subscriber)?;
        info!(task = %id, url, subscriber = ?subscriber, "download submitted");
        Ok(id)
    }

    pub fn status(&self, id: TaskId) -> FetchResult<TaskRecord> {
        self.inner.registry.get(id).ok_or(FetchError::TaskNotFound)
    }

    /// Locates the finished file for a completed task.
    pub async fn artifact(&self, id: TaskId) -> FetchResult<PathBuf> {
        let record = self.status(id)?;
        if record.state != TaskState::Completed {
            return Err(FetchError::TaskNotReady(record.state));
        }
        let recorded = record.artifact.ok_or_else(|| {
            FetchError::ArtifactMissing(self.inner.config.download_dir.clone())
        })?;
        let Some(path) = resolve_artifact(&recorded).await else {
            return Err(FetchError::ArtifactMissing(recorded));
        };
        if !is_within(&self.inner.config.download_dir, &path) {
            warn!(task = %id, path = %path.display(), "artifact outside download folder");
            return Err(FetchError::ArtifactMissing(path));
        }
        Ok(path)
    }

    /// `active_task_count` is every record still held by the registry,
    /// finished ones included, until the sweeper evicts them.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            active_task_count: self.inner.registry.len(),
            cached_metadata_count: self.inner.cache.len(),
        }
    }

    /// Starts the periodic retention sweep. Calling it twice is a no-op.
    pub fn start_sweeper(&self) {
        let mut handle = self.inner.sweeper_handle.lock();
        if handle.is_none() {
            *handle = Some(self.inner.sweeper.start(self.inner.config.sweep_interval));
            info!(
                interval_secs = self.inner.config.sweep_interval.as_secs(),
                retention_secs = self.inner.config.retention.as_secs(),
                "retention sweeper started"
            );
        }
    }

    pub async fn shutdown(&self) {
        let handle = self.inner.sweeper_handle.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.inner.scheduler.shutdown(SHUTDOWN_GRACE).await;
    }
}

/// Video entries deduplicated by resolution, then capped; audio-only entries
/// capped in listing order.
pub fn list_formats(formats: &[MediaFormat]) -> FormatListing {
    let mut listing = FormatListing::default();
    let mut seen_resolutions = HashSet::new();

    for format in formats {
        let quality = format
            .format_note
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        if format.has_video() {
            let resolution = format
                .resolution
                .clone()
                .unwrap_or_else(|| "audio only".to_string());
            if resolution != "audio only" && seen_resolutions.insert(resolution.clone()) {
                listing.video_formats.push(VideoFormatEntry {
                    id: format.format_id.clone(),
                    resolution,
                    ext: format.ext.clone(),
                    size: format_size(format.size()),
                    quality,
                });
            }
        } else if format.has_audio() {
            listing.audio_formats.push(AudioFormatEntry {
                id: format.format_id.clone(),
                quality,
                ext: format.ext.clone(),
                size: format_size(format.size()),
            });
        }
    }

    listing.video_formats.truncate(MAX_VIDEO_FORMATS);
    listing.audio_formats.truncate(MAX_AUDIO_FORMATS);
    listing
}

/// Name the client sees for an artifact.
pub fn artifact_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string())
}
