#![forbid(unsafe_code)]

//! Fixed-size worker pool draining an unbounded FIFO of accepted tasks.
//!
//! A task is registered as `pending` before it is queued, so a status query
//! issued right after submission always finds it. Workers own every later
//! transition and publish the terminal progress event only after the record
//! has changed, and only after the task's intermediate events have drained.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::error::{FetchError, FetchResult};
use crate::extractor::{ExtractErrorKind, MediaExtractor};
use crate::format::{DownloadOptions, DownloadPlan};
use crate::progress::{ProgressChannel, ProgressEvent, ProgressMessage, ProgressSender, SubscriberId};
use crate::registry::{TaskId, TaskRecord, TaskRegistry, TransitionError, resolve_artifact};

pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Work item handed from `submit` to a worker.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub url: String,
    pub plan: DownloadPlan,
    pub subscriber: Option<SubscriberId>,
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>>;

/// Extractor runs currently in flight, keyed by the task they serve.
type RunningDownloads = Arc<Mutex<HashMap<TaskId, AbortHandle>>>;

struct Worker {
    registry: Arc<TaskRegistry>,
    progress: ProgressChannel,
    extractor: Arc<dyn MediaExtractor>,
    running: RunningDownloads,
}

pub struct Scheduler {
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: RunningDownloads,
    registry: Arc<TaskRegistry>,
}

impl Scheduler {
    /// Spawns `worker_count` workers (at least one) on the current runtime.
    pub fn start(
        worker_count: usize,
        registry: Arc<TaskRegistry>,
        progress: ProgressChannel,
        extractor: Arc<dyn MediaExtractor>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(receiver));
        let running = RunningDownloads::default();
        let worker = Arc::new(Worker {
            registry: Arc::clone(&registry),
            progress,
            extractor,
            running: Arc::clone(&running),
        });

        let workers = (0..worker_count)
            .map(|index| {
                let worker = Arc::clone(&worker);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { worker.run_loop(index, queue).await })
            })
            .collect();
        info!(worker_count, "download workers started");

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            running,
            registry,
        }
    }

    /// Registers and enqueues a validated request. Returns immediately.
    pub fn submit(
        &self,
        url: String,
        options: DownloadOptions,
        subscriber: Option<SubscriberId>,
    ) -> FetchResult<TaskId> {
        let sender = self.sender.lock().clone().ok_or(FetchError::ShuttingDown)?;
        let record = TaskRecord::pending(url.clone(), options, subscriber);
        // Each task gets a folder of its own, named after its id.
        let plan = record.options.plan().in_folder(record.id.to_string());
        let id = self.registry.insert(record);

        let queued = QueuedTask {
            id,
            url,
            plan,
            subscriber,
        };
        if sender.send(queued).is_err() {
            self.registry.remove(id);
            return Err(FetchError::ShuttingDown);
        }
        debug!(task = %id, "task queued");
        Ok(id)
    }

    /// Stops accepting work, lets workers drain the backlog for up to
    /// `grace`, then aborts whatever is still running, extractor runs
    /// included.
    pub async fn shutdown(&self, grace: Duration) {
        self.sender.lock().take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + grace;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("worker still busy after grace period, aborting");
                handle.abort();
            }
        }
        for (id, download) in self.running.lock().drain() {
            warn!(task = %id, "aborting unfinished download");
            download.abort();
        }
        info!("download workers stopped");
    }
}

impl Worker {
    async fn run_loop(&self, index: usize, queue: SharedQueue) {
        loop {
            // The queue lock is held only while waiting for the next item.
            let next = queue.lock().await.recv().await;
            let Some(task) = next else {
                debug!(worker = index, "queue closed");
                break;
            };
            self.process(task).await;
        }
    }

    async fn process(&self, task: QueuedTask) {
        let id = task.id;
        if let Err(err) = self.registry.mark_running(id) {
            warn!(task = %id, error = %err, "skipping task");
            return;
        }
        info!(task = %id, url = %task.url, selector = %task.plan.selector, "download started");

        let (sender, forwarder) = self.progress.task_stream(id, task.subscriber);
        let outcome = self.download(id, task.url, task.plan, sender).await;
        // Every intermediate event is handed over before the terminal one.
        let _ = forwarder.await;

        let outcome = match outcome {
            Ok(path) => match self.registry.mark_completed(id, path) {
                Ok(record) => Ok(record),
                Err(TransitionError::ArtifactMissing(path)) => {
                    Err(FetchError::ArtifactMissing(path).to_string())
                }
                Err(err) => {
                    error!(task = %id, error = %err, "cannot complete task");
                    return;
                }
            },
            Err(message) => Err(message),
        };

        let event = match outcome {
            Ok(record) => {
                let filename = record.filename.unwrap_or_default();
                info!(task = %id, filename = %filename, "download completed");
                ProgressEvent::Complete { filename }
            }
            Err(message) => {
                warn!(task = %id, error = %message, "download failed");
                if let Err(err) = self.registry.mark_failed(id, message.clone()) {
                    error!(task = %id, error = %err, "cannot fail task");
                    return;
                }
                ProgressEvent::Error { error: message }
            }
        };

        if let Some(subscriber) = task.subscriber {
            self.progress
                .publish(subscriber, ProgressMessage { task_id: id, event });
        }
    }

    /// Runs the extractor on its own task so a panic becomes a failure
    /// instead of killing the worker. A missing format gets exactly one
    /// retry with the unconditional selector.
    async fn download(
        &self,
        id: TaskId,
        url: String,
        plan: DownloadPlan,
        progress: ProgressSender,
    ) -> Result<PathBuf, String> {
        let extractor = Arc::clone(&self.extractor);
        let attempt = tokio::spawn(async move {
            match extractor.execute_download(&url, &plan, progress.clone()).await {
                Err(err) if err.kind == ExtractErrorKind::FormatUnavailable => {
                    info!(url = %url, "requested format unavailable, retrying unconditionally");
                    extractor
                        .execute_download(&url, &plan.with_unconditional_selector(), progress)
                        .await
                }
                other => other,
            }
        });
        self.running.lock().insert(id, attempt.abort_handle());
        let joined = attempt.await;
        self.running.lock().remove(&id);

        let path = match joined {
            Ok(Ok(path)) => path,
            Ok(Err(err)) if err.kind == ExtractErrorKind::FormatUnavailable => {
                return Err(FetchError::FormatUnavailable(err.message).to_string());
            }
            Ok(Err(err)) => return Err(err.message),
            Err(join) if join.is_panic() => {
                return Err("Download failed: extractor crashed".to_string());
            }
            Err(join) => return Err(format!("Download failed: {join}")),
        };

        resolve_artifact(&path)
            .await
            .ok_or_else(|| FetchError::ArtifactMissing(path).to_string())
    }
}
