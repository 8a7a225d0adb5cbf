//! In-process extractor double for unit tests.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::extractor::{ExtractError, ExtractErrorKind, MediaExtractor, VideoMetadata};
use crate::format::{DownloadPlan, UNCONDITIONAL_SELECTOR};
use crate::progress::{ProgressEvent, ProgressSender, TransferProgress};

#[derive(Clone, Debug)]
pub(crate) enum Outcome {
    Succeed,
    Fail(ExtractError),
    /// Rejects every selector except the unconditional one.
    RequireUnconditional,
    /// Reports a path that was never written.
    LoseFile,
    Panic,
}

pub(crate) struct StubExtractor {
    pub dir: PathBuf,
    pub delay: Duration,
    pub outcome: Outcome,
    pub metadata_error: Option<ExtractError>,
    pub calls: AtomicUsize,
    pub metadata_calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub selectors: Mutex<Vec<String>>,
}

impl StubExtractor {
    pub fn new(dir: impl Into<PathBuf>, outcome: Outcome) -> Self {
        Self {
            dir: dir.into(),
            delay: Duration::from_millis(100),
            outcome,
            metadata_error: None,
            calls: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            selectors: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MediaExtractor for StubExtractor {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, ExtractError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.metadata_error {
            return Err(err.clone());
        }
        Ok(VideoMetadata {
            id: "abc123".into(),
            title: format!("Clip at {url}"),
            duration: Some(3723),
            uploader: Some("Uploader".into()),
            formats: Vec::new(),
        })
    }

    async fn execute_download(
        &self,
        _url: &str,
        plan: &DownloadPlan,
        progress: ProgressSender,
    ) -> Result<PathBuf, ExtractError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.selectors.lock().push(plan.selector.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let _ = progress.send(ProgressEvent::Downloading(TransferProgress {
            percent: Some(50.0),
            ..TransferProgress::default()
        }));
        tokio::time::sleep(self.delay).await;
        let _ = progress.send(ProgressEvent::processing());
        self.active.fetch_sub(1, Ordering::SeqCst);

        let ext = plan.final_extension.unwrap_or("mp4");
        let folder = match &plan.output_folder {
            Some(folder) => self.dir.join(folder),
            None => self.dir.clone(),
        };
        let path = folder.join(format!("clip-{call}.{ext}"));
        match &self.outcome {
            Outcome::Succeed => {}
            Outcome::Fail(err) => return Err(err.clone()),
            Outcome::RequireUnconditional if plan.selector != UNCONDITIONAL_SELECTOR => {
                return Err(ExtractError::new(
                    ExtractErrorKind::FormatUnavailable,
                    "Download failed: Requested format is not available",
                ));
            }
            Outcome::RequireUnconditional => {}
            Outcome::LoseFile => return Ok(path),
            Outcome::Panic => panic!("extractor blew up"),
        }
        std::fs::create_dir_all(&folder)
            .and_then(|()| std::fs::write(&path, b"media"))
            .map_err(|err| ExtractError::new(ExtractErrorKind::Terminal, err.to_string()))?;
        Ok(path)
    }
}
