#![forbid(unsafe_code)]

//! Boundary to the external extraction/download tool.
//!
//! Everything past this trait (site extraction, format negotiation,
//! transcoding) is opaque. [`YtDlpExtractor`] drives the `yt-dlp` binary as a
//! child process, parses its line-oriented progress output, and classifies its
//! failures.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::format::{DownloadPlan, OUTPUT_TEMPLATE, PostProcessor};
use crate::progress::{ProgressEvent, ProgressSender, TransferProgress};

/// Desktop browser identity sent with every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Lowercase phrases that indicate a sign-in or bot challenge.
const BOT_CHALLENGE_PHRASES: &[&str] = &[
    "sign in to confirm",
    "not a bot",
    "bot detection",
    "please sign in",
    "cookies are no longer valid",
    "use --cookies",
];

const FORMAT_UNAVAILABLE_PHRASES: &[&str] = &[
    "requested format is not available",
    "requested format not available",
    "no video formats found",
];

const RETRYABLE_PHRASES: &[&str] = &[
    "timed out",
    "timeout",
    "temporary failure",
    "connection reset",
    "connection refused",
    "network is unreachable",
    "http error 429",
    "http error 500",
    "http error 502",
    "http error 503",
    "http error 504",
];

/// Post-processor markers printed by yt-dlp once the transfer is done.
const PROCESSING_MARKERS: &[&str] = &[
    "[Merger]",
    "[ExtractAudio]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[ModifyChapters]",
    "[Fixup",
    "[ffmpeg]",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub format_note: Option<String>,
}

impl MediaFormat {
    pub fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    pub fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    pub fn size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && codec != "none")
}

/// Subset of the tool's info payload this service exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub formats: Vec<MediaFormat>,
}

#[derive(Deserialize)]
struct RawInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    #[serde(default)]
    formats: Vec<MediaFormat>,
}

impl From<RawInfo> for VideoMetadata {
    fn from(raw: RawInfo) -> Self {
        Self {
            id: raw.id.unwrap_or_default(),
            title: raw.title.or(raw.fulltitle).unwrap_or_default(),
            duration: raw
                .duration
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value.round() as u64),
            uploader: raw.uploader.or(raw.channel),
            formats: raw.formats,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractErrorKind {
    /// Transient (network, throttling). A resubmission may succeed.
    Retryable,
    Terminal,
    /// The selection expression matched nothing.
    FormatUnavailable,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExtractError {
    pub kind: ExtractErrorKind,
    pub message: String,
}

impl ExtractError {
    pub fn new(kind: ExtractErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Builds an error whose kind is inferred from the tool's output.
    pub fn from_output(context: &str, output: &str) -> Self {
        let detail = output.trim();
        let message = if detail.is_empty() {
            context.to_string()
        } else {
            format!("{context}: {detail}")
        };
        Self::new(classify(output), message)
    }

    pub fn is_bot_detection(&self) -> bool {
        is_bot_challenge(&self.message)
    }
}

/// Case-insensitive match for sign-in or bot challenges. A bare `bot` only
/// counts as a whole word so titles like "robotics" do not trip it.
pub fn is_bot_challenge(text: &str) -> bool {
    let lower = text.to_lowercase();
    BOT_CHALLENGE_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
        || lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "bot" || word == "bots")
}

pub fn classify(output: &str) -> ExtractErrorKind {
    let lower = output.to_lowercase();
    if FORMAT_UNAVAILABLE_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
    {
        ExtractErrorKind::FormatUnavailable
    } else if RETRYABLE_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        ExtractErrorKind::Retryable
    } else {
        ExtractErrorKind::Terminal
    }
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, ExtractError>;

    /// Downloads `url` according to `plan`, reporting progress on `progress`,
    /// and returns the path of the finished file.
    async fn execute_download(
        &self,
        url: &str,
        plan: &DownloadPlan,
        progress: ProgressSender,
    ) -> Result<PathBuf, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: PathBuf,
    output_dir: PathBuf,
    cookies_file: Option<PathBuf>,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            output_dir: output_dir.into(),
            cookies_file: None,
        }
    }

    pub fn with_cookies(mut self, cookies_file: impl Into<PathBuf>) -> Self {
        self.cookies_file = Some(cookies_file.into());
        self
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--no-playlist")
            .arg("--user-agent")
            .arg(USER_AGENT)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &self.cookies_file {
            Some(cookies) if cookies.is_file() => {
                command.arg("--cookies").arg(cookies);
            }
            Some(cookies) => {
                debug!(path = %cookies.display(), "cookies file missing, requests may be challenged");
            }
            None => {}
        }
        command
    }

    fn output_template(&self, plan: &DownloadPlan) -> PathBuf {
        match &plan.output_folder {
            Some(folder) => self.output_dir.join(folder).join(OUTPUT_TEMPLATE),
            None => self.output_dir.join(OUTPUT_TEMPLATE),
        }
    }

    fn download_args(&self, plan: &DownloadPlan) -> Vec<String> {
        let mut args = vec![
            "--format".to_string(),
            plan.selector.clone(),
            "--output".to_string(),
            self.output_template(plan).to_string_lossy().into_owned(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
        ];

        for processor in &plan.post_processors {
            match processor {
                PostProcessor::ExtractAudio { codec, quality } => {
                    args.push("--extract-audio".to_string());
                    args.push("--audio-format".to_string());
                    args.push(codec.extension().to_string());
                    args.push("--audio-quality".to_string());
                    args.push(audio_quality_arg(quality));
                }
                PostProcessor::ConvertVideo { container } => {
                    let flag = if plan.requires_reencode() {
                        "--recode-video"
                    } else {
                        "--remux-video"
                    };
                    args.push(flag.to_string());
                    args.push(container.extension().to_string());
                }
            }
        }

        let trim_args = plan.trim.ffmpeg_args();
        if !trim_args.is_empty() {
            args.push("--postprocessor-args".to_string());
            args.push(format!("ffmpeg:{}", trim_args.join(" ")));
        }
        args
    }
}

/// Bitrates above the VBR scale need an explicit unit.
fn audio_quality_arg(quality: &str) -> String {
    match quality.parse::<u32>() {
        Ok(value) if value > 10 => format!("{value}K"),
        _ => quality.to_string(),
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, ExtractError> {
        let mut command = self.base_command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg(url);

        let output = command.output().await.map_err(|err| {
            ExtractError::new(
                ExtractErrorKind::Terminal,
                format!("Error getting video info: failed to launch {}: {err}", self.binary.display()),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::from_output("Error getting video info", &stderr));
        }

        let info: RawInfo = serde_json::from_slice(&output.stdout).map_err(|err| {
            ExtractError::new(
                ExtractErrorKind::Terminal,
                format!("Error getting video info: unreadable metadata: {err}"),
            )
        })?;
        Ok(info.into())
    }

    async fn execute_download(
        &self,
        url: &str,
        plan: &DownloadPlan,
        progress: ProgressSender,
    ) -> Result<PathBuf, ExtractError> {
        let mut command = self.base_command();
        command.args(self.download_args(plan)).arg(url);

        let mut child = command.spawn().map_err(|err| {
            ExtractError::new(
                ExtractErrorKind::Terminal,
                format!("Download failed: failed to launch {}: {err}", self.binary.display()),
            )
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExtractError::new(
                ExtractErrorKind::Terminal,
                "Download failed: child process pipes unavailable",
            ));
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        let mut reporter = OutputReporter::new(progress);
        let mut printed_path: Option<String> = None;
        let mut diagnostics: Vec<String> = Vec::new();

        // Both pipes are read from this one task so progress stays ordered.
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if !reporter.observe(&line) && !line.trim().is_empty() && !line.starts_with('[') {
                            printed_path = Some(line.trim().to_string());
                        }
                    }
                    _ => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if !reporter.observe(&line) && !line.trim().is_empty() {
                            diagnostics.push(line);
                        }
                    }
                    _ => stderr_open = false,
                },
            }
        }

        let status = child.wait().await.map_err(|err| {
            ExtractError::new(
                ExtractErrorKind::Terminal,
                format!("Download failed: {err}"),
            )
        })?;

        if !status.success() {
            let detail = diagnostics.join("\n");
            warn!(url, %status, "yt-dlp exited unsuccessfully");
            return Err(ExtractError::from_output("Download failed", &detail));
        }

        let printed = printed_path.ok_or_else(|| {
            ExtractError::new(
                ExtractErrorKind::Terminal,
                "Download failed: yt-dlp did not report an output file",
            )
        })?;
        Ok(final_path(Path::new(&printed), plan))
    }
}

/// Applies the expected final extension to the path the tool printed.
fn final_path(printed: &Path, plan: &DownloadPlan) -> PathBuf {
    match plan.final_extension {
        Some(ext) => printed.with_extension(ext),
        None => printed.to_path_buf(),
    }
}

/// Turns raw output lines into progress events.
struct OutputReporter {
    sender: ProgressSender,
    processing_sent: bool,
}

impl OutputReporter {
    fn new(sender: ProgressSender) -> Self {
        Self {
            sender,
            processing_sent: false,
        }
    }

    /// Returns true when the line was progress chatter rather than content.
    fn observe(&mut self, line: &str) -> bool {
        if let Some(progress) = parse_progress_line(line) {
            let finished = progress.percent.is_some_and(|percent| percent >= 100.0);
            let _ = self.sender.send(ProgressEvent::Downloading(progress));
            // Post-processor chatter is muted by --print, so a finished
            // transfer is the only reliable processing signal.
            if finished {
                self.processing_started();
            }
            return true;
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("[download]") {
            return true;
        }
        if PROCESSING_MARKERS
            .iter()
            .any(|marker| trimmed.starts_with(marker))
        {
            self.processing_started();
            return true;
        }
        false
    }

    fn processing_started(&mut self) {
        if !self.processing_sent {
            self.processing_sent = true;
            let _ = self.sender.send(ProgressEvent::processing());
        }
    }
}

/// Parses lines such as
/// `[download]  45.2% of ~10.00MiB at 500.00KiB/s ETA 00:10`.
pub fn parse_progress_line(line: &str) -> Option<TransferProgress> {
    let rest = line.trim_start().strip_prefix("[download]")?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let percent = parts
        .first()?
        .strip_suffix('%')?
        .parse::<f64>()
        .ok()?
        .clamp(0.0, 100.0);

    let mut progress = TransferProgress {
        percent: Some(percent),
        ..TransferProgress::default()
    };
    for pair in parts.windows(2) {
        match pair[0] {
            "of" => progress.total_bytes = parse_size(pair[1]).map(|size| size as u64),
            "at" => progress.speed = parse_size(pair[1].trim_end_matches("/s")),
            "ETA" => progress.eta = parse_eta(pair[1]),
            _ => {}
        }
    }
    progress.downloaded_bytes = progress
        .total_bytes
        .map(|total| (total as f64 * percent / 100.0).round() as u64);
    Some(progress)
}

fn parse_size(value: &str) -> Option<f64> {
    let value = value.trim_start_matches('~');
    const UNITS: &[(&str, f64)] = &[
        ("TiB", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("KiB", 1024.0),
        ("B", 1.0),
    ];
    UNITS.iter().find_map(|(unit, factor)| {
        value
            .strip_suffix(unit)
            .and_then(|number| number.parse::<f64>().ok())
            .map(|number| number * factor)
    })
}

fn parse_eta(value: &str) -> Option<u64> {
    let mut seconds = 0u64;
    let mut fields = 0;
    for part in value.split(':') {
        seconds = seconds * 60 + part.parse::<u64>().ok()?;
        fields += 1;
    }
    (1..=3).contains(&fields).then_some(seconds)
}
