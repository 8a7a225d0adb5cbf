#![forbid(unsafe_code)]

//! Download options and the format-selection policy handed to the extractor.
//!
//! Requests arrive as loose strings (`"720p"`, `"mp4"`, `"audio"`). They are
//! validated once here into [`DownloadOptions`] and then resolved into a
//! [`DownloadPlan`], the declarative instruction set the extractor executes.

use std::fmt;

use serde::Serialize;

use crate::error::{FetchError, FetchResult};

/// Selection used for the single fallback retry after the extractor reports
/// that the requested format does not exist.
pub const UNCONDITIONAL_SELECTOR: &str = "best";

/// Output naming template, relative to the task's output folder.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

const DEFAULT_AUDIO_BITRATE: u32 = 192;
const BEST_AUDIO_BITRATE: u32 = 320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Best,
    Worst,
    /// Vertical-resolution ceiling written as `720p`.
    Height(u32),
    /// Bare number. Used as a bitrate for audio and as a height for video.
    Numeric(u32),
}

impl Quality {
    pub fn parse(value: &str) -> FetchResult<Self> {
        let trimmed = value.trim().to_ascii_lowercase();
        match trimmed.as_str() {
            "" | "best" => Ok(Self::Best),
            "worst" => Ok(Self::Worst),
            other => {
                if let Some(height) = other.strip_suffix('p') {
                    return parse_positive(height)
                        .map(Self::Height)
                        .ok_or_else(|| invalid_quality(value));
                }
                parse_positive(other)
                    .map(Self::Numeric)
                    .ok_or_else(|| invalid_quality(value))
            }
        }
    }

    fn height_ceiling(self) -> Option<u32> {
        match self {
            Self::Height(value) | Self::Numeric(value) => Some(value),
            Self::Best | Self::Worst => None,
        }
    }

    fn audio_bitrate(self) -> u32 {
        match self {
            Self::Best => BEST_AUDIO_BITRATE,
            Self::Numeric(value) => value,
            Self::Worst | Self::Height(_) => DEFAULT_AUDIO_BITRATE,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => f.write_str("best"),
            Self::Worst => f.write_str("worst"),
            Self::Height(value) => write!(f, "{value}p"),
            Self::Numeric(value) => write!(f, "{value}"),
        }
    }
}

fn parse_positive(value: &str) -> Option<u32> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    value.parse::<u32>().ok().filter(|value| *value > 0)
}

fn invalid_quality(value: &str) -> FetchError {
    FetchError::Validation(format!(
        "invalid quality '{value}': expected best, worst, or a resolution such as 720p"
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
    Mkv,
    Mp3,
    M4a,
    Opus,
    Flac,
}

impl Container {
    pub fn parse(value: &str) -> FetchResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "mp4" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            "mkv" => Ok(Self::Mkv),
            "mp3" => Ok(Self::Mp3),
            "m4a" => Ok(Self::M4a),
            "opus" => Ok(Self::Opus),
            "flac" => Ok(Self::Flac),
            other => Err(FetchError::Validation(format!(
                "unsupported container format '{other}'"
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Opus => "opus",
            Self::Flac => "flac",
        }
    }

    /// Video container to produce; audio containers fall back to mp4.
    pub fn as_video(self) -> Self {
        match self {
            Self::Mp4 | Self::Webm | Self::Mkv => self,
            _ => Self::Mp4,
        }
    }

    /// Audio codec to extract; video containers fall back to mp3.
    pub fn as_audio(self) -> Self {
        match self {
            Self::Mp3 | Self::M4a | Self::Opus | Self::Flac => self,
            _ => Self::Mp3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    Video,
    Audio,
    /// No explicit preference: best combined audio+video.
    Combined,
}

impl FormatType {
    pub fn parse(value: Option<&str>) -> FetchResult<Self> {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            None => Ok(Self::Video),
            Some(value) => match value.as_str() {
                "video" => Ok(Self::Video),
                "audio" => Ok(Self::Audio),
                "" | "both" | "combined" => Ok(Self::Combined),
                other => Err(FetchError::Validation(format!(
                    "unsupported format_type '{other}'"
                ))),
            },
        }
    }
}

/// Wall-clock offset accepted as `SS`, `MM:SS`, or `HH:MM:SS`, each with an
/// optional fractional second part.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timestamp {
    raw: String,
    #[serde(skip)]
    seconds: f64,
}

impl Timestamp {
    pub fn parse(value: &str) -> FetchResult<Self> {
        let raw = value.trim();
        let invalid = || {
            FetchError::Validation(format!(
                "invalid time '{value}': expected seconds or HH:MM:SS"
            ))
        };
        let parts: Vec<&str> = raw.split(':').collect();
        if raw.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }
        let mut seconds = 0.0;
        for (index, part) in parts.iter().enumerate() {
            let is_last = index == parts.len() - 1;
            let valid = !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_digit() || (is_last && c == '.'));
            if !valid {
                return Err(invalid());
            }
            let value: f64 = part.parse().map_err(|_| invalid())?;
            if index > 0 && value >= 60.0 {
                return Err(invalid());
            }
            seconds = seconds * 60.0 + value;
        }
        Ok(Self {
            raw: raw.to_string(),
            seconds,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn seconds(&self) -> f64 {
        self.seconds
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Trim {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
}

impl Trim {
    /// Blank strings count as absent, matching what browser forms send.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> FetchResult<Self> {
        let start = non_blank(start).map(Timestamp::parse).transpose()?;
        let end = non_blank(end).map(Timestamp::parse).transpose()?;
        if let (Some(start), Some(end)) = (&start, &end)
            && end.seconds() <= start.seconds()
        {
            return Err(FetchError::Validation(format!(
                "end_time {} must be after start_time {}",
                end.as_str(),
                start.as_str()
            )));
        }
        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// ffmpeg arguments applied while re-encoding.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(start) = &self.start {
            args.push("-ss".to_string());
            args.push(start.as_str().to_string());
        }
        if let Some(end) = &self.end {
            args.push("-to".to_string());
            args.push(end.as_str().to_string());
        }
        args
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Validated request options.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOptions {
    pub quality: Quality,
    pub container: Container,
    pub format_type: FormatType,
    #[serde(skip_serializing_if = "Trim::is_empty")]
    pub trim: Trim,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            quality: Quality::Best,
            container: Container::Mp4,
            format_type: FormatType::Video,
            trim: Trim::default(),
        }
    }
}

impl DownloadOptions {
    pub fn parse(
        quality: Option<&str>,
        container: Option<&str>,
        format_type: Option<&str>,
        start_time: Option<&str>,
        end_time: Option<&str>,
    ) -> FetchResult<Self> {
        Ok(Self {
            quality: quality.map(Quality::parse).transpose()?.unwrap_or(Quality::Best),
            container: container
                .map(Container::parse)
                .transpose()?
                .unwrap_or(Container::Mp4),
            format_type: FormatType::parse(format_type)?,
            trim: Trim::parse(start_time, end_time)?,
        })
    }

    /// Resolves these options into the instructions the extractor runs.
    pub fn plan(&self) -> DownloadPlan {
        let selector = match self.format_type {
            FormatType::Audio => "bestaudio/best".to_string(),
            FormatType::Video => video_selector(self.quality, self.container.as_video()),
            FormatType::Combined => video_selector(Quality::Best, self.container.as_video()),
        };

        let mut post_processors = Vec::new();
        let final_extension = match self.format_type {
            FormatType::Audio => {
                let codec = self.container.as_audio();
                let quality = if codec == Container::Flac {
                    "0".to_string()
                } else {
                    self.quality.audio_bitrate().to_string()
                };
                post_processors.push(PostProcessor::ExtractAudio { codec, quality });
                Some(codec.extension())
            }
            FormatType::Video => {
                let container = self.container.as_video();
                post_processors.push(PostProcessor::ConvertVideo { container });
                Some(container.extension())
            }
            FormatType::Combined if !self.trim.is_empty() => {
                let container = self.container.as_video();
                post_processors.push(PostProcessor::ConvertVideo { container });
                Some(container.extension())
            }
            FormatType::Combined => None,
        };

        DownloadPlan {
            selector,
            post_processors,
            trim: self.trim.clone(),
            final_extension,
            output_folder: None,
        }
    }
}

fn video_selector(quality: Quality, container: Container) -> String {
    if quality == Quality::Worst {
        return "worstvideo+worstaudio/worst".to_string();
    }

    let bound = quality
        .height_ceiling()
        .map(|height| format!("[height<={height}]"))
        .unwrap_or_default();
    let audio_ext = match container {
        Container::Mp4 => Some("m4a"),
        Container::Webm => Some("webm"),
        _ => None,
    };

    let mut candidates = Vec::new();
    if let Some(audio_ext) = audio_ext {
        let ext = container.extension();
        candidates.push(format!("best{bound}[ext={ext}]"));
        candidates.push(format!("bestvideo{bound}[ext={ext}]+bestaudio[ext={audio_ext}]"));
    }
    candidates.push(format!("bestvideo{bound}+bestaudio"));
    if !bound.is_empty() {
        candidates.push(format!("best{bound}"));
    }
    candidates.push(UNCONDITIONAL_SELECTOR.to_string());
    candidates.join("/")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostProcessor {
    ExtractAudio { codec: Container, quality: String },
    ConvertVideo { container: Container },
}

/// Everything the extractor needs to produce one artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadPlan {
    pub selector: String,
    pub post_processors: Vec<PostProcessor>,
    #[serde(skip_serializing_if = "Trim::is_empty")]
    pub trim: Trim,
    /// Extension of the finished file; `None` keeps the one the tool picked.
    pub final_extension: Option<&'static str>,
    /// Subfolder of the download folder reserved for this artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_folder: Option<String>,
}

impl DownloadPlan {
    /// Same post-processing, unconditional stream selection.
    pub fn with_unconditional_selector(&self) -> Self {
        Self {
            selector: UNCONDITIONAL_SELECTOR.to_string(),
            ..self.clone()
        }
    }

    /// Writes the artifact into `folder` under the download folder, so two
    /// tasks fetching the same title never share a file.
    pub fn in_folder(self, folder: impl Into<String>) -> Self {
        Self {
            output_folder: Some(folder.into()),
            ..self
        }
    }

    /// Trimming always re-encodes; cutting a container in place breaks output.
    pub fn requires_reencode(&self) -> bool {
        !self.trim.is_empty()
    }
}

/// Renders byte counts the way the web UI shows them (`12.50 MB`).
pub fn format_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return "Unknown".to_string();
    };
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} TB")
}

/// Renders durations as `1h 2m 3s`, `2m 3s`, or `3s`.
pub fn format_duration(seconds: Option<u64>) -> String {
    let Some(seconds) = seconds else {
        return "Unknown".to_string();
    };
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
