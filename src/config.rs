#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::cache::DEFAULT_METADATA_TTL;
use crate::scheduler::DEFAULT_WORKER_COUNT;
use crate::sweeper::{DEFAULT_RETENTION, DEFAULT_SWEEP_INTERVAL};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_COOKIES_FILE: &str = "cookies/youtube.txt";

/// Cookie payload handed over through the environment.
#[derive(Clone, PartialEq, Eq)]
pub enum CookieSource {
    Base64(String),
    Plain(String),
}

impl std::fmt::Debug for CookieSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base64(_) => f.write_str("Base64(<redacted>)"),
            Self::Plain(_) => f.write_str("Plain(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub download_dir: PathBuf,
    pub workers: usize,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub metadata_ttl: Duration,
    pub ytdlp_bin: PathBuf,
    pub cookies_file: PathBuf,
    pub cookies: Option<CookieSource>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            workers: DEFAULT_WORKER_COUNT,
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            metadata_ttl: DEFAULT_METADATA_TTL,
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            cookies_file: PathBuf::from(DEFAULT_COOKIES_FILE),
            cookies: None,
        }
    }
}

/// Command-line values; each one beats the environment and the env file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub download_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: Overrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    build_settings_with_overrides(file_vars, env_lookup, Overrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: Overrides,
) -> Settings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());
    let defaults = Settings::default();

    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup("FETCHTUBE_HOST"))
        .unwrap_or(defaults.host);
    let port = overrides
        .port
        .or_else(|| lookup_parsed("FETCHTUBE_PORT", &lookup))
        .unwrap_or(defaults.port);
    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("FETCHTUBE_DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or(defaults.download_dir);
    let workers = overrides
        .workers
        .or_else(|| lookup_parsed("FETCHTUBE_WORKERS", &lookup))
        .filter(|workers| *workers > 0)
        .unwrap_or(defaults.workers);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("FETCHTUBE_YTDLP_BIN").map(PathBuf::from))
        .unwrap_or(defaults.ytdlp_bin);
    let cookies_file = lookup("FETCHTUBE_COOKIES_FILE")
        .map(PathBuf::from)
        .unwrap_or(defaults.cookies_file);
    let cookies = lookup("YOUTUBE_COOKIES_BASE64")
        .map(CookieSource::Base64)
        .or_else(|| lookup("YOUTUBE_COOKIES").map(CookieSource::Plain));

    Settings {
        host,
        port,
        download_dir,
        workers,
        retention: parsed("FETCHTUBE_RETENTION_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.retention),
        sweep_interval: parsed("FETCHTUBE_SWEEP_INTERVAL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval),
        metadata_ttl: parsed("FETCHTUBE_METADATA_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.metadata_ttl),
        ytdlp_bin,
        cookies_file,
        cookies,
    }
}

fn lookup_parsed<T: FromStr>(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<T> {
    lookup(key).and_then(|value| value.parse::<T>().ok())
}

impl Settings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Writes an environment-supplied cookie payload to `cookies_file` and
    /// returns the file when one is available afterwards.
    pub fn provision_cookies(&self) -> Result<Option<PathBuf>> {
        if let Some(source) = &self.cookies {
            let content = match source {
                CookieSource::Base64(encoded) => {
                    let compact: String =
                        encoded.chars().filter(|c| !c.is_whitespace()).collect();
                    let bytes = STANDARD
                        .decode(compact)
                        .context("Decoding YOUTUBE_COOKIES_BASE64")?;
                    String::from_utf8(bytes).context("YOUTUBE_COOKIES_BASE64 is not UTF-8")?
                }
                CookieSource::Plain(content) => content.clone(),
            };
            if let Some(parent) = self.cookies_file.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Creating {}", parent.display()))?;
            }
            fs::write(&self.cookies_file, content)
                .with_context(|| format!("Writing {}", self.cookies_file.display()))?;
        }
        Ok(self
            .cookies_file
            .is_file()
            .then(|| self.cookies_file.clone()))
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None)
    }

    #[test]
    fn empty_sources_yield_defaults() {
        let settings = build_settings(&HashMap::new(), |_| None);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.workers, 5);
        assert_eq!(settings.retention, Duration::from_secs(3600));
        assert_eq!(settings.sweep_interval, Duration::from_secs(300));
        assert_eq!(settings.metadata_ttl, Duration::from_secs(600));
        assert_eq!(settings.cookies_file, PathBuf::from("cookies/youtube.txt"));
        assert!(settings.cookies.is_none());
        assert_eq!(settings.bind_addr(), "127.0.0.1:5000");
    }

    #[test]
    fn env_file_values_are_read() {
        let settings = settings_from(
            "FETCHTUBE_PORT=\"4242\"\nFETCHTUBE_WORKERS=2\nFETCHTUBE_RETENTION_SECS=60\n\
             FETCHTUBE_DOWNLOAD_DIR='/srv/media'\n",
        );
        assert_eq!(settings.port, 4242);
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.retention, Duration::from_secs(60));
        assert_eq!(settings.download_dir, PathBuf::from("/srv/media"));
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let settings = settings_from(
            "FETCHTUBE_PORT=\"nope\"\nFETCHTUBE_WORKERS=0\nFETCHTUBE_SWEEP_INTERVAL_SECS=-5\n",
        );
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.workers, DEFAULT_WORKER_COUNT);
        assert_eq!(settings.sweep_interval, DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn env_beats_file_and_overrides_beat_env() {
        let mut vars = HashMap::new();
        vars.insert("FETCHTUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("FETCHTUBE_PORT".to_string(), "7000".to_string());
        vars.insert("FETCHTUBE_WORKERS".to_string(), "3".to_string());

        let settings = build_settings_with_overrides(
            &vars,
            |key| match key {
                "FETCHTUBE_PORT" => Some("8000".to_string()),
                "FETCHTUBE_WORKERS" => Some("4".to_string()),
                _ => None,
            },
            Overrides {
                port: Some(9000),
                host: Some("   ".into()),
                ..Overrides::default()
            },
        );
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.host, "file-host");
    }

    #[test]
    fn blank_values_count_as_unset() {
        let settings = settings_from("FETCHTUBE_HOST=\"  \"\nYOUTUBE_COOKIES=\"\"\n");
        assert_eq!(settings.host, DEFAULT_HOST);
        assert!(settings.cookies.is_none());
    }

    #[test]
    fn base64_cookies_take_priority_and_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = HashMap::new();
        vars.insert(
            "YOUTUBE_COOKIES_BASE64".to_string(),
            STANDARD.encode("# Netscape HTTP Cookie File\n"),
        );
        vars.insert("YOUTUBE_COOKIES".to_string(), "ignored".to_string());
        vars.insert(
            "FETCHTUBE_COOKIES_FILE".to_string(),
            dir.path().join("nested/youtube.txt").display().to_string(),
        );
        let settings = build_settings(&vars, |_| None);
        assert!(matches!(settings.cookies, Some(CookieSource::Base64(_))));

        let written = settings.provision_cookies().unwrap().unwrap();
        assert_eq!(
            fs::read_to_string(written).unwrap(),
            "# Netscape HTTP Cookie File\n"
        );
    }

    #[test]
    fn invalid_base64_cookies_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cookies: Some(CookieSource::Base64("%%%".into())),
            cookies_file: dir.path().join("youtube.txt"),
            ..Settings::default()
        };
        assert!(settings.provision_cookies().is_err());
        assert!(!settings.cookies_file.exists());
    }

    #[test]
    fn missing_cookie_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cookies_file: dir.path().join("youtube.txt"),
            ..Settings::default()
        };
        assert!(settings.provision_cookies().unwrap().is_none());
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export FETCHTUBE_DOWNLOAD_DIR="/media"
            FETCHTUBE_YTDLP_BIN='/opt/yt-dlp'
            FETCHTUBE_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("FETCHTUBE_DOWNLOAD_DIR").unwrap(), "/media");
        assert_eq!(vars.get("FETCHTUBE_YTDLP_BIN").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("FETCHTUBE_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
