#![forbid(unsafe_code)]

//! Process and filesystem guards for the server binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use std::path::{Component, Path, PathBuf};

/// Fails fast when the server is started as root. It spawns an external
/// downloader on untrusted URLs and writes wherever that tool names files.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Whether `candidate` lives under `root` once both are made absolute and
/// `..` segments are resolved lexically.
pub fn is_within(root: &Path, candidate: &Path) -> bool {
    let (Some(root), Some(candidate)) = (absolutize(root), absolutize(candidate)) else {
        return false;
    };
    candidate.starts_with(root)
}

fn absolutize(path: &Path) -> Option<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Some(normalized)
}

/// `Content-Disposition` value for an attachment. Keeps an ASCII fallback
/// and carries the exact name percent-encoded per RFC 5987.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(filename.len());
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
