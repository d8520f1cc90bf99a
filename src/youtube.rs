// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Video id validation and metadata probing.
//!
//! Metadata comes from the same external downloader binary the runner uses,
//! in `--dump-json` mode, so the preview and the download never disagree
//! about what a format id means.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::Config;

/// 11-character video token, the platform's canonical id shape.
static VIDEO_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id regex"));

/// Format selectors we accept. Tight on purpose: the selector is embedded in
/// the artifact filename, so path separators and shell metacharacters stay out.
static FORMAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+._-]{1,32}$").expect("format selector regex"));

/// Formats returned to the preview UI per probe.
const MAX_FORMATS: usize = 5;

/// True if `s` looks like a valid video id.
pub fn is_valid_video_id(s: &str) -> bool {
    VIDEO_ID_RE.is_match(s)
}

/// True if `s` is an acceptable format selector.
pub fn is_valid_format_selector(s: &str) -> bool {
    FORMAT_RE.is_match(s)
}

/// Canonical watch URL for a video id.
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// One downloadable format, as shown in the preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    /// Quality label, e.g. "720p"
    pub quality: String,
    /// Size in bytes, 0 when the extractor does not report one
    pub filesize: u64,
}

/// Video metadata returned by the preview endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    /// Duration in seconds
    pub duration: u64,
    pub description: String,
    pub thumbnail: String,
    pub formats: Vec<FormatInfo>,
}

/// Subset of the downloader's `--dump-json` output we care about.
#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    description: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    format_note: Option<String>,
    filesize: Option<u64>,
}

impl RawFormat {
    /// Progressive mp4: video and audio in one stream, playable everywhere.
    fn is_progressive_mp4(&self) -> bool {
        self.ext.as_deref() == Some("mp4")
            && self.vcodec.as_deref().is_some_and(|c| c != "none")
            && self.acodec.as_deref().is_some_and(|c| c != "none")
    }

    fn quality_label(&self) -> String {
        match self.height {
            Some(h) => format!("{}p", h),
            None => self
                .format_note
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Look up metadata for a video by running the downloader in probe mode.
///
/// The caller is expected to have validated `video_id` already; the id is
/// still only ever passed as a single argv entry, never through a shell.
pub async fn probe_video_info(config: &Config, video_id: &str) -> Result<VideoInfo> {
    let output = run_probe(config, video_id).await?;

    let raw: RawInfo = serde_json::from_str(&output).context("failed to parse downloader metadata output")?;

    let formats = raw
        .formats
        .iter()
        .filter(|f| f.is_progressive_mp4())
        .take(MAX_FORMATS)
        .map(|f| FormatInfo {
            format_id: f.format_id.clone(),
            ext: f.ext.clone().unwrap_or_else(|| "mp4".to_string()),
            quality: f.quality_label(),
            filesize: f.filesize.unwrap_or(0),
        })
        .collect();

    Ok(VideoInfo {
        title: raw.title.unwrap_or_else(|| "Unknown Title".to_string()),
        duration: raw.duration.unwrap_or(0.0).round() as u64,
        description: raw.description.unwrap_or_default(),
        thumbnail: raw.thumbnail.unwrap_or_default(),
        formats,
    })
}

/// Spawn the downloader in `--dump-json` mode under the probe timeout and
/// return its stdout.
async fn run_probe(config: &Config, video_id: &str) -> Result<String> {
    let mut cmd = Command::new(&config.ytdlp_bin);
    cmd.args(["--no-warnings", "--no-playlist", "--dump-json"])
        .arg(watch_url(video_id))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(config.info_timeout, cmd.output()).await {
        Ok(result) => result.with_context(|| format!("failed to run {}", config.ytdlp_bin.display()))?,
        Err(_) => bail!("metadata probe timed out after {}s", config.info_timeout.as_secs()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "metadata probe exited with {}: {}",
            output.status,
            stderr.lines().last().unwrap_or_default()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        bail!("metadata probe produced no output");
    }

    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_id_accepts_canonical_shapes() {
        assert!(is_valid_video_id("dQw4w9WgXcQ"));
        assert!(is_valid_video_id("9bZkp7q19f0"));
        assert!(is_valid_video_id("a_b-c_d-e_f"));
    }

    #[test]
    fn test_video_id_rejects_bad_shapes() {
        assert!(!is_valid_video_id(""));
        assert!(!is_valid_video_id("short"));
        assert!(!is_valid_video_id("dQw4w9WgXcQQ")); // 12 chars
        assert!(!is_valid_video_id("dQw4w9WgXc!"));
        assert!(!is_valid_video_id("dQw4w9 WgXc"));
        assert!(!is_valid_video_id("../../../etc"));
    }

    #[test]
    fn test_format_selector_rules() {
        assert!(is_valid_format_selector("18"));
        assert!(is_valid_format_selector("137+140"));
        assert!(is_valid_format_selector("bestvideo"));
        assert!(is_valid_format_selector("b-e.st_1"));

        assert!(!is_valid_format_selector(""));
        assert!(!is_valid_format_selector("18 22"));
        assert!(!is_valid_format_selector("a/b"));
        assert!(!is_valid_format_selector("$(rm -rf)"));
        assert!(!is_valid_format_selector(&"x".repeat(33)));
    }

    #[test]
    fn test_watch_url() {
        assert_eq!(
            watch_url("dQw4w9WgXcQ"),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn test_raw_metadata_mapping() {
        let raw = r#"{
            "title": "Test Video",
            "duration": 212.5,
            "description": "desc",
            "thumbnail": "https://example.invalid/t.jpg",
            "formats": [
                {"format_id": "249", "ext": "webm", "vcodec": "none", "acodec": "opus"},
                {"format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 1080},
                {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "height": 360, "filesize": 12345},
                {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "height": 720}
            ]
        }"#;

        let info: RawInfo = serde_json::from_str(raw).unwrap();
        let progressive: Vec<_> = info.formats.iter().filter(|f| f.is_progressive_mp4()).collect();

        // Audio-only and video-only streams are filtered out
        assert_eq!(progressive.len(), 2);
        assert_eq!(progressive[0].format_id, "18");
        assert_eq!(progressive[0].quality_label(), "360p");
        assert_eq!(progressive[1].quality_label(), "720p");
        assert_eq!(info.duration.unwrap_or(0.0).round() as u64, 213);
    }

    #[test]
    fn test_quality_label_falls_back_to_note() {
        let f = RawFormat {
            format_id: "18".into(),
            ext: Some("mp4".into()),
            vcodec: Some("avc1".into()),
            acodec: Some("mp4a".into()),
            height: None,
            format_note: Some("medium".into()),
            filesize: None,
        };
        assert_eq!(f.quality_label(), "medium");

        let f = RawFormat { format_note: None, ..f };
        assert_eq!(f.quality_label(), "unknown");
    }

    #[test]
    fn test_format_info_serializes_camel_case() {
        let f = FormatInfo {
            format_id: "18".into(),
            ext: "mp4".into(),
            quality: "360p".into(),
            filesize: 0,
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"formatId\""));
    }
}
