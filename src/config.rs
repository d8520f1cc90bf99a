// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runtime configuration for the tubedrop server.

use std::path::PathBuf;
use std::time::Duration;

/// Default port for the HTTP API.
pub const DEFAULT_PORT: u16 = 5130;

/// Default cap on concurrent external downloader processes.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default wall-clock limit for a single download.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

/// Default limit for a metadata probe.
pub const DEFAULT_INFO_TIMEOUT_SECS: u64 = 30;

/// Server and runner configuration.
///
/// Built once at startup (from CLI flags in the binary, or literally in
/// tests) and passed by handle everywhere; nothing reads ambient globals.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    pub bind_address: String,
    /// Directory downloaded artifacts are written to.
    pub output_dir: PathBuf,
    /// Path or name of the external downloader binary.
    pub ytdlp_bin: PathBuf,
    /// Maximum number of downloader processes running at once.
    /// Additional jobs stay `pending` until a slot frees up.
    pub max_concurrent: usize,
    /// Kill the downloader and fail the job after this long.
    pub download_timeout: Duration,
    /// Timeout for `--dump-json` metadata probes.
    pub info_timeout: Duration,
    /// Keep at most this many job records, evicting the oldest finished
    /// ones first. 0 disables eviction (records live for the process).
    pub retain_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".to_string(),
            output_dir: default_output_dir(),
            ytdlp_bin: PathBuf::from("yt-dlp"),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            info_timeout: Duration::from_secs(DEFAULT_INFO_TIMEOUT_SECS),
            retain_max: 0,
        }
    }
}

/// Default artifact directory: `~/.tubedrop/downloads`, with a relative
/// fallback when no home directory can be resolved.
pub fn default_output_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".tubedrop").join("downloads"))
        .unwrap_or_else(|| PathBuf::from(".tubedrop/downloads"))
}
