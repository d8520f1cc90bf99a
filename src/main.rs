// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tubedrop server binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tubedrop::config::{
    default_output_dir, DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_INFO_TIMEOUT_SECS,
    DEFAULT_MAX_CONCURRENT, DEFAULT_PORT,
};
use tubedrop::{Config, Server};

/// Self-hosted video download service.
///
/// Runs the HTTP API the browser client polls. Downloads are delegated to an
/// external yt-dlp binary, which must be installed separately.
#[derive(Parser, Debug)]
#[command(name = "tubedrop", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind to; 0.0.0.0 exposes the API to the network
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Directory downloaded files are written to [default: ~/.tubedrop/downloads]
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Path or name of the yt-dlp binary
    #[arg(long, default_value = "yt-dlp")]
    ytdlp_bin: PathBuf,

    /// Maximum concurrent downloader processes
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Kill a download after this many seconds
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS)]
    download_timeout_secs: u64,

    /// Timeout for metadata probes, in seconds
    #[arg(long, default_value_t = DEFAULT_INFO_TIMEOUT_SECS)]
    info_timeout_secs: u64,

    /// Keep at most this many job records, dropping the oldest finished ones;
    /// 0 keeps everything for the life of the process
    #[arg(long, default_value_t = 0)]
    retain_max: usize,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            port: self.port,
            bind_address: self.bind,
            output_dir: self.output_dir.unwrap_or_else(default_output_dir),
            ytdlp_bin: self.ytdlp_bin,
            max_concurrent: self.max_concurrent,
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            info_timeout: Duration::from_secs(self.info_timeout_secs),
            retain_max: self.retain_max,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config();
    Server::new(config).start().await
}
