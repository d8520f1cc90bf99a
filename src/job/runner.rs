// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download runner.
//!
//! Drives one job from `pending` to a terminal state by invoking the
//! external downloader as a subprocess. The request that created the job has
//! already returned by the time any of this runs, so every failure ends up
//! in the job record instead of an HTTP response; polling is the only
//! reporting channel.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::youtube;

use super::store::JobStore;
use super::types::{Job, JobId, JobPatch};

/// Lines of downloader stderr kept for the failure log.
const STDERR_TAIL_LINES: usize = 20;

/// Progress lines printed by yt-dlp with `--newline`, e.g.
/// `[download]  42.3% of ~4.02MiB at 1.21MiB/s ETA 00:02`.
static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").expect("progress regex"));

/// Extract a whole percentage from one downloader output line.
fn parse_progress_line(line: &str) -> Option<u8> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(percent.min(100.0) as u8)
}

/// Runs download jobs against the external downloader binary.
///
/// Cloneable handle; clones share the concurrency gate. One `spawn` call per
/// job, fire-and-forget: the HTTP handler never awaits the outcome.
#[derive(Debug, Clone)]
pub struct JobRunner {
    store: JobStore,
    config: Arc<Config>,
    /// Caps concurrent downloader processes. Jobs past the cap simply hold
    /// `pending` until a permit frees up.
    permits: Arc<Semaphore>,
}

impl JobRunner {
    /// Create a runner over the given store and configuration.
    pub fn new(store: JobStore, config: Config) -> Self {
        let cap = config.max_concurrent.max(1);
        Self {
            store,
            config: Arc::new(config),
            permits: Arc::new(Semaphore::new(cap)),
        }
    }

    /// Start the job in the background and return immediately.
    pub fn spawn(&self, job_id: JobId) {
        let runner = self.clone();
        tokio::spawn(async move {
            runner.run(job_id).await;
        });
    }

    /// Execute one job to a terminal state. Never returns an error: failures
    /// are recorded on the job and logged for operators.
    async fn run(&self, job_id: JobId) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            // Semaphore only closes if the runner is torn down mid-flight
            self.apply(job_id, JobPatch::failed());
            return;
        };

        let job = match self.store.get(job_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "runner started for unknown job");
                return;
            }
        };

        tracing::info!(job_id, video_id = %job.video_id, format = %job.format, "starting download");
        self.apply(job_id, JobPatch::downloading());

        match self.execute(&job).await {
            Ok(artifact) => {
                tracing::info!(job_id, artifact = %artifact.display(), "download complete");
                self.apply(job_id, JobPatch::completed(artifact));
            }
            Err(e) => {
                tracing::warn!(job_id, video_id = %job.video_id, error = %e, "download failed");
                self.apply(job_id, JobPatch::failed());
            }
        }

        drop(permit);
    }

    /// Push an update into the store. A missing record is a logged no-op:
    /// ids only originate in the store, so a miss means retention evicted the
    /// record out from under an in-flight runner.
    fn apply(&self, job_id: JobId, patch: JobPatch) {
        if let Err(e) = self.store.update(job_id, patch) {
            tracing::warn!(job_id, error = %e, "dropped job update");
        }
    }

    /// Invoke the downloader and locate the artifact it produced.
    async fn execute(&self, job: &Job) -> Result<PathBuf> {
        let output_dir = &self.config.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

        // Embed videoId and format in the filename so the artifact can be
        // found by prefix afterward, whatever extension the tool settles on.
        let template = output_dir.join(format!("{}.%(ext)s", job.artifact_prefix()));

        let mut child = Command::new(&self.config.ytdlp_bin)
            .arg("-f")
            .arg(&job.format)
            .arg("-o")
            .arg(&template)
            .args(["--newline", "--no-playlist", "--no-warnings"])
            .arg(youtube::watch_url(&job.video_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.ytdlp_bin.display()))?;

        // Stream progress lines into the store while the process runs
        if let Some(stdout) = child.stdout.take() {
            let store = self.store.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(percent) = parse_progress_line(&line) {
                        let _ = store.update(job_id, JobPatch::progress(percent));
                    }
                }
            });
        }

        // Keep the last stderr lines for the failure log
        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() >= STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let timeout = self.config.download_timeout;
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result.context("failed waiting for downloader process")?,
            Err(_) => {
                let _ = child.kill().await;
                bail!("downloader timed out after {}s", timeout.as_secs());
            }
        };

        if !status.success() {
            let detail = match stderr_tail {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            bail!("downloader exited with {}: {}", status, detail);
        }

        find_artifact(output_dir, &job.artifact_prefix())
            .await
            .ok_or_else(|| {
                anyhow!(
                    "downloader succeeded but no file matching {}.* in {}",
                    job.artifact_prefix(),
                    output_dir.display()
                )
            })
    }
}

/// Scan `dir` for a regular file whose name starts with `prefix`, skipping
/// the downloader's partial-download droppings.
async fn find_artifact(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if !name.starts_with(prefix) {
            continue;
        }
        if name.ends_with(".part") || name.ends_with(".ytdl") {
            continue;
        }
        match entry.file_type().await {
            Ok(kind) if kind.is_file() => return Some(entry.path()),
            _ => continue,
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line("[download]  42.3% of ~4.02MiB at 1.21MiB/s ETA 00:02"),
            Some(42)
        );
        assert_eq!(parse_progress_line("[download] 100% of 4.02MiB in 00:03"), Some(100));
        assert_eq!(parse_progress_line("[download]   0.0% of ~4.02MiB"), Some(0));
    }

    #[test]
    fn test_parse_progress_line_rejects_noise() {
        assert_eq!(parse_progress_line("[youtube] dQw4w9WgXcQ: Downloading webpage"), None);
        assert_eq!(parse_progress_line("[download] Destination: out/dQw4w9WgXcQ_18.mp4"), None);
        assert_eq!(parse_progress_line(""), None);
        assert_eq!(parse_progress_line("42.3%"), None);
    }

    // The runner scenarios below swap the downloader binary for a tiny shell
    // script, so they are Unix-only.
    #[cfg(unix)]
    mod scenarios {
        use super::super::JobRunner;
        use crate::config::Config;
        use crate::job::store::JobStore;
        use crate::job::types::JobStatus;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use std::time::Duration;
        use tempfile::TempDir;

        /// Write an executable stub standing in for the downloader.
        fn stub_downloader(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-downloader");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn test_setup(tmp: &TempDir, script_body: &str, timeout: Duration) -> (JobStore, JobRunner) {
            let output_dir = tmp.path().join("out");
            let config = Config {
                output_dir: output_dir.clone(),
                ytdlp_bin: stub_downloader(tmp.path(), script_body),
                download_timeout: timeout,
                ..Config::default()
            };
            let store = JobStore::new(0);
            let runner = JobRunner::new(store.clone(), config);
            (store, runner)
        }

        #[tokio::test]
        async fn completes_when_artifact_appears() {
            let tmp = TempDir::new().unwrap();
            let artifact = tmp.path().join("out").join("dQw4w9WgXcQ_18.mp4");
            let (store, runner) = test_setup(
                &tmp,
                &format!("touch \"{}\"", artifact.display()),
                Duration::from_secs(10),
            );

            let job = store.create("dQw4w9WgXcQ", "18", None);
            runner.run(job.id).await;

            let job = store.get(job.id).unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.progress, 100);
            let path = job.artifact_path.expect("artifact path set on completion");
            assert!(path.ends_with("dQw4w9WgXcQ_18.mp4"));
        }

        #[tokio::test]
        async fn reports_streamed_progress_before_completing() {
            let tmp = TempDir::new().unwrap();
            let artifact = tmp.path().join("out").join("dQw4w9WgXcQ_18.mp4");
            let script = format!(
                "echo '[download]  10.0% of ~4.00MiB'\n\
                 echo '[download]  55.5% of ~4.00MiB'\n\
                 touch \"{}\"",
                artifact.display()
            );
            let (store, runner) = test_setup(&tmp, &script, Duration::from_secs(10));

            let job = store.create("dQw4w9WgXcQ", "18", None);
            runner.run(job.id).await;

            let job = store.get(job.id).unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.progress, 100);
        }

        #[tokio::test]
        async fn fails_on_nonzero_exit() {
            let tmp = TempDir::new().unwrap();
            let (store, runner) = test_setup(&tmp, "echo 'ERROR: gone' >&2\nexit 3", Duration::from_secs(10));

            let job = store.create("dQw4w9WgXcQ", "18", None);
            runner.run(job.id).await;

            let job = store.get(job.id).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.progress, 0);
            assert!(job.artifact_path.is_none());
        }

        #[tokio::test]
        async fn fails_when_no_artifact_is_produced() {
            let tmp = TempDir::new().unwrap();
            // Exits 0 without writing anything
            let (store, runner) = test_setup(&tmp, "true", Duration::from_secs(10));

            let job = store.create("dQw4w9WgXcQ", "18", None);
            runner.run(job.id).await;

            let job = store.get(job.id).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert!(job.artifact_path.is_none());
        }

        #[tokio::test]
        async fn fails_when_only_a_partial_file_exists() {
            let tmp = TempDir::new().unwrap();
            let partial = tmp.path().join("out").join("dQw4w9WgXcQ_18.mp4.part");
            let (store, runner) = test_setup(
                &tmp,
                &format!("touch \"{}\"", partial.display()),
                Duration::from_secs(10),
            );

            let job = store.create("dQw4w9WgXcQ", "18", None);
            runner.run(job.id).await;

            assert_eq!(store.get(job.id).unwrap().status, JobStatus::Failed);
        }

        #[tokio::test]
        async fn fails_on_timeout() {
            let tmp = TempDir::new().unwrap();
            let (store, runner) = test_setup(&tmp, "sleep 30", Duration::from_millis(200));

            let job = store.create("dQw4w9WgXcQ", "18", None);
            runner.run(job.id).await;

            assert_eq!(store.get(job.id).unwrap().status, JobStatus::Failed);
        }

        #[tokio::test]
        async fn fails_on_spawn_error() {
            let tmp = TempDir::new().unwrap();
            let output_dir = tmp.path().join("out");
            let config = Config {
                output_dir,
                ytdlp_bin: tmp.path().join("does-not-exist"),
                ..Config::default()
            };
            let store = JobStore::new(0);
            let runner = JobRunner::new(store.clone(), config);

            let job = store.create("dQw4w9WgXcQ", "18", None);
            runner.run(job.id).await;

            assert_eq!(store.get(job.id).unwrap().status, JobStatus::Failed);
        }

        #[tokio::test]
        async fn concurrent_jobs_write_distinct_artifacts() {
            let tmp = TempDir::new().unwrap();
            let out = tmp.path().join("out");
            // Stub recovers its own target from the -o template argument ($4)
            let script = "target=$(echo \"$4\" | sed 's/\\.%(ext)s$/.mp4/')\ntouch \"$target\"";
            let (store, runner) = test_setup(&tmp, script, Duration::from_secs(10));

            let a = store.create("dQw4w9WgXcQ", "18", None);
            let b = store.create("9bZkp7q19f0", "22", None);
            tokio::join!(runner.run(a.id), runner.run(b.id));

            let a = store.get(a.id).unwrap();
            let b = store.get(b.id).unwrap();
            assert_eq!(a.status, JobStatus::Completed);
            assert_eq!(b.status, JobStatus::Completed);
            assert!(a.artifact_path.unwrap().ends_with("dQw4w9WgXcQ_18.mp4"));
            assert!(b.artifact_path.unwrap().ends_with("9bZkp7q19f0_22.mp4"));
            assert!(out.join("dQw4w9WgXcQ_18.mp4").exists());
        }
    }
}
