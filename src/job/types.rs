// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job types for download tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier for a download job. Allocated by the store, monotonically
/// increasing, never reused for the life of the process.
pub type JobId = u64;

/// Status of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, waiting for a runner slot
    Pending,
    /// Downloader process is running
    Downloading,
    /// Artifact is on disk
    Completed,
    /// Downloader failed, timed out, or produced no artifact
    Failed,
}

impl JobStatus {
    /// Returns true if the job is finished (success or failure).
    /// Terminal statuses are sticky: the store refuses to transition out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One requested download, as tracked in memory and serialized to clients.
///
/// Field names follow the browser client's camelCase convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier, assigned at creation
    pub id: JobId,
    /// 11-character video token
    pub video_id: String,
    /// Format selector handed to the downloader (e.g. "18", "137+140")
    pub format: String,
    /// Optional human-readable label, fixed at creation
    pub title: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Percentage in [0, 100]; only meaningful while downloading,
    /// 100 on completed, 0 on failed
    pub progress: u8,
    /// Where the artifact landed; present iff completed
    pub artifact_path: Option<PathBuf>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a fresh pending job. Used by the store, which owns id allocation.
    pub(crate) fn new(id: JobId, video_id: impl Into<String>, format: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id,
            video_id: video_id.into(),
            format: format.into(),
            title,
            status: JobStatus::Pending,
            progress: 0,
            artifact_path: None,
            created_at: Utc::now(),
        }
    }

    /// Filename prefix the downloader is told to produce, used to locate the
    /// artifact afterward regardless of the container extension it picked.
    pub fn artifact_prefix(&self) -> String {
        format!("{}_{}", self.video_id, self.format)
    }
}

/// Partial update applied to a job by the runner. Only supplied fields
/// change; everything else keeps its prior value.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub artifact_path: Option<PathBuf>,
}

impl JobPatch {
    /// Transition into `downloading` with progress reset to 0.
    pub fn downloading() -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            progress: Some(0),
            artifact_path: None,
        }
    }

    /// Terminal success: progress 100, artifact recorded.
    pub fn completed(artifact_path: PathBuf) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            artifact_path: Some(artifact_path),
        }
    }

    /// Terminal failure: progress pinned to 0, no artifact.
    pub fn failed() -> Self {
        Self {
            status: Some(JobStatus::Failed),
            progress: Some(0),
            artifact_path: None,
        }
    }

    /// Progress-only update while downloading.
    pub fn progress(percent: u8) -> Self {
        Self {
            progress: Some(percent),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Downloading.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(7, "dQw4w9WgXcQ", "18", Some("test".into()));
        assert_eq!(job.id, 7);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.artifact_path.is_none());
        assert_eq!(job.artifact_prefix(), "dQw4w9WgXcQ_18");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = Job::new(1, "dQw4w9WgXcQ", "18", None);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"videoId\""));
        assert!(json.contains("\"artifactPath\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"status\":\"pending\""));
    }
}
