// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory job registry.
//!
//! The authoritative table of download jobs for the process. Nothing is
//! persisted: a restart forgets every record, and the artifacts on disk are
//! the only durable output.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;

use super::types::{Job, JobId, JobPatch, JobStatus};

/// Error returned by store lookups and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No job with the given id exists.
    NotFound(JobId),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "no job with id {}", id),
        }
    }
}

impl std::error::Error for StoreError {}

/// Table state behind the lock.
#[derive(Debug, Default)]
struct StoreInner {
    /// Jobs in insertion order, keyed by id.
    jobs: IndexMap<JobId, Job>,
    /// Next id to hand out.
    next_id: JobId,
}

/// Thread-safe registry of download jobs.
///
/// Cheaply cloneable handle; clones share the same table. Passed explicitly
/// to the server and runner rather than living in a process-wide global, so
/// tests can spin up as many independent stores as they like.
#[derive(Debug, Clone)]
pub struct JobStore {
    inner: Arc<RwLock<StoreInner>>,
    /// Eviction threshold for finished records; 0 keeps everything.
    retain_max: usize,
}

/// Recover the guard from a poisoned lock rather than propagating the panic.
/// The table is plain data; a writer that panicked mid-update can at worst
/// leave one record stale, which the runner's terminal update overwrites.
fn read_lock(lock: &RwLock<StoreInner>) -> RwLockReadGuard<'_, StoreInner> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock(lock: &RwLock<StoreInner>) -> RwLockWriteGuard<'_, StoreInner> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobStore {
    /// Create an empty store. `retain_max` caps the table size by evicting
    /// the oldest *finished* records on insert; 0 disables eviction.
    pub fn new(retain_max: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                jobs: IndexMap::new(),
                next_id: 1,
            })),
            retain_max,
        }
    }

    /// Allocate a new job in `pending` state and return a copy of the record.
    ///
    /// Never fails: no external resource is touched here.
    pub fn create(
        &self,
        video_id: impl Into<String>,
        format: impl Into<String>,
        title: Option<String>,
    ) -> Job {
        let mut inner = write_lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;

        let job = Job::new(id, video_id, format, title);
        inner.jobs.insert(id, job.clone());

        if self.retain_max > 0 {
            Self::evict_finished(&mut inner, self.retain_max);
        }

        job
    }

    /// Current record for `id`.
    pub fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let inner = read_lock(&self.inner);
        inner.jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    /// Every known record, in insertion order.
    pub fn list_all(&self) -> Vec<Job> {
        let inner = read_lock(&self.inner);
        inner.jobs.values().cloned().collect()
    }

    /// Apply a partial update and return the resulting record.
    ///
    /// Rules enforced here, not trusted from callers:
    /// - terminal records are immutable; the update is dropped and the
    ///   unchanged record returned
    /// - progress never decreases while downloading and is clamped to 100
    /// - an artifact path is only recorded on a completed job
    pub fn update(&self, id: JobId, patch: JobPatch) -> Result<Job, StoreError> {
        let mut inner = write_lock(&self.inner);
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if job.status.is_terminal() {
            tracing::debug!(job_id = id, status = ?job.status, "update ignored for finished job");
            return Ok(job.clone());
        }

        if let Some(status) = patch.status {
            job.status = status;
        }

        if let Some(percent) = patch.progress {
            let percent = percent.min(100);
            job.progress = if job.status == JobStatus::Downloading {
                job.progress.max(percent)
            } else {
                percent
            };
        }

        if let Some(path) = patch.artifact_path {
            if job.status == JobStatus::Completed {
                job.artifact_path = Some(path);
            } else {
                tracing::debug!(job_id = id, "artifact path dropped for non-completed job");
            }
        }

        Ok(job.clone())
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        read_lock(&self.inner).jobs.len()
    }

    /// True when no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get count of jobs by status: (pending, downloading, completed, failed).
    pub fn status_counts(&self) -> (usize, usize, usize, usize) {
        let inner = read_lock(&self.inner);
        let mut pending = 0;
        let mut downloading = 0;
        let mut completed = 0;
        let mut failed = 0;

        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => pending += 1,
                JobStatus::Downloading => downloading += 1,
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => failed += 1,
            }
        }

        (pending, downloading, completed, failed)
    }

    /// Drop the oldest finished records until the table fits the cap.
    /// In-flight jobs are never evicted, so the table can still exceed the
    /// cap while enough jobs are pending or downloading.
    fn evict_finished(inner: &mut StoreInner, retain_max: usize) {
        while inner.jobs.len() > retain_max {
            let oldest_finished = inner
                .jobs
                .iter()
                .find(|(_, job)| job.status.is_terminal())
                .map(|(id, _)| *id);

            match oldest_finished {
                Some(id) => {
                    // shift_remove keeps insertion order for the survivors
                    inner.jobs.shift_remove(&id);
                    tracing::debug!(job_id = id, "evicted finished job past retention cap");
                }
                None => break,
            }
        }
    }
}
