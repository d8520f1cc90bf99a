// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download job tracking: records, the in-memory store, and the runner
//! that drives a job against the external downloader.

pub mod runner;
pub mod store;
pub mod types;

pub use runner::JobRunner;
pub use store::{JobStore, StoreError};
pub use types::{Job, JobId, JobPatch, JobStatus};
