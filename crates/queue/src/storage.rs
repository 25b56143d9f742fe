//! Pluggable persistence for the job queue.
//!
//! Implementations: [`crate::memory::MemoryStorage`] (single process, lost
//! on restart) and the Lua-scripted `RedisStorage` in the infrastructure
//! crate (durable, safe for multiple queue processes to share).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use signalq_core::Result;

use crate::job::{Job, JobId, JobStatus};

/// Point-in-time counts by status, for operational visibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Storage backend for jobs.
///
/// `fetch_due` is the one operation every implementation must make atomic:
/// two workers racing to pop the same due job must never both succeed, so
/// implementations claim a job (flipping it to `Running` and stamping a
/// lease) as part of the same operation that selects it, not as a
/// follow-up `update`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Liveness check. Returns `Err(StorageUnavailable)` for a closed or
    /// unreachable backend rather than hanging.
    async fn ping(&self) -> Result<()>;

    async fn enqueue(&self, job: Job) -> Result<JobId>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Persist a job's full state. Used after an execution attempt to
    /// record its new status, history entry, and (if retried) backoff
    /// schedule.
    async fn update(&self, job: &Job) -> Result<()>;

    /// Remove a job and every index entry referencing it.
    async fn delete(&self, id: &JobId) -> Result<()>;

    /// Atomically claim up to `limit` due jobs (`Pending` or `Failed` whose
    /// `scheduled_at` has passed), marking each `Running` with a fresh
    /// lease, and return them.
    async fn fetch_due(&self, limit: usize) -> Result<Vec<Job>>;

    /// List jobs currently in `status`, oldest first.
    async fn fetch_by_status(&self, status: JobStatusKind, limit: usize) -> Result<Vec<Job>>;

    /// Requeue jobs that have sat `Running` past `lease_timeout` without an
    /// update — evidence their worker died mid-execution.
    async fn clean_stale(&self, lease_timeout: Duration) -> Result<usize>;

    /// Delete every `Completed` job last updated before `older_than` ago.
    /// Returns the number of jobs purged.
    async fn purge_completed(&self, older_than: Duration) -> Result<usize>;

    /// Delete every `DeadLettered` job last updated before `older_than` ago.
    /// Returns the number of jobs purged.
    async fn purge_failed(&self, older_than: Duration) -> Result<usize>;

    /// Total number of jobs currently tracked, regardless of status.
    async fn size(&self) -> Result<usize>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Stop serving requests; every subsequent call on this backend fails
    /// with `StorageUnavailable`.
    async fn close(&self) -> Result<()>;
}

/// The subset of [`JobStatus`] usable as a filter, without the payload each
/// non-terminal-failure variant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusKind {
    Pending,
    Running,
    Completed,
    Failed,
    DeadLettered,
}

impl JobStatusKind {
    pub fn matches(self, status: &JobStatus) -> bool {
        matches!(
            (self, status),
            (JobStatusKind::Pending, JobStatus::Pending)
                | (JobStatusKind::Running, JobStatus::Running)
                | (JobStatusKind::Completed, JobStatus::Completed)
                | (JobStatusKind::Failed, JobStatus::Failed { .. })
                | (JobStatusKind::DeadLettered, JobStatus::DeadLettered { .. })
        )
    }
}

pub fn tally(stats: &mut QueueStats, status: &JobStatus) {
    match status {
        JobStatus::Pending => stats.pending += 1,
        JobStatus::Running => stats.running += 1,
        JobStatus::Completed => stats.completed += 1,
        JobStatus::Failed { .. } => stats.failed += 1,
        JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
    }
}
