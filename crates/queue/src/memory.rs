//! In-process [`Storage`]: one `HashMap` behind a mutex. No crash recovery
//! beyond the process lifetime, so [`MemoryStorage::clean_stale`] is a no-op —
//! a process that can crash mid-job takes the whole store down with it, so
//! there is nothing left to recover into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use signalq_core::{Error, Result};

use crate::job::{Job, JobId, JobStatus};
use crate::storage::{tally, JobStatusKind, QueueStats, Storage};

#[derive(Default)]
pub struct MemoryStorage {
    jobs: Mutex<HashMap<JobId, Job>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StorageUnavailable("memory storage is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn ping(&self) -> Result<()> {
        self.check_open()
    }

    async fn enqueue(&self, job: Job) -> Result<JobId> {
        self.check_open()?;
        let mut jobs = self.jobs.lock().await;
        let id = job.id.clone();
        jobs.insert(id.clone(), job);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.check_open()?;
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        self.check_open()?;
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &JobId) -> Result<()> {
        self.check_open()?;
        let mut jobs = self.jobs.lock().await;
        jobs.remove(id);
        Ok(())
    }

    async fn fetch_due(&self, limit: usize) -> Result<Vec<Job>> {
        self.check_open()?;
        let mut jobs = self.jobs.lock().await;

        let mut due_ids: Vec<JobId> = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. }))
            .filter(|j| j.is_due())
            .map(|j| j.id.clone())
            .collect();
        due_ids.sort_by_key(|id| id.as_str().to_string());
        due_ids.truncate(limit);

        let mut claimed = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_running();
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn fetch_by_status(&self, status: JobStatusKind, limit: usize) -> Result<Vec<Job>> {
        self.check_open()?;
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| status.matches(&j.status))
            .cloned()
            .collect();
        matching.sort_by_key(|j| j.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn clean_stale(&self, _lease_timeout: Duration) -> Result<usize> {
        self.check_open()?;
        Ok(0)
    }

    async fn purge_completed(&self, older_than: Duration) -> Result<usize> {
        self.check_open()?;
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut jobs = self.jobs.lock().await;
        let stale: Vec<JobId> = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Completed) && j.updated_at < cutoff)
            .map(|j| j.id.clone())
            .collect();
        let purged = stale.len();
        for id in stale {
            jobs.remove(&id);
        }
        Ok(purged)
    }

    async fn purge_failed(&self, older_than: Duration) -> Result<usize> {
        self.check_open()?;
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut jobs = self.jobs.lock().await;
        let stale: Vec<JobId> = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::DeadLettered { .. }) && j.updated_at < cutoff)
            .map(|j| j.id.clone())
            .collect();
        let purged = stale.len();
        for id in stale {
            jobs.remove(&id);
        }
        Ok(purged)
    }

    async fn size(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.jobs.lock().await.len())
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.check_open()?;
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            tally(&mut stats, &job.status);
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(task: &str) -> Job {
        Job::new("host", task, json!({}))
    }

    #[tokio::test]
    async fn fetch_due_claims_and_marks_running() {
        let storage = MemoryStorage::new();
        let id = storage.enqueue(job("a")).await.unwrap();

        let claimed = storage.fetch_due(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, JobStatus::Running);

        // Already running, not due again.
        assert!(storage.fetch_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_due_respects_limit() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage.enqueue(job(&format!("t{i}"))).await.unwrap();
        }
        let claimed = storage.fetch_due(3).await.unwrap();
        assert_eq!(claimed.len(), 3);
    }

    #[tokio::test]
    async fn scheduled_job_is_not_due_until_its_time() {
        let storage = MemoryStorage::new();
        storage
            .enqueue(job("later").delayed(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(storage.fetch_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_reflect_status_counts() {
        let storage = MemoryStorage::new();
        storage.enqueue(job("a")).await.unwrap();
        storage.enqueue(job("b")).await.unwrap();
        storage.fetch_due(1).await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 1);
    }

    #[tokio::test]
    async fn clean_stale_is_a_noop() {
        let storage = MemoryStorage::new();
        storage.enqueue(job("a")).await.unwrap();
        storage.fetch_due(1).await.unwrap();
        let recovered = storage.clean_stale(Duration::from_secs(0)).await.unwrap();
        assert_eq!(recovered, 0);

        // The job is still Running — memory storage never recovers leases.
        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.running, 1);
    }

    #[tokio::test]
    async fn fetch_by_status_filters_and_orders_oldest_first() {
        let storage = MemoryStorage::new();
        storage.enqueue(job("a")).await.unwrap();
        storage.enqueue(job("b")).await.unwrap();

        let pending = storage
            .fetch_by_status(JobStatusKind::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].created_at <= pending[1].created_at);
    }

    #[tokio::test]
    async fn delete_removes_a_job_entirely() {
        let storage = MemoryStorage::new();
        let id = storage.enqueue(job("a")).await.unwrap();
        storage.delete(&id).await.unwrap();
        assert!(storage.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn size_counts_every_job_regardless_of_status() {
        let storage = MemoryStorage::new();
        storage.enqueue(job("a")).await.unwrap();
        storage.enqueue(job("b")).await.unwrap();
        storage.fetch_due(1).await.unwrap();
        assert_eq!(storage.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn purge_completed_only_removes_old_completed_jobs() {
        let storage = MemoryStorage::new();
        let id = storage.enqueue(job("a")).await.unwrap();
        let mut j = storage.get(&id).await.unwrap().unwrap();
        j.mark_completed(Utc::now());
        storage.update(&j).await.unwrap();

        // Not old enough yet.
        assert_eq!(storage.purge_completed(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(storage.get(&id).await.unwrap().is_some());

        assert_eq!(storage.purge_completed(Duration::from_secs(0)).await.unwrap(), 1);
        assert!(storage.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_failed_only_removes_old_dead_lettered_jobs() {
        let storage = MemoryStorage::new();
        let id = storage.enqueue(job("a")).await.unwrap();
        let mut j = storage.get(&id).await.unwrap().unwrap();
        j.retry_policy = crate::retry::RetryPolicy::fixed(0, Duration::from_millis(1));
        j.mark_running();
        j.mark_failed("boom".to_string(), Utc::now());
        storage.update(&j).await.unwrap();
        assert!(matches!(j.status, JobStatus::DeadLettered { .. }));

        assert_eq!(storage.purge_failed(Duration::from_secs(0)).await.unwrap(), 1);
        assert!(storage.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_storage_rejects_every_operation() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();

        assert!(matches!(
            storage.enqueue(job("a")).await,
            Err(Error::StorageUnavailable(_))
        ));
        assert!(matches!(storage.ping().await, Err(Error::StorageUnavailable(_))));
    }
}
