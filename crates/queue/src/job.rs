//! The unit of work the queue moves through pending → running → a terminal
//! state, plus the retry policy attached to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use signalq_core::id;

use crate::retry::RetryPolicy;

/// Unique job identifier, `"<unix-nanos>-<hostname>"` by construction so ids
/// are sortable by creation time without a separate index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate(hostname: &str) -> Self {
        Self(id::generate_id(hostname))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a job currently sits in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed { error: String, attempt: u32 },
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }
}

/// One execution attempt, kept for post-hoc inspection of why a job was
/// retried or dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// A queued task: which handler runs it, what payload it carries, and
/// everything needed to track its progress and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task: String,
    pub payload: Value,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set while a worker holds the lease; stale-lease recovery looks at
    /// this to decide whether a `Running` job has been abandoned.
    pub leased_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    pub fn new(hostname: &str, task: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(hostname),
            task: task.into(),
            payload,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            leased_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn delayed(mut self, delay: std::time::Duration) -> Self {
        self.scheduled_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn is_due(&self) -> bool {
        match self.scheduled_at {
            Some(at) => Utc::now() >= at,
            None => true,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
        self.leased_at = Some(self.updated_at);
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.leased_at = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
        });
    }

    /// Record a failed attempt, scheduling a retry if the policy allows one
    /// or moving the job to `DeadLettered` otherwise.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.leased_at = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.clone()),
        });

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_sortable_by_creation_order() {
        let a = JobId::generate("h");
        let b = JobId::generate("h");
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn lifecycle_from_pending_to_completed() {
        let mut job = Job::new("h", "send_email", serde_json::json!({}));
        assert_eq!(job.status, JobStatus::Pending);

        job.mark_running();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt, 1);
        assert!(job.leased_at.is_some());

        let started = Utc::now();
        job.mark_completed(started);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.leased_at.is_none());
        assert_eq!(job.history.len(), 1);
    }

    #[test]
    fn failure_schedules_retry_until_retries_exhausted() {
        let mut job = Job::new("h", "t", serde_json::json!({})).with_retry_policy(
            crate::retry::RetryPolicy::fixed(1, std::time::Duration::from_millis(1)),
        );

        job.mark_running();
        job.mark_failed("boom".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::Failed { .. }));
        assert!(job.scheduled_at.is_some());

        job.mark_running();
        job.mark_failed("boom again".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::DeadLettered { .. }));
    }
}
