use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One preview request and its audit trail.
///
/// `token`, `diff_hash` and `expires_at` are set together, and only when the
/// job reaches `success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxJob {
    pub id: String,
    pub repository: String,
    pub target_file: String,
    pub diff: String,
    pub status: JobStatus,
    pub logs: Vec<String>,
    pub token: Option<String>,
    pub diff_hash: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxJob {
    fn push_log(&mut self, status: Option<JobStatus>, message: &str) {
        let now = Utc::now();
        let line = match status {
            Some(status) => format!(
                "[{}] [{}] {}",
                now.to_rfc3339(),
                status.as_str().to_uppercase(),
                message
            ),
            None => format!("[{}] {}", now.to_rfc3339(), message),
        };
        self.logs.push(line);
        self.updated_at = now;
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, SandboxJob>,
    order: VecDeque<String>,
}

/// In-memory FIFO of sandbox jobs. Volatile: a restart loses everything.
///
/// Every operation takes the single state lock for its whole duration, so
/// dequeue and consume are atomic check-then-set steps.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave a job half-written:
        // every mutation is a handful of field assignments.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a `queued` job and return its id.
    pub fn enqueue(&self, repository: &str, target_file: &str, diff: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut job = SandboxJob {
            id: id.clone(),
            repository: repository.to_string(),
            target_file: target_file.to_string(),
            diff: diff.to_string(),
            status: JobStatus::Queued,
            logs: Vec::new(),
            token: None,
            diff_hash: None,
            expires_at: None,
            consumed: false,
            consumed_at: None,
            created_at: now,
            updated_at: now,
        };
        job.push_log(None, "Job queued.");

        let mut state = self.lock();
        state.jobs.insert(id.clone(), job);
        state.order.push_back(id.clone());
        tracing::info!(job_id = %id, repo = repository, file = target_file, "job enqueued");
        id
    }

    /// Pop the next job still in `queued`, moving it to `running`.
    /// Entries that are no longer queued are dropped from the order.
    pub fn dequeue(&self) -> Option<SandboxJob> {
        let mut state = self.lock();
        while let Some(id) = state.order.pop_front() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            job.status = JobStatus::Running;
            job.push_log(Some(JobStatus::Running), "Job dequeued, starting execution...");
            tracing::info!(job_id = %id, "job dequeued");
            return Some(job.clone());
        }
        None
    }

    /// Update the status, appending `message` as a timestamped log line.
    /// Unknown ids are ignored.
    pub fn set_status(&self, job_id: &str, status: JobStatus, message: Option<&str>) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        // success carries a token; only set_success may reach it
        if status == JobStatus::Success {
            tracing::warn!(job_id, "set_status(success) ignored; use set_success");
            return;
        }
        job.status = status;
        job.updated_at = Utc::now();
        if let Some(message) = message {
            job.push_log(Some(status), message);
        }
    }

    /// Append a log line without touching the status.
    pub fn append_log(&self, job_id: &str, message: &str) {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(job_id) {
            let status = job.status;
            job.push_log(Some(status), message);
        }
    }

    /// Move a job to `success` and attach its Proof-of-Preview token.
    pub fn set_success(
        &self,
        job_id: &str,
        token: String,
        diff_hash: String,
        expires_at: DateTime<Utc>,
    ) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        job.status = JobStatus::Success;
        job.token = Some(token);
        job.diff_hash = Some(diff_hash);
        job.expires_at = Some(expires_at);
        job.push_log(Some(JobStatus::Success), "Proof-of-Preview Token Minted.");
    }

    /// Atomically mark a job consumed.
    ///
    /// Returns `None` if the job does not exist, `Some(true)` if this call
    /// consumed it, and `Some(false)` if it was already consumed.
    pub fn consume(&self, job_id: &str) -> Option<bool> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(job_id)?;
        if job.consumed {
            return Some(false);
        }
        let now = Utc::now();
        job.consumed = true;
        job.consumed_at = Some(now);
        job.updated_at = now;
        Some(true)
    }

    /// Snapshot of a job.
    pub fn get_job(&self, job_id: &str) -> Option<SandboxJob> {
        self.lock().jobs.get(job_id).cloned()
    }

    /// Number of jobs waiting in the FIFO.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .get(*id)
                    .is_some_and(|j| j.status == JobStatus::Queued)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_enqueue_creates_queued_job() {
        let queue = JobQueue::new();
        let id = queue.enqueue("acme/app", "package.json", "diff");
        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.logs.len(), 1);
        assert!(job.logs[0].ends_with("Job queued."));
        assert!(job.token.is_none());
        assert!(!job.consumed);
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn test_dequeue_is_fifo_and_marks_running() {
        let queue = JobQueue::new();
        let first = queue.enqueue("acme/app", "a.txt", "d1");
        let second = queue.enqueue("acme/app", "b.txt", "d2");

        let job = queue.dequeue().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(queue.dequeue().unwrap().id, second);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_dequeue_skips_jobs_no_longer_queued() {
        let queue = JobQueue::new();
        let skipped = queue.enqueue("acme/app", "a.txt", "d1");
        let next = queue.enqueue("acme/app", "b.txt", "d2");
        queue.set_status(&skipped, JobStatus::Failed, Some("cancelled"));

        assert_eq!(queue.dequeue().unwrap().id, next);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_status_log_lines_are_tagged() {
        let queue = JobQueue::new();
        let id = queue.enqueue("acme/app", "a.txt", "d");
        queue.dequeue();
        queue.set_status(&id, JobStatus::Failed, Some("npm exited with 1"));
        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.logs.last().unwrap().contains("[FAILED] npm exited with 1"));
    }

    #[test]
    fn test_set_status_cannot_reach_success() {
        let queue = JobQueue::new();
        let id = queue.enqueue("acme/app", "a.txt", "d");
        queue.set_status(&id, JobStatus::Success, Some("sneaky"));
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_set_success_attaches_security_fields() {
        let queue = JobQueue::new();
        let id = queue.enqueue("acme/app", "a.txt", "d");
        let expires = Utc::now();
        queue.set_success(&id, "tok".into(), "hash".into(), expires);
        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.token.as_deref(), Some("tok"));
        assert_eq!(job.diff_hash.as_deref(), Some("hash"));
        assert_eq!(job.expires_at, Some(expires));
        assert!(job.logs.last().unwrap().contains("Proof-of-Preview Token Minted."));
    }

    #[test]
    fn test_consume_is_check_then_set() {
        let queue = JobQueue::new();
        let id = queue.enqueue("acme/app", "a.txt", "d");
        assert_eq!(queue.consume(&id), Some(true));
        assert_eq!(queue.consume(&id), Some(false));
        assert_eq!(queue.consume("missing"), None);
        let job = queue.get_job(&id).unwrap();
        assert!(job.consumed);
        assert!(job.consumed_at.is_some());
    }

    #[test]
    fn test_concurrent_consume_has_one_winner() {
        let queue = Arc::new(JobQueue::new());
        let id = queue.enqueue("acme/app", "a.txt", "d");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let id = id.clone();
                std::thread::spawn(move || queue.consume(&id))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r == Some(true))
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_dequeue_never_duplicates() {
        let queue = Arc::new(JobQueue::new());
        for i in 0..50 {
            queue.enqueue("acme/app", &format!("f{}.txt", i), "d");
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(job) = queue.dequeue() {
                        ids.push(job.id);
                    }
                    ids
                })
            })
            .collect();
        let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let queue = JobQueue::new();
        let id = queue.enqueue("acme/app", "a.txt", "d");
        let json = serde_json::to_value(queue.get_job(&id).unwrap()).unwrap();
        assert_eq!(json["targetFile"], "a.txt");
        assert_eq!(json["status"], "queued");
        assert!(json["diffHash"].is_null());
    }
}
