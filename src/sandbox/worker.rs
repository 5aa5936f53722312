use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::executor::{Sandbox, SandboxOutcome};
use super::queue::{JobQueue, JobStatus, SandboxJob};
use crate::token::{TokenService, hash_diff};

/// Background loop draining the job queue one job at a time.
///
/// Each tick dequeues at most one job and processes it to a terminal state
/// before the next tick is considered. A failing or panicking sandbox run
/// marks the job failed and never takes the loop down.
pub struct SandboxWorker {
    queue: Arc<JobQueue>,
    sandbox: Arc<dyn Sandbox>,
    tokens: Arc<TokenService>,
    interval: Duration,
}

impl SandboxWorker {
    pub fn new(
        queue: Arc<JobQueue>,
        sandbox: Arc<dyn Sandbox>,
        tokens: Arc<TokenService>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            sandbox,
            tokens,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Tick until `cancel` fires. A job already in flight is finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "sandbox worker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.process_next().await;
                }
            }
        }
        tracing::info!("sandbox worker stopped");
    }

    /// Process the next queued job, if any. Returns its id.
    pub async fn process_next(&self) -> Option<String> {
        let job = self.queue.dequeue()?;
        tracing::info!(job_id = %job.id, repo = %job.repository, file = %job.target_file, "processing job");

        match self.execute(&job).await {
            Ok(outcome) if outcome.success => self.mint(&job),
            Ok(outcome) => {
                tracing::warn!(job_id = %job.id, "sandbox verification failed");
                self.queue
                    .set_status(&job.id, JobStatus::Failed, Some(&outcome.logs.join("\n")));
            }
            Err(reason) => {
                tracing::error!(job_id = %job.id, reason = %reason, "sandbox run aborted");
                self.queue.set_status(&job.id, JobStatus::Failed, Some(&reason));
            }
        }
        Some(job.id)
    }

    /// Run the sandbox on its own task so a panic surfaces as a `JoinError`.
    async fn execute(&self, job: &SandboxJob) -> Result<SandboxOutcome, String> {
        let sandbox = Arc::clone(&self.sandbox);
        let queue = Arc::clone(&self.queue);
        let job = job.clone();
        tokio::spawn(async move {
            let job_id = job.id.clone();
            let progress = move |message: &str| queue.append_log(&job_id, message);
            sandbox.run(&job, &progress).await
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                "Unexpected executor failure: sandbox panicked".to_string()
            } else {
                format!("Unexpected executor failure: {}", e)
            }
        })
    }

    fn mint(&self, job: &SandboxJob) {
        let diff_hash = hash_diff(&job.diff);
        match self
            .tokens
            .sign(&job.id, &job.repository, &job.target_file, &diff_hash)
        {
            Ok(minted) => {
                self.queue
                    .set_success(&job.id, minted.token, diff_hash, minted.expires_at);
                tracing::info!(job_id = %job.id, expires_at = %minted.expires_at, "preview token minted");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to mint preview token");
                self.queue.set_status(
                    &job.id,
                    JobStatus::Failed,
                    Some(&format!("Token minting failed: {}", e)),
                );
            }
        }
    }
}
