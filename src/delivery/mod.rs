//! Pull request delivery: entry gate, credentials, and PR workflow.
//!
//! `DeliveryEngine::apply` is the only path that writes to a remote
//! repository. Nothing is written and no credential is requested unless the
//! entry gate admitted the request and consumed its job.

pub mod comments;
pub mod gate;
pub mod github;
pub mod host;
pub mod workflow;

use std::sync::Arc;

use serde::Deserialize;

use crate::auth::CredentialProvider;
use crate::config::DeliveryConfig;
use crate::errors::DeliveryError;
use crate::repo::RepoRef;

pub use gate::EntryGate;
pub use host::{HostConnector, RepoHost};
pub use workflow::{ApplyOutcome, DeliveryMode, PrWorkflow, Rollback, VerifiedEdit};

/// Body of an apply (finalize) request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub job_id: String,
    pub token: String,
    pub repository: String,
    pub target_file: String,
    pub diff: String,
    #[serde(default)]
    pub summary: Option<String>,
}

impl ApplyRequest {
    fn validate(&self) -> Result<RepoRef, DeliveryError> {
        let required = [
            ("jobId", &self.job_id),
            ("token", &self.token),
            ("repository", &self.repository),
            ("targetFile", &self.target_file),
            ("diff", &self.diff),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(DeliveryError::Validation(format!("{} must not be empty", field)));
        }
        RepoRef::parse(&self.repository).ok_or_else(|| {
            DeliveryError::Validation(format!(
                "invalid repository locator '{}', expected owner/repo or a GitHub URL",
                self.repository
            ))
        })
    }
}

pub struct DeliveryEngine {
    gate: EntryGate,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn HostConnector>,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    pub fn new(
        gate: EntryGate,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn HostConnector>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            gate,
            credentials,
            connector,
            config,
        }
    }

    pub async fn apply(&self, req: &ApplyRequest) -> Result<ApplyOutcome, DeliveryError> {
        let repo = req.validate()?;
        let claims = self.gate.admit(req)?;

        let token = self
            .credentials
            .installation_token(&repo.owner, &repo.name)
            .await
            .inspect_err(|e| tracing::warn!(job_id = %req.job_id, repo = %repo, error = %e, "credential negotiation failed"))?;
        tracing::debug!(job_id = %req.job_id, repo = %repo, "write credential obtained");
        let host = self.connector.connect(&token);

        let edit = VerifiedEdit {
            repo: &repo,
            job_id: &req.job_id,
            target_file: &req.target_file,
            diff: &req.diff,
            diff_hash: &claims.diff_hash,
            summary: req.summary.as_deref(),
        };
        let result = PrWorkflow::new(host.as_ref(), &self.config)
            .execute(&edit)
            .await;
        match &result {
            Ok(outcome) => tracing::info!(
                job_id = %req.job_id,
                repo = %repo,
                mode = ?outcome.mode,
                pr_url = %outcome.pr_url,
                "edit delivered"
            ),
            Err(e) => tracing::warn!(
                job_id = %req.job_id,
                repo = %repo,
                reason = e.reason(),
                error = %e,
                "delivery failed"
            ),
        }
        result
    }
}
