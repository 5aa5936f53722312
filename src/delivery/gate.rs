use std::sync::Arc;

use super::ApplyRequest;
use crate::errors::DeliveryError;
use crate::sandbox::JobQueue;
use crate::token::{PreviewClaims, TokenService, hash_diff};

/// Security checks an apply request must pass before any credential is
/// requested. Checks run in order and stop at the first failure; the last
/// step marks the job consumed.
pub struct EntryGate {
    tokens: Arc<TokenService>,
    queue: Arc<JobQueue>,
}

impl EntryGate {
    pub fn new(tokens: Arc<TokenService>, queue: Arc<JobQueue>) -> Self {
        Self { tokens, queue }
    }

    pub fn admit(&self, req: &ApplyRequest) -> Result<PreviewClaims, DeliveryError> {
        let claims = self.tokens.verify(&req.token).map_err(|e| {
            tracing::warn!(job_id = %req.job_id, error = %e, "apply rejected: invalid token");
            DeliveryError::InvalidToken(e)
        })?;

        let mismatch = if claims.job_id != req.job_id {
            Some("jobId")
        } else if claims.repo != req.repository {
            Some("repository")
        } else if claims.file != req.target_file {
            Some("targetFile")
        } else {
            None
        };
        if let Some(field) = mismatch {
            tracing::warn!(job_id = %req.job_id, field, "apply rejected: token context mismatch");
            return Err(DeliveryError::ContextMismatch(format!(
                "token was not issued for this {}",
                field
            )));
        }

        if hash_diff(&req.diff) != claims.diff_hash {
            tracing::warn!(job_id = %req.job_id, "apply rejected: diff changed since preview");
            return Err(DeliveryError::IntegrityViolation);
        }

        match self.queue.consume(&req.job_id) {
            None => {
                tracing::warn!(job_id = %req.job_id, "apply rejected: unknown job");
                Err(DeliveryError::JobNotFound {
                    job_id: req.job_id.clone(),
                })
            }
            Some(false) => {
                tracing::warn!(job_id = %req.job_id, "apply rejected: token replay");
                Err(DeliveryError::ReplayDetected {
                    job_id: req.job_id.clone(),
                })
            }
            Some(true) => {
                tracing::info!(job_id = %req.job_id, repo = %req.repository, file = %req.target_file, "job consumed");
                Ok(claims)
            }
        }
    }
}
