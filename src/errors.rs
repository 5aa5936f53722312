//! Typed error hierarchy for patchgate.
//!
//! One enum per subsystem:
//! - `PatchError`: whole-file diff application failures
//! - `TokenError`: Proof-of-Preview mint/verify failures
//! - `AuthError`: installation credential negotiation failures
//! - `HostError`: repository host (GitHub REST) failures
//! - `SandboxError`: executor step failures, recorded on the job
//! - `DeliveryError`: everything the apply endpoint can answer with
//!
//! `DeliveryError` is the caller-facing taxonomy: every variant has a stable
//! machine-readable `reason()` and an HTTP status class.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors from the whole-file patch engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Invalid diff: no hunk header found")]
    MissingHunkHeader,

    #[error("Invalid hunk header at diff line {line}: {header}")]
    MalformedHunkHeader { line: usize, header: String },

    #[error("Hunk at diff line {line} starts at original line {start}, before the current position {cursor}")]
    OverlappingHunk {
        line: usize,
        start: usize,
        cursor: usize,
    },

    #[error("Hunk at diff line {line} runs past the end of the original file ({len} lines)")]
    OutOfRange { line: usize, len: usize },

    #[error("Hunk line {line} does not match original line {original_line}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        line: usize,
        original_line: usize,
        expected: String,
        found: String,
    },
}

/// Errors from the Proof-of-Preview token service.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Preview token has expired")]
    Expired,

    #[error("Preview token was not issued by this service")]
    WrongIssuer,

    #[error("Preview token signature is invalid")]
    BadSignature,

    #[error("Preview token is malformed: {0}")]
    Malformed(String),

    #[error("Failed to sign preview token: {0}")]
    Signing(String),
}

/// Errors from installation credential negotiation.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("GitHub App is not installed on {owner}/{repo}")]
    NotInstalled { owner: String, repo: String },

    #[error("No GitHub credentials configured")]
    NotConfigured,

    #[error("Failed to sign GitHub App JWT: {0}")]
    AppJwt(String),

    #[error("Failed to negotiate installation token: {0}")]
    Negotiation(String),
}

/// Errors from the repository host provider.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("GitHub API returned {status} for {operation}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("GitHub request for {operation} failed: {message}")]
    Transport { operation: String, message: String },

    #[error("Unexpected GitHub response for {operation}: {message}")]
    Decode { operation: String, message: String },
}

impl HostError {
    /// Upstream HTTP status, when the host answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            HostError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Errors from a sandbox step. These never escape the worker; they are
/// rendered into the job log and the job is marked failed.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to prepare sandbox directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exceeded the {timeout_secs}s time limit")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("`{command}` exited with {code:?}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("Invalid repository locator: {0}")]
    Repository(String),

    #[error("Diff does not apply to {file} as it would be delivered: {source}")]
    Patch {
        file: String,
        #[source]
        source: PatchError,
    },

    #[error("Sandbox copy of {file} differs from the content that would be delivered")]
    ContentMismatch { file: String },

    #[error("Unreadable project manifest {file}: {message}")]
    Manifest { file: String, message: String },
}

/// Caller-facing failures of the apply (finalize) operation.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid or expired preview token: {0}")]
    InvalidToken(#[source] TokenError),

    #[error("Token context mismatch: {0}")]
    ContextMismatch(String),

    #[error("Integrity violation: diff has changed since preview")]
    IntegrityViolation,

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Token replay detected: job {job_id} has already been used to open a pull request")]
    ReplayDetected { job_id: String },

    #[error("Unsafe patch: {0}")]
    UnsafePatch(String),

    #[error("Patch could not be applied: {0}")]
    Patch(#[from] PatchError),

    #[error("Patch applies cleanly but changes nothing in {file}")]
    NoOpPatch { file: String },

    #[error("Credential error: {0}")]
    Credentials(#[from] AuthError),

    #[error("Repository {repo} not found")]
    RepositoryNotFound { repo: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("GitHub rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Pull request #{pr} is blocked: {message}")]
    BlockedByCi { pr: u64, message: String },

    #[error("Automated rebase of pull request #{pr} failed: {source}")]
    RebaseConflict {
        pr: u64,
        #[source]
        source: PatchError,
    },

    #[error("Pull request #{pr} reached the rebase limit ({attempts}/{limit})")]
    RetryLimitReached { pr: u64, attempts: u32, limit: u32 },

    #[error("GitHub provider error: {0}")]
    Provider(#[source] HostError),
}

impl DeliveryError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::Validation(_) => "validation_error",
            DeliveryError::InvalidToken(_) => "invalid_token",
            DeliveryError::ContextMismatch(_) => "context_mismatch",
            DeliveryError::IntegrityViolation => "integrity_violation",
            DeliveryError::JobNotFound { .. } => "job_not_found",
            DeliveryError::ReplayDetected { .. } => "replay_detected",
            DeliveryError::UnsafePatch(_) => "unsafe_patch",
            DeliveryError::Patch(_) => "patch_failed",
            DeliveryError::NoOpPatch { .. } => "no_op_patch",
            DeliveryError::Credentials(_) => "credential_error",
            DeliveryError::RepositoryNotFound { .. } => "repository_not_found",
            DeliveryError::PermissionDenied(_) => "permission_denied",
            DeliveryError::RateLimited(_) => "rate_limited",
            DeliveryError::BlockedByCi { .. } => "blocked_by_ci",
            DeliveryError::RebaseConflict { .. } => "rebase_conflict",
            DeliveryError::RetryLimitReached { .. } => "retry_limit_reached",
            DeliveryError::Provider(_) => "provider_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DeliveryError::Validation(_) | DeliveryError::NoOpPatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            DeliveryError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            DeliveryError::ContextMismatch(_)
            | DeliveryError::PermissionDenied(_)
            | DeliveryError::Credentials(_) => StatusCode::FORBIDDEN,
            DeliveryError::JobNotFound { .. } | DeliveryError::RepositoryNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            DeliveryError::IntegrityViolation
            | DeliveryError::ReplayDetected { .. }
            | DeliveryError::Patch(_)
            | DeliveryError::BlockedByCi { .. }
            | DeliveryError::RebaseConflict { .. } => StatusCode::CONFLICT,
            DeliveryError::UnsafePatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DeliveryError::RateLimited(_) | DeliveryError::RetryLimitReached { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            DeliveryError::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Translate a host failure into the caller-facing taxonomy.
    ///
    /// `repo` is used to distinguish a missing repository (404 on the
    /// metadata lookup) from a generic upstream failure.
    pub fn from_host(err: HostError, repo: &str, repository_lookup: bool) -> Self {
        match err.status() {
            Some(404) if repository_lookup => DeliveryError::RepositoryNotFound {
                repo: repo.to_string(),
            },
            Some(401) | Some(403) if is_rate_limit_message(&err) => {
                DeliveryError::RateLimited(err.to_string())
            }
            Some(401) | Some(403) => DeliveryError::PermissionDenied(err.to_string()),
            Some(429) => DeliveryError::RateLimited(err.to_string()),
            _ => DeliveryError::Provider(err),
        }
    }
}

fn is_rate_limit_message(err: &HostError) -> bool {
    match err {
        HostError::Api { message, .. } => message.to_lowercase().contains("rate limit"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_error_reasons_match_the_public_taxonomy() {
        let cases: Vec<(DeliveryError, &str, StatusCode)> = vec![
            (
                DeliveryError::InvalidToken(TokenError::Expired),
                "invalid_token",
                StatusCode::UNAUTHORIZED,
            ),
            (
                DeliveryError::ContextMismatch("repo".into()),
                "context_mismatch",
                StatusCode::FORBIDDEN,
            ),
            (
                DeliveryError::IntegrityViolation,
                "integrity_violation",
                StatusCode::CONFLICT,
            ),
            (
                DeliveryError::ReplayDetected { job_id: "j".into() },
                "replay_detected",
                StatusCode::CONFLICT,
            ),
            (
                DeliveryError::UnsafePatch("too big".into()),
                "unsafe_patch",
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                DeliveryError::BlockedByCi {
                    pr: 1,
                    message: "ci".into(),
                },
                "blocked_by_ci",
                StatusCode::CONFLICT,
            ),
            (
                DeliveryError::RebaseConflict {
                    pr: 1,
                    source: PatchError::MissingHunkHeader,
                },
                "rebase_conflict",
                StatusCode::CONFLICT,
            ),
            (
                DeliveryError::RetryLimitReached {
                    pr: 1,
                    attempts: 3,
                    limit: 3,
                },
                "retry_limit_reached",
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, reason, status) in cases {
            assert_eq!(err.reason(), reason);
            assert_eq!(err.status(), status, "status for {}", reason);
        }
    }

    #[test]
    fn patch_error_is_a_non_retryable_conflict() {
        let err: DeliveryError = PatchError::MissingHunkHeader.into();
        assert_eq!(err.reason(), "patch_failed");
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn repository_404_is_distinguished_from_403() {
        let not_found = HostError::Api {
            operation: "get repository".into(),
            status: 404,
            message: "Not Found".into(),
        };
        let err = DeliveryError::from_host(not_found, "acme/app", true);
        assert!(matches!(err, DeliveryError::RepositoryNotFound { .. }));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let forbidden = HostError::Api {
            operation: "get repository".into(),
            status: 403,
            message: "Resource not accessible by integration".into(),
        };
        let err = DeliveryError::from_host(forbidden, "acme/app", true);
        assert!(matches!(err, DeliveryError::PermissionDenied(_)));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn rate_limit_403_is_reported_as_rate_limited() {
        let err = HostError::Api {
            operation: "list pulls".into(),
            status: 403,
            message: "API rate limit exceeded for installation".into(),
        };
        let err = DeliveryError::from_host(err, "acme/app", false);
        assert_eq!(err.reason(), "rate_limited");
    }

    #[test]
    fn non_repository_404_stays_a_provider_error() {
        let err = HostError::Api {
            operation: "get ref".into(),
            status: 404,
            message: "Not Found".into(),
        };
        let err = DeliveryError::from_host(err, "acme/app", false);
        assert_eq!(err.reason(), "provider_error");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PatchError::MissingHunkHeader);
        assert_std_error(&TokenError::Expired);
        assert_std_error(&AuthError::NotConfigured);
        assert_std_error(&SandboxError::Repository("x".into()));
        assert_std_error(&DeliveryError::IntegrityViolation);
    }
}
