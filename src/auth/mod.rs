//! Write credentials for the repository host.
//!
//! The apply path asks a `CredentialProvider` for a token scoped to one
//! repository right before it writes. Production uses GitHub App
//! installation tokens (memoized in `InstallationTokenCache`); a static
//! personal token is supported for development.

pub mod cache;
pub mod github_app;

use async_trait::async_trait;

use crate::errors::AuthError;

pub use cache::InstallationTokenCache;
pub use github_app::GitHubAppCredentials;

/// Source of repository-scoped write credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn installation_token(&self, owner: &str, repo: &str) -> Result<String, AuthError>;
}

/// A fixed token, e.g. a personal access token in `GITHUB_TOKEN`.
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn installation_token(&self, _owner: &str, _repo: &str) -> Result<String, AuthError> {
        if self.token.is_empty() {
            return Err(AuthError::NotConfigured);
        }
        Ok(self.token.clone())
    }
}

/// Provider used when nothing is configured; every write is refused.
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn installation_token(&self, _owner: &str, _repo: &str) -> Result<String, AuthError> {
        Err(AuthError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials_return_token() {
        let creds = StaticCredentials::new("ghp_abc");
        assert_eq!(creds.installation_token("acme", "app").await.unwrap(), "ghp_abc");
    }

    #[tokio::test]
    async fn test_empty_static_token_is_not_configured() {
        let creds = StaticCredentials::new("");
        assert!(matches!(
            creds.installation_token("acme", "app").await,
            Err(AuthError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_no_credentials_refuses() {
        assert!(NoCredentials.installation_token("acme", "app").await.is_err());
    }
}
