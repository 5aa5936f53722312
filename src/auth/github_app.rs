use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use super::CredentialProvider;
use super::cache::InstallationTokenCache;
use crate::errors::AuthError;

const USER_AGENT: &str = "patchgate";

/// Claims of the short-lived App JWT used to talk to the App endpoints.
#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Negotiates installation tokens for a GitHub App.
pub struct GitHubAppCredentials {
    app_id: String,
    key: EncodingKey,
    api_base: String,
    client: reqwest::Client,
    cache: Arc<InstallationTokenCache>,
}

impl GitHubAppCredentials {
    /// `private_key_pem` may carry literal `\n` escapes, as it does when the
    /// key comes from a single-line environment variable.
    pub fn new(
        app_id: &str,
        private_key_pem: &str,
        api_base: &str,
        cache: Arc<InstallationTokenCache>,
    ) -> Result<Self, AuthError> {
        let pem = private_key_pem.replace("\\n", "\n");
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::AppJwt(format!("invalid private key: {}", e)))?;
        Ok(Self {
            app_id: app_id.to_string(),
            key,
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cache,
        })
    }

    fn app_jwt(&self) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // backdated for clock skew
            iat: now - 60,
            exp: now + 10 * 60,
            iss: self.app_id.clone(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| AuthError::AppJwt(e.to_string()))
    }

    async fn resolve_installation_id(&self, owner: &str, repo: &str) -> Result<u64, AuthError> {
        let url = format!("{}/repos/{}/{}/installation", self.api_base, owner, repo);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.app_jwt()?)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| AuthError::Negotiation(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AuthError::NotInstalled {
                owner: owner.to_string(),
                repo: repo.to_string(),
            });
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| AuthError::Negotiation(e.to_string()))?;
        let installation: InstallationResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Negotiation(e.to_string()))?;
        Ok(installation.id)
    }

    async fn create_access_token(&self, installation_id: u64) -> Result<AccessTokenResponse, AuthError> {
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        self.client
            .post(&url)
            .bearer_auth(self.app_jwt()?)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| AuthError::Negotiation(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthError::Negotiation(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Negotiation(e.to_string()))
    }
}

#[async_trait]
impl CredentialProvider for GitHubAppCredentials {
    async fn installation_token(&self, owner: &str, repo: &str) -> Result<String, AuthError> {
        let (installation_id, memoized) = match self.cache.installation_id(owner, repo) {
            Some(id) => (id, true),
            None => {
                let id = self.resolve_installation_id(owner, repo).await?;
                self.cache.remember_installation(owner, repo, id);
                (id, false)
            }
        };

        if let Some(token) = self.cache.get(installation_id) {
            tracing::debug!(installation_id, "using cached installation token");
            return Ok(token);
        }

        let fresh = match self.create_access_token(installation_id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                if memoized {
                    // the App may have been reinstalled under a new id
                    self.cache.forget_installation(owner, repo);
                }
                return Err(e);
            }
        };
        tracing::info!(
            installation_id,
            expires_at = %fresh.expires_at,
            "negotiated installation token"
        );
        self.cache
            .insert(installation_id, fresh.token.clone(), fresh.expires_at);
        Ok(fresh.token)
    }
}
