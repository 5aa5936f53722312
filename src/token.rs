//! Proof-of-Preview tokens.
//!
//! A preview token is a short-lived HS256 JWT asserting that a specific diff
//! for a specific repository and file passed sandbox verification. It is
//! minted only by the sandbox worker and checked only by the apply gate.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::TokenError;

pub const DEFAULT_ISSUER: &str = "patchgate-sandbox-worker";
pub const DEFAULT_TTL_SECS: i64 = 15 * 60;

/// SHA-256 of the whole diff text, lowercase hex. Any byte-level change,
/// whitespace included, changes the digest.
pub fn hash_diff(diff: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(diff.as_bytes());
    hex::encode(hasher.finalize())
}

/// Claims carried by a preview token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewClaims {
    pub job_id: String,
    pub repo: String,
    pub file: String,
    pub diff_hash: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly minted token and its expiry.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies preview tokens with a shared secret.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, issuer: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&[issuer]);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: issuer.to_string(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token binding `(job_id, repo, file, diff_hash)`.
    pub fn sign(
        &self,
        job_id: &str,
        repo: &str,
        file: &str,
        diff_hash: &str,
    ) -> Result<MintedToken, TokenError> {
        self.sign_at(job_id, repo, file, diff_hash, Utc::now())
    }

    pub(crate) fn sign_at(
        &self,
        job_id: &str,
        repo: &str,
        file: &str,
        diff_hash: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<MintedToken, TokenError> {
        let expires_at = issued_at + self.ttl;
        let claims = PreviewClaims {
            job_id: job_id.to_string(),
            repo: repo.to_string(),
            file: file.to_string(),
            diff_hash: diff_hash.to_string(),
            iss: self.issuer.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        Ok(MintedToken { token, expires_at })
    }

    /// Verify signature, issuer, and expiry. Any failure is a rejection.
    pub fn verify(&self, token: &str) -> Result<PreviewClaims, TokenError> {
        decode::<PreviewClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidIssuer => TokenError::WrongIssuer,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed(e.to_string()),
            })
    }
}
