//! GitHub integration: webhook validation, commit statuses, PR comments.
//!
//! Credentials come either from a GitHub App (JWT exchanged for short-lived
//! installation tokens) or from a static token. With neither configured,
//! notifications are skipped.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

/// Commit status context shown in the PR checks list.
pub const STATUS_CONTEXT: &str = "ephemera/environment";

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) if !b.is_empty() => b,
        _ => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Public URL of a preview environment: `https://pr-{n}-{repo}.{base_domain}`.
pub fn environment_url(pr_number: i32, repository_name: &str, base_domain: &str) -> String {
    let subdomain = format!("pr-{pr_number}-{repository_name}")
        .to_lowercase()
        .replace('_', "-");
    format!("https://{subdomain}.{base_domain}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
        })
    }
}

/// Where a notification goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrTarget {
    pub installation_id: Option<i64>,
    pub repo_full_name: String,
    pub pr_number: i32,
}

pub fn ready_comment(env_url: &str, namespace: &str) -> String {
    format!(
        "## Ephemera Environment Ready\n\n\
         Your preview environment has been created!\n\n\
         **Environment URL**: {env_url}\n\
         **Namespace**: `{namespace}`\n\
         **Status**: Ready\n\n\
         ---\n\
         *Powered by Ephemera*\n"
    )
}

pub fn failed_comment(namespace: &str, error: &str) -> String {
    format!(
        "## Ephemera Environment Failed\n\n\
         Failed to create preview environment.\n\n\
         **Namespace**: `{namespace}`\n\
         **Status**: Failed\n\
         **Error**: {error}\n\n\
         Please check logs or contact support.\n\n\
         ---\n\
         *Powered by Ephemera*\n"
    )
}

pub fn destroyed_comment(namespace: &str, merged: bool) -> String {
    let action = if merged { "merged" } else { "closed" };
    format!(
        "## Environment Cleanup Complete\n\n\
         PR was {action}. Preview environment has been destroyed.\n\n\
         **Namespace**: `{namespace}`\n\
         **Status**: Destroyed\n\n\
         All resources have been cleaned up.\n\n\
         ---\n\
         *Powered by Ephemera*\n"
    )
}

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub App JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("GitHub App private key: {0}")]
    Key(String),
}

/// Pull request feedback the lifecycle tasks emit.
#[async_trait]
pub trait PullRequestNotifier: Send + Sync {
    async fn post_status(
        &self,
        target: &PrTarget,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<(), GitHubError>;

    async fn post_comment(&self, target: &PrTarget, body: &str) -> Result<(), GitHubError>;
}

enum Credentials {
    App { app_id: String, key: EncodingKey },
    Token(String),
    None,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct GitHubService {
    http: reqwest::Client,
    api_url: String,
    credentials: Credentials,
    /// Static token used when an App is configured but the event carried no installation.
    fallback_token: Option<String>,
    installation_tokens: Mutex<HashMap<i64, CachedToken>>,
}

impl GitHubService {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let fallback_token = Some(config.github_token.clone()).filter(|t| !t.is_empty());
        let credentials = match (&config.github_app_id, &config.github_app_private_key_path) {
            (Some(app_id), Some(path)) => match std::fs::read(path) {
                Ok(pem) => {
                    let key = EncodingKey::from_rsa_pem(&pem)
                        .map_err(|e| GitHubError::Key(format!("{}: {e}", path.display())))?;
                    tracing::info!(app_id = %app_id, "GitHub App integration initialized");
                    Credentials::App {
                        app_id: app_id.clone(),
                        key,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "GitHub App private key not readable, falling back to token"
                    );
                    fallback_token
                        .clone()
                        .map(Credentials::Token)
                        .unwrap_or(Credentials::None)
                }
            },
            _ => fallback_token
                .clone()
                .map(Credentials::Token)
                .unwrap_or(Credentials::None),
        };

        Ok(Self::new(&config.github_api_url, credentials, fallback_token))
    }

    fn new(api_url: &str, credentials: Credentials, fallback_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            credentials,
            fallback_token,
            installation_tokens: Mutex::new(HashMap::new()),
        }
    }

    fn app_jwt(app_id: &str, key: &EncodingKey) -> Result<String, GitHubError> {
        let now = Utc::now().timestamp();
        // Backdated against clock drift; GitHub caps lifetime at ten minutes.
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 540,
            iss: app_id.to_string(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            key,
        )?)
    }

    async fn installation_token(
        &self,
        app_id: &str,
        key: &EncodingKey,
        installation_id: i64,
    ) -> Result<String, GitHubError> {
        let mut cache = self.installation_tokens.lock().await;
        if let Some(cached) = cache.get(&installation_id) {
            if cached.expires_at - Duration::minutes(5) > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let jwt = Self::app_jwt(app_id, key)?;
        let resp = self
            .http
            .post(format!(
                "{}/app/installations/{installation_id}/access_tokens",
                self.api_url
            ))
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ephemera")
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GitHubError::Api { status, body });
        }

        let token: InstallationToken = resp.json().await?;
        cache.insert(
            installation_id,
            CachedToken {
                token: token.token.clone(),
                expires_at: token.expires_at,
            },
        );
        Ok(token.token)
    }

    /// Token for a call on behalf of `installation_id`, or `None` when unconfigured.
    async fn resolve_token(&self, installation_id: Option<i64>) -> Result<Option<String>, GitHubError> {
        match (&self.credentials, installation_id) {
            (Credentials::App { app_id, key }, Some(id)) => {
                self.installation_token(app_id, key, id).await.map(Some)
            }
            (Credentials::App { .. }, None) => Ok(self.fallback_token.clone()),
            (Credentials::Token(token), _) => Ok(Some(token.clone())),
            (Credentials::None, _) => Ok(None),
        }
    }

    async fn post_json(
        &self,
        installation_id: Option<i64>,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<bool, GitHubError> {
        let Some(token) = self.resolve_token(installation_id).await? else {
            tracing::debug!(path, "GitHub credentials not set, skipping");
            return Ok(false);
        };

        let resp = self
            .http
            .post(format!("{}{path}", self.api_url))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ephemera")
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GitHubError::Api { status, body });
        }
        Ok(true)
    }
}

#[async_trait]
impl PullRequestNotifier for GitHubService {
    async fn post_status(
        &self,
        target: &PrTarget,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<(), GitHubError> {
        let body = serde_json::json!({
            "state": state,
            "description": description,
            "target_url": target_url,
            "context": STATUS_CONTEXT,
        });
        let path = format!("/repos/{}/statuses/{sha}", target.repo_full_name);
        if self.post_json(target.installation_id, &path, &body).await? {
            tracing::info!(repo = %target.repo_full_name, sha, %state, "Updated commit status");
        }
        Ok(())
    }

    async fn post_comment(&self, target: &PrTarget, body: &str) -> Result<(), GitHubError> {
        let payload = serde_json::json!({ "body": body });
        let path = format!(
            "/repos/{}/issues/{}/comments",
            target.repo_full_name, target.pr_number
        );
        if self.post_json(target.installation_id, &path, &payload).await? {
            tracing::info!(
                repo = %target.repo_full_name,
                pr = target.pr_number,
                "Posted PR comment"
            );
        }
        Ok(())
    }
}
