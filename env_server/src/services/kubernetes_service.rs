//! Kubernetes integration: namespaces and resource quotas over the REST API.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::KubeSettings;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Kubernetes is not configured")]
    Disabled,
    #[error("Kubernetes API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Kubernetes request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Kubernetes configuration: {0}")]
    Config(String),
}

/// Hard limits applied to each preview namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub cpu: String,
    pub memory: String,
    pub pods: String,
}

/// Cluster operations the lifecycle tasks depend on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Create a namespace. An already existing namespace counts as success.
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// Delete a namespace. A missing namespace counts as success.
    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError>;

    /// `status.phase` of the namespace (`Active`, `Terminating`), if it exists.
    async fn namespace_phase(&self, name: &str) -> Result<Option<String>, ClusterError>;

    /// Create the `{namespace}-quota` ResourceQuota. Existing quota counts as success.
    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &QuotaSpec,
    ) -> Result<(), ClusterError>;
}

#[derive(Debug, Clone)]
enum TokenSource {
    Static(String),
    /// Projected service account tokens rotate, so the file is re-read per call.
    File(PathBuf),
    None,
}

#[derive(Debug, Clone)]
struct Transport {
    api_url: String,
    token: TokenSource,
    http: reqwest::Client,
}

/// REST client for the Kubernetes API server. Constructed disabled when no
/// cluster can be found; every call then fails with [`ClusterError::Disabled`].
#[derive(Debug, Clone)]
pub struct KubernetesService {
    transport: Option<Transport>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct NamespaceBody {
    #[serde(default)]
    status: Option<NamespaceStatus>,
}

#[derive(Debug, Deserialize)]
struct NamespaceStatus {
    #[serde(default)]
    phase: Option<String>,
}

impl KubernetesService {
    pub fn disabled() -> Self {
        Self { transport: None }
    }

    /// Explicit settings first, then the in-cluster service account, else disabled.
    pub fn from_settings(settings: &KubeSettings) -> Result<Self, ClusterError> {
        if let Some(api_url) = &settings.api_url {
            let token = match (&settings.token, &settings.token_file) {
                (Some(token), _) => TokenSource::Static(token.clone()),
                (None, Some(path)) => TokenSource::File(path.clone()),
                (None, None) => TokenSource::None,
            };
            let http = build_http(settings.ca_file.as_deref())?;
            tracing::info!(api_url = %api_url, "Using configured Kubernetes API");
            return Ok(Self::with_transport(api_url, token, http));
        }

        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok();
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        if let Some(host) = host {
            let token_path = sa_dir.join("token");
            if token_path.exists() {
                let host = if host.contains(':') {
                    format!("[{host}]")
                } else {
                    host
                };
                let ca_path = sa_dir.join("ca.crt");
                let http = build_http(ca_path.exists().then_some(ca_path.as_path()))?;
                tracing::info!("Loaded in-cluster Kubernetes configuration");
                return Ok(Self::with_transport(
                    &format!("https://{host}:{port}"),
                    TokenSource::File(token_path),
                    http,
                ));
            }
        }

        tracing::warn!("No Kubernetes configuration found -- namespace operations disabled");
        Ok(Self::disabled())
    }

    fn with_transport(api_url: &str, token: TokenSource, http: reqwest::Client) -> Self {
        Self {
            transport: Some(Transport {
                api_url: api_url.trim_end_matches('/').to_string(),
                token,
                http,
            }),
        }
    }

    fn transport(&self) -> Result<&Transport, ClusterError> {
        self.transport.as_ref().ok_or(ClusterError::Disabled)
    }
}

fn build_http(ca_file: Option<&Path>) -> Result<reqwest::Client, ClusterError> {
    let mut builder = reqwest::Client::builder()
        .user_agent("ephemera")
        .timeout(std::time::Duration::from_secs(30));
    if let Some(path) = ca_file {
        let pem = std::fs::read(path)
            .map_err(|e| ClusterError::Config(format!("read CA {}: {e}", path.display())))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| ClusterError::Config(format!("parse CA {}: {e}", path.display())))?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|e| ClusterError::Config(format!("http client: {e}")))
}

impl Transport {
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ClusterError> {
        let req = self
            .http
            .request(method, format!("{}{path}", self.api_url))
            .header("Accept", "application/json");
        let token = match &self.token {
            TokenSource::Static(token) => Some(token.clone()),
            TokenSource::File(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ClusterError::Config(format!("read token {}: {e}", path.display())))?
                    .trim()
                    .to_string(),
            ),
            TokenSource::None => None,
        };
        Ok(match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        })
    }
}

async fn api_error(resp: reqwest::Response) -> ClusterError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<StatusBody>(&text)
        .ok()
        .map(|body| body.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(text);
    ClusterError::Api { status, message }
}

#[async_trait]
impl ClusterApi for KubernetesService {
    fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let transport = self.transport()?;
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": labels },
        });
        let resp = transport
            .request(reqwest::Method::POST, "/api/v1/namespaces")
            .await?
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {
                tracing::info!(namespace = name, "Created namespace");
                Ok(())
            }
            StatusCode::CONFLICT => {
                tracing::warn!(namespace = name, "Namespace already exists");
                Ok(())
            }
            _ => Err(api_error(resp).await),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let transport = self.transport()?;
        let resp = transport
            .request(reqwest::Method::DELETE, &format!("/api/v1/namespaces/{name}"))
            .await?
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {
                tracing::info!(namespace = name, "Deleted namespace");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                tracing::warn!(namespace = name, "Namespace not found");
                Ok(())
            }
            _ => Err(api_error(resp).await),
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError> {
        Ok(self.namespace_phase(name).await?.is_some())
    }

    async fn namespace_phase(&self, name: &str) -> Result<Option<String>, ClusterError> {
        let transport = self.transport()?;
        let resp = transport
            .request(reqwest::Method::GET, &format!("/api/v1/namespaces/{name}"))
            .await?
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {
                let body: NamespaceBody = resp.json().await?;
                // A namespace without a reported phase still exists.
                Ok(Some(
                    body.status
                        .and_then(|s| s.phase)
                        .unwrap_or_else(|| "Unknown".to_string()),
                ))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(api_error(resp).await),
        }
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &QuotaSpec,
    ) -> Result<(), ClusterError> {
        let transport = self.transport()?;
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": { "name": format!("{namespace}-quota"), "namespace": namespace },
            "spec": {
                "hard": {
                    "requests.cpu": quota.cpu,
                    "requests.memory": quota.memory,
                    "pods": quota.pods,
                }
            },
        });
        let resp = transport
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/namespaces/{namespace}/resourcequotas"),
            )
            .await?
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {
                tracing::info!(namespace, "Created resource quota");
                Ok(())
            }
            StatusCode::CONFLICT => {
                tracing::warn!(namespace, "Resource quota already exists");
                Ok(())
            }
            _ => Err(api_error(resp).await),
        }
    }
}
