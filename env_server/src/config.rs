//! Control plane configuration, loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::services::kubernetes_service::QuotaSpec;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// Static token for GitHub API calls (used when no App is configured).
    pub github_token: String,
    /// GitHub App id; together with the private key enables installation tokens.
    pub github_app_id: Option<String>,
    /// Path to the GitHub App PEM private key.
    pub github_app_private_key_path: Option<PathBuf>,
    /// GitHub REST API base URL.
    pub github_api_url: String,
    /// Domain that preview URLs are served under.
    pub base_domain: String,
    /// Kubernetes API access.
    pub kube: KubeSettings,
    /// Resource quota applied to every preview namespace.
    pub quota: QuotaSpec,
    /// Number of environment tasks allowed to run at once.
    pub worker_concurrency: usize,
    /// Bounded capacity of the task queue.
    pub task_queue_capacity: usize,
    /// Seconds between sweeps for stuck environments.
    pub sweep_interval_secs: u64,
    /// Minutes an environment may sit in a transient state before the sweep closes it.
    pub stale_after_mins: i64,
    /// Whether the sweep checks ready environments for a missing namespace.
    pub sweep_check_ready: bool,
    /// Days a webhook delivery id is kept for redelivery detection.
    pub delivery_retention_days: i64,
    /// Maximum database connections.
    pub db_max_connections: usize,
    /// Request timeout for the HTTP server.
    pub request_timeout_secs: u64,
}

/// Explicit Kubernetes API settings. All unset means in-cluster discovery.
#[derive(Clone, Debug, Default)]
pub struct KubeSettings {
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let github_webhook_secret = std::env::var("GITHUB_WEBHOOK_SECRET").unwrap_or_default();
        let github_token = std::env::var("GITHUB_TOKEN").unwrap_or_default();
        let github_app_id = env_opt("GITHUB_APP_ID");
        let github_app_private_key_path = env_opt("GITHUB_APP_PRIVATE_KEY_PATH").map(PathBuf::from);
        let github_api_url =
            env_opt("GITHUB_API_URL").unwrap_or_else(|| "https://api.github.com".to_string());
        let base_domain =
            env_opt("BASE_DOMAIN").unwrap_or_else(|| "preview.localhost".to_string());

        let kube = KubeSettings {
            api_url: env_opt("KUBE_API_URL"),
            token: env_opt("KUBE_TOKEN"),
            token_file: env_opt("KUBE_TOKEN_FILE").map(PathBuf::from),
            ca_file: env_opt("KUBE_CA_FILE").map(PathBuf::from),
        };

        let quota = QuotaSpec {
            cpu: env_opt("QUOTA_CPU").unwrap_or_else(|| "1".to_string()),
            memory: env_opt("QUOTA_MEMORY").unwrap_or_else(|| "2Gi".to_string()),
            pods: env_opt("QUOTA_PODS").unwrap_or_else(|| "10".to_string()),
        };

        let config = Self {
            github_webhook_secret,
            github_token,
            github_app_id,
            github_app_private_key_path,
            github_api_url,
            base_domain,
            kube,
            quota,
            worker_concurrency: env_or("WORKER_CONCURRENCY", 4).max(1),
            task_queue_capacity: env_or("TASK_QUEUE_CAPACITY", 256).max(1),
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", 3600).max(1),
            stale_after_mins: env_or("STALE_AFTER_MINS", 30),
            sweep_check_ready: env_or("SWEEP_CHECK_READY", true),
            delivery_retention_days: env_or("DELIVERY_RETENTION_DAYS", 7).max(1),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10).max(1),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30),
        };

        if config.github_webhook_secret.is_empty() {
            tracing::warn!("GITHUB_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if !config.has_github_app() && config.github_token.is_empty() {
            tracing::warn!("No GitHub App or GITHUB_TOKEN configured -- PR comments and statuses disabled");
        }

        config
    }

    pub fn has_github_app(&self) -> bool {
        self.github_app_id.is_some() && self.github_app_private_key_path.is_some()
    }
}

#[cfg(test)]
impl AppConfig {
    /// Configuration with defaults and no external credentials.
    pub fn for_tests() -> Self {
        Self {
            github_webhook_secret: String::new(),
            github_token: String::new(),
            github_app_id: None,
            github_app_private_key_path: None,
            github_api_url: "https://api.github.com".to_string(),
            base_domain: "preview.example.com".to_string(),
            kube: KubeSettings::default(),
            quota: QuotaSpec {
                cpu: "1".to_string(),
                memory: "2Gi".to_string(),
                pods: "10".to_string(),
            },
            worker_concurrency: 2,
            task_queue_capacity: 8,
            sweep_interval_secs: 3600,
            stale_after_mins: 30,
            sweep_check_ready: true,
            delivery_retention_days: 7,
            db_max_connections: 2,
            request_timeout_secs: 30,
        }
    }
}
