//! Read-only REST API for environments and their deployments.

use chrono::{DateTime, Utc};
use diesel_async::AsyncPgConnection;
use serde::Serialize;

use crate::models::deployment::Deployment;
use crate::models::environment::Environment;
use crate::services::environment_service::{self, EnvironmentFilter};
use crate::services::deployment_service;

/// JSON response for an environment.
#[derive(Debug, Serialize)]
pub struct EnvironmentJson {
    pub id: i64,
    pub repository_full_name: String,
    pub repository_name: String,
    pub pr_number: i32,
    pub pr_title: Option<String>,
    pub branch_name: String,
    pub commit_sha: String,
    pub namespace: String,
    pub environment_url: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub owner_id: i64,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Environment> for EnvironmentJson {
    fn from(env: Environment) -> Self {
        Self {
            id: env.id,
            repository_full_name: env.repository_full_name,
            repository_name: env.repository_name,
            pr_number: env.pr_number,
            pr_title: env.pr_title,
            branch_name: env.branch_name,
            commit_sha: env.commit_sha,
            namespace: env.namespace,
            environment_url: env.environment_url,
            status: env.status,
            error_message: env.error_message,
            owner_id: env.owner_id,
            last_deployed_at: env.last_deployed_at,
            destroyed_at: env.destroyed_at,
            created_at: env.created_at,
            updated_at: env.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeploymentJson {
    pub id: i64,
    pub environment_id: i64,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<Deployment> for DeploymentJson {
    fn from(d: Deployment) -> Self {
        Self {
            duration_seconds: d.duration_seconds(),
            id: d.id,
            environment_id: d.environment_id,
            commit_sha: d.commit_sha,
            commit_message: d.commit_message,
            status: d.status,
            error_message: d.error_message,
            started_at: d.started_at,
            completed_at: d.completed_at,
            created_at: d.created_at,
        }
    }
}

pub async fn list_environments(
    conn: &mut AsyncPgConnection,
    filter: &EnvironmentFilter,
) -> anyhow::Result<Vec<EnvironmentJson>> {
    let envs = environment_service::list_environments(conn, filter).await?;
    Ok(envs.into_iter().map(EnvironmentJson::from).collect())
}

pub async fn get_environment(
    conn: &mut AsyncPgConnection,
    env_id: i64,
) -> anyhow::Result<Option<EnvironmentJson>> {
    let env = environment_service::get_environment(conn, env_id).await?;
    Ok(env.map(EnvironmentJson::from))
}

pub async fn get_environment_by_namespace(
    conn: &mut AsyncPgConnection,
    namespace: &str,
) -> anyhow::Result<Option<EnvironmentJson>> {
    let env = environment_service::find_by_namespace(conn, namespace).await?;
    Ok(env.map(EnvironmentJson::from))
}

/// Deployments of an environment, or `None` when the environment is unknown.
pub async fn list_deployments(
    conn: &mut AsyncPgConnection,
    env_id: i64,
    limit: i64,
) -> anyhow::Result<Option<Vec<DeploymentJson>>> {
    if environment_service::get_environment(conn, env_id).await?.is_none() {
        return Ok(None);
    }
    let deployments = deployment_service::list_for_environment(conn, env_id, limit).await?;
    Ok(Some(deployments.into_iter().map(DeploymentJson::from).collect()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::models::environment::EnvironmentStatus;
    use crate::test_support::environment;

    #[test]
    fn environment_json_keeps_lifecycle_fields() {
        let mut env = environment(EnvironmentStatus::Failed);
        env.error_message = Some("Namespace no longer exists".to_string());
        let json = serde_json::to_value(EnvironmentJson::from(env)).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["namespace"], "pr-42-web-app");
        assert_eq!(json["error_message"], "Namespace no longer exists");
        assert!(json.get("installation_id").is_none());
    }

    #[test]
    fn deployment_json_reports_duration() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let deployment = Deployment {
            id: 1,
            environment_id: 7,
            commit_sha: "abc".to_string(),
            commit_message: None,
            status: "success".to_string(),
            started_at: Some(start),
            completed_at: Some(start + chrono::Duration::seconds(95)),
            error_message: None,
            created_at: start,
            updated_at: start,
        };
        let json = serde_json::to_value(DeploymentJson::from(deployment)).unwrap();
        assert_eq!(json["duration_seconds"], 95);
    }
}
