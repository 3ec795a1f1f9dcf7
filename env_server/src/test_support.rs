//! Test fixtures: an in-memory cluster, record builders, and a Postgres pool
//! isolated in its own schema.
//!
//! Database-backed tests read `TEST_DATABASE_URL` and skip when it is unset.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};

use crate::config::AppConfig;
use crate::db::{create_pool, DbPool};
use crate::models::deployment::Deployment;
use crate::models::environment::{generate_namespace, Environment, EnvironmentStatus, NewEnvironment};
use crate::models::user::NewUser;
use crate::schema::{deployments, environments};
use crate::services::dispatcher::TaskContext;
use crate::services::github_service::GitHubService;
use crate::services::kubernetes_service::{ClusterApi, ClusterError, QuotaSpec};
use crate::services::{deployment_service, environment_service, user_service};

/// In-memory cluster that records calls.
#[derive(Default)]
pub struct FakeCluster {
    pub calls: Mutex<Vec<String>>,
    pub fail_quota: bool,
    pub fail_delete: bool,
    /// Every namespace lookup reports "not found".
    pub namespaces_gone: bool,
    /// Held by a test to pause `create_namespace` mid-provisioning.
    pub hold_create: tokio::sync::Mutex<()>,
}

impl FakeCluster {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let _held = self.hold_create.lock().await;
        self.calls
            .lock()
            .unwrap()
            .push(format!("create {name} app={}", labels["app"]));
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.calls.lock().unwrap().push(format!("delete {name}"));
        if self.fail_delete {
            return Err(ClusterError::Api {
                status: 500,
                message: "etcdserver: request timed out".to_string(),
            });
        }
        Ok(())
    }

    async fn namespace_exists(&self, _name: &str) -> Result<bool, ClusterError> {
        Ok(!self.namespaces_gone)
    }

    async fn namespace_phase(&self, _name: &str) -> Result<Option<String>, ClusterError> {
        Ok((!self.namespaces_gone).then(|| "Active".to_string()))
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &QuotaSpec,
    ) -> Result<(), ClusterError> {
        if self.fail_quota {
            return Err(ClusterError::Api {
                status: 403,
                message: "resourcequotas is forbidden".to_string(),
            });
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("quota {namespace} pods={}", quota.pods));
        Ok(())
    }
}

/// An environment row that never touched the database.
pub fn environment(status: EnvironmentStatus) -> Environment {
    let now = Utc::now();
    Environment {
        id: 7,
        repository_full_name: "acme/web_app".to_string(),
        repository_name: "web_app".to_string(),
        pr_number: 42,
        pr_title: Some("Add billing page".to_string()),
        branch_name: "feature/billing".to_string(),
        commit_sha: "a1b2c3".to_string(),
        namespace: "pr-42-web-app".to_string(),
        environment_url: Some("https://pr-42-web-app.preview.example.com".to_string()),
        status: status.as_str().to_string(),
        installation_id: Some(99),
        owner_id: 1,
        error_message: None,
        head_updated_at: None,
        last_deployed_at: None,
        destroyed_at: None,
        created_at: now,
        updated_at: now,
    }
}

static NEXT_SCHEMA: AtomicUsize = AtomicUsize::new(0);

/// A migrated pool confined to a fresh schema, or `None` without `TEST_DATABASE_URL`.
pub async fn test_pool() -> Option<DbPool> {
    let Ok(base_url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return None;
    };

    let schema = format!(
        "ephemera_test_{}_{}",
        std::process::id(),
        NEXT_SCHEMA.fetch_add(1, Ordering::SeqCst)
    );
    let mut admin = AsyncPgConnection::establish(&base_url)
        .await
        .expect("connect to TEST_DATABASE_URL");
    admin
        .batch_execute(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema}"))
        .await
        .expect("create test schema");

    let sep = if base_url.contains('?') { '&' } else { '?' };
    let url = format!("{base_url}{sep}options=-c%20search_path%3D{schema}");
    let pool = create_pool(&url, 4).expect("test pool");
    let mut conn = pool.get().await.expect("test connection");
    crate::migration::run_migration(&mut conn)
        .await
        .expect("migration");
    Some(pool)
}

pub fn task_context(pool: DbPool, cluster: Arc<dyn ClusterApi>) -> TaskContext {
    let config = Arc::new(AppConfig::for_tests());
    let notifier = GitHubService::from_config(&config).expect("notifier without credentials");
    TaskContext {
        pool,
        cluster,
        notifier: Arc::new(notifier),
        config,
    }
}

/// Insert an environment for `repo` PR `pr` in `status`, with one queued deployment.
pub async fn seed_environment(
    conn: &mut AsyncPgConnection,
    repo_full_name: &str,
    pr: i32,
    status: EnvironmentStatus,
) -> Environment {
    let owner = user_service::get_or_create_user(
        conn,
        NewUser {
            github_id: 1001,
            github_login: "octocat".to_string(),
            email: None,
            avatar_url: None,
        },
    )
    .await
    .unwrap();

    let repo_name = repo_full_name.rsplit('/').next().unwrap_or(repo_full_name);
    let env = environment_service::create_environment(
        conn,
        NewEnvironment {
            repository_full_name: repo_full_name.to_string(),
            repository_name: repo_name.to_string(),
            pr_number: pr,
            pr_title: Some("Seeded".to_string()),
            branch_name: "feature/seeded".to_string(),
            commit_sha: "aaa".to_string(),
            namespace: generate_namespace(repo_name, pr),
            environment_url: None,
            status: EnvironmentStatus::Pending.as_str().to_string(),
            installation_id: None,
            owner_id: owner.id,
            head_updated_at: None,
        },
    )
    .await
    .unwrap();
    deployment_service::create_deployment(conn, env.id, "aaa", None)
        .await
        .unwrap();
    set_status(conn, env.id, status).await
}

pub async fn set_status(
    conn: &mut AsyncPgConnection,
    env_id: i64,
    status: EnvironmentStatus,
) -> Environment {
    diesel::update(environments::table.find(env_id))
        .set(environments::status.eq(status.as_str()))
        .get_result(conn)
        .await
        .unwrap()
}

/// Move `updated_at` back so the sweep treats the record as stale.
pub async fn backdate(conn: &mut AsyncPgConnection, env_id: i64, minutes: i64) -> DateTime<Utc> {
    let then = Utc::now() - chrono::Duration::minutes(minutes);
    diesel::update(environments::table.find(env_id))
        .set(environments::updated_at.eq(then))
        .execute(conn)
        .await
        .unwrap();
    reload(conn, env_id).await.updated_at
}

pub async fn reload(conn: &mut AsyncPgConnection, env_id: i64) -> Environment {
    environment_service::get_environment(conn, env_id)
        .await
        .unwrap()
        .expect("environment exists")
}

/// `(commit_sha, status)` of every deployment, newest first.
pub async fn deployment_history(conn: &mut AsyncPgConnection, env_id: i64) -> Vec<(String, String)> {
    deployments::table
        .filter(deployments::environment_id.eq(env_id))
        .order(deployments::id.desc())
        .load::<Deployment>(conn)
        .await
        .unwrap()
        .into_iter()
        .map(|d| (d.commit_sha, d.status))
        .collect()
}
