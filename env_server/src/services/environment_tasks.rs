//! Provision, update and destroy tasks for preview environments.
//!
//! Each task reads the environment fresh by id and only acts when the
//! record is still in the state the task was queued for. GitHub feedback is
//! best-effort and never changes the lifecycle outcome.

use std::collections::BTreeMap;

use crate::events::environment::EnvironmentEvent;
use crate::models::deployment::DeploymentStatus;
use crate::models::environment::Environment;
use crate::services::dispatcher::TaskContext;
use crate::services::github_service::{self, CommitState, PrTarget};
use crate::services::kubernetes_service::{ClusterApi, ClusterError, QuotaSpec};
use crate::services::{deployment_service, environment_service};

pub const MISSING_NAMESPACE: &str = "Namespace no longer exists";

/// Bring a pending environment up: namespace plus resource quota.
pub async fn provision(ctx: &TaskContext, env_id: i64) -> anyhow::Result<()> {
    let env = {
        let mut conn = ctx.pool.get().await?;
        let Some(env) = environment_service::apply_event(
            &mut conn,
            env_id,
            &EnvironmentEvent::ProvisioningStarted,
        )
        .await?
        else {
            tracing::info!(env_id, "Provision skipped: environment no longer pending");
            return Ok(());
        };
        deployment_service::mark_latest(&mut conn, env_id, DeploymentStatus::InProgress, None)
            .await?;
        env
    };

    notify_status(ctx, &env, CommitState::Pending, "Provisioning preview environment").await;

    let created = create_namespace(ctx.cluster.as_ref(), &env, &ctx.config.quota).await;

    let mut conn = ctx.pool.get().await?;
    match created {
        Ok(()) => {
            let ready = environment_service::apply_event(
                &mut conn,
                env_id,
                &EnvironmentEvent::Provisioned,
            )
            .await?;
            let Some(ready) = ready else {
                // Closed or swept while the namespace was being created.
                drop(conn);
                tracing::warn!(
                    env_id,
                    namespace = %env.namespace,
                    "Environment left provisioning mid-task; removing its namespace"
                );
                remove_namespace(ctx.cluster.as_ref(), &env.namespace).await;
                return Ok(());
            };
            deployment_service::mark_latest(&mut conn, env_id, DeploymentStatus::Success, None)
                .await?;
            drop(conn);

            tracing::info!(env_id, namespace = %ready.namespace, "Environment ready");
            notify_status(ctx, &ready, CommitState::Success, "Preview environment ready").await;
            if let Some(url) = &ready.environment_url {
                notify_comment(ctx, &ready, &github_service::ready_comment(url, &ready.namespace))
                    .await;
            }
        }
        Err(e) => {
            let reason = format!("Provisioning failed: {e}");
            let failed = environment_service::apply_event(
                &mut conn,
                env_id,
                &EnvironmentEvent::failed(reason.clone()),
            )
            .await?;
            if failed.is_some() {
                deployment_service::mark_latest(
                    &mut conn,
                    env_id,
                    DeploymentStatus::Failed,
                    Some(&reason),
                )
                .await?;
            }
            drop(conn);

            remove_namespace(ctx.cluster.as_ref(), &env.namespace).await;
            if let Some(failed) = failed {
                notify_status(ctx, &failed, CommitState::Failure, "Preview environment failed")
                    .await;
                notify_comment(
                    ctx,
                    &failed,
                    &github_service::failed_comment(&failed.namespace, &reason),
                )
                .await;
            }
        }
    }
    Ok(())
}

/// Roll a ready environment onto a new commit.
pub async fn update(ctx: &TaskContext, env_id: i64, commit_sha: &str) -> anyhow::Result<()> {
    let env = {
        let mut conn = ctx.pool.get().await?;
        let Some(env) = environment_service::get_environment(&mut conn, env_id).await? else {
            tracing::warn!(env_id, "Update skipped: environment not found");
            return Ok(());
        };
        if let Err(e) = check_transition(&env, &EnvironmentEvent::Updated) {
            tracing::info!(env_id, "Update skipped: {e}");
            return Ok(());
        }
        deployment_service::mark_latest(&mut conn, env_id, DeploymentStatus::InProgress, None)
            .await?;
        env
    };

    tracing::info!(env_id, namespace = %env.namespace, sha = commit_sha, "Updating environment");
    let exists = ctx.cluster.namespace_exists(&env.namespace).await;

    let mut conn = ctx.pool.get().await?;
    let (event, state, description) = match exists {
        Ok(true) => (
            EnvironmentEvent::Updated,
            CommitState::Success,
            "Environment ready for new commits",
        ),
        Ok(false) => (
            EnvironmentEvent::failed(MISSING_NAMESPACE),
            CommitState::Failure,
            "Environment namespace not found",
        ),
        Err(e) => (
            EnvironmentEvent::failed(format!("Namespace check failed: {e}")),
            CommitState::Failure,
            "Environment update failed",
        ),
    };

    let Some(updated) = environment_service::apply_event(&mut conn, env_id, &event).await? else {
        return Ok(());
    };
    let deployment_status = if state == CommitState::Success {
        DeploymentStatus::Success
    } else {
        DeploymentStatus::Failed
    };
    deployment_service::mark_latest(&mut conn, env_id, deployment_status, event.error_message())
        .await?;
    drop(conn);

    notify_status(ctx, &updated, state, description).await;
    Ok(())
}

/// Tear down the namespace of a closed PR.
pub async fn destroy(ctx: &TaskContext, env_id: i64, merged: bool) -> anyhow::Result<()> {
    let env = {
        let mut conn = ctx.pool.get().await?;
        let Some(env) = environment_service::get_environment(&mut conn, env_id).await? else {
            tracing::warn!(env_id, "Destroy skipped: environment not found");
            return Ok(());
        };
        if let Err(e) = check_transition(&env, &EnvironmentEvent::Destroyed) {
            tracing::info!(env_id, "Destroy skipped: {e}");
            return Ok(());
        }
        env
    };

    let deleted = match ctx.cluster.delete_namespace(&env.namespace).await {
        Err(ClusterError::Disabled) => {
            tracing::info!(env_id, "Kubernetes disabled; no namespace to delete");
            Ok(())
        }
        other => other,
    };

    let mut conn = ctx.pool.get().await?;
    match deleted {
        Ok(()) => {
            let destroyed =
                environment_service::apply_event(&mut conn, env_id, &EnvironmentEvent::Destroyed)
                    .await?;
            deployment_service::close_unfinished(&mut conn, env_id, None, "Pull request closed")
                .await?;
            drop(conn);

            if let Some(destroyed) = destroyed {
                notify_comment(
                    ctx,
                    &destroyed,
                    &github_service::destroyed_comment(&destroyed.namespace, merged),
                )
                .await;
            }
        }
        Err(e) => {
            let reason = format!("Namespace deletion failed: {e}");
            environment_service::apply_event(&mut conn, env_id, &EnvironmentEvent::failed(&reason))
                .await?;
            deployment_service::close_unfinished(&mut conn, env_id, None, &reason).await?;
        }
    }
    Ok(())
}

/// Whether the task's completion event is still legal for the record.
fn check_transition(env: &Environment, event: &EnvironmentEvent) -> anyhow::Result<()> {
    let current = env.lifecycle_status()?;
    event.apply(current)?;
    Ok(())
}

/// Labels stamped on every preview namespace.
pub fn namespace_labels(env: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "ephemera".to_string()),
        ("pr-number".to_string(), env.pr_number.to_string()),
        (
            "repository".to_string(),
            label_value(&env.repository_full_name),
        ),
        ("environment-id".to_string(), env.id.to_string()),
    ])
}

/// Label values allow `[A-Za-z0-9._-]`, at most 63 chars, alphanumeric at both ends.
fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '.'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

async fn create_namespace(
    cluster: &dyn ClusterApi,
    env: &Environment,
    quota: &QuotaSpec,
) -> Result<(), ClusterError> {
    cluster
        .create_namespace(&env.namespace, &namespace_labels(env))
        .await?;
    cluster.create_resource_quota(&env.namespace, quota).await?;
    Ok(())
}

/// Best-effort namespace removal.
pub async fn remove_namespace(cluster: &dyn ClusterApi, namespace: &str) -> bool {
    match cluster.delete_namespace(namespace).await {
        Ok(()) => true,
        Err(ClusterError::Disabled) => true,
        Err(e) => {
            tracing::warn!(namespace, "Failed to delete namespace: {e}");
            false
        }
    }
}

fn pr_target(env: &Environment) -> PrTarget {
    PrTarget {
        installation_id: env.installation_id,
        repo_full_name: env.repository_full_name.clone(),
        pr_number: env.pr_number,
    }
}

async fn notify_status(ctx: &TaskContext, env: &Environment, state: CommitState, description: &str) {
    if let Err(e) = ctx
        .notifier
        .post_status(
            &pr_target(env),
            &env.commit_sha,
            state,
            description,
            env.environment_url.as_deref(),
        )
        .await
    {
        tracing::warn!(env_id = env.id, %state, "Failed to post commit status: {e}");
    }
}

async fn notify_comment(ctx: &TaskContext, env: &Environment, body: &str) {
    if let Err(e) = ctx.notifier.post_comment(&pr_target(env), body).await {
        tracing::warn!(env_id = env.id, "Failed to post PR comment: {e}");
    }
}
