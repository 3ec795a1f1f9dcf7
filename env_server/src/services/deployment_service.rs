//! Deployment history for preview environments.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::deployment::{Deployment, DeploymentStatus, NewDeployment};
use crate::schema::deployments;

/// Append a queued deployment for `commit_sha`.
pub async fn create_deployment(
    conn: &mut AsyncPgConnection,
    environment_id: i64,
    commit_sha: &str,
    commit_message: Option<String>,
) -> anyhow::Result<Deployment> {
    let new_deployment = NewDeployment {
        environment_id,
        commit_sha: commit_sha.to_string(),
        commit_message,
        status: DeploymentStatus::Queued.as_str().to_string(),
    };

    let result = diesel::insert_into(deployments::table)
        .values(&new_deployment)
        .get_result::<Deployment>(conn)
        .await?;

    tracing::info!(
        deployment_id = result.id,
        env_id = environment_id,
        sha = %commit_sha,
        "Deployment queued"
    );
    Ok(result)
}

/// Deployments of an environment, newest first.
pub async fn list_for_environment(
    conn: &mut AsyncPgConnection,
    environment_id: i64,
    limit: i64,
) -> anyhow::Result<Vec<Deployment>> {
    let results = deployments::table
        .filter(deployments::environment_id.eq(environment_id))
        .order(deployments::id.desc())
        .limit(limit)
        .load::<Deployment>(conn)
        .await?;
    Ok(results)
}

/// Move the latest unfinished deployment of an environment to `status`.
///
/// `in_progress` stamps `started_at`; finished states stamp `completed_at`.
/// Returns `None` when there is no unfinished deployment.
pub async fn mark_latest(
    conn: &mut AsyncPgConnection,
    environment_id: i64,
    status: DeploymentStatus,
    error_message: Option<&str>,
) -> anyhow::Result<Option<Deployment>> {
    let unfinished = [
        DeploymentStatus::Queued.as_str(),
        DeploymentStatus::InProgress.as_str(),
    ];
    let latest: Option<i64> = deployments::table
        .filter(deployments::environment_id.eq(environment_id))
        .filter(deployments::status.eq_any(unfinished))
        .order(deployments::id.desc())
        .select(deployments::id)
        .first(conn)
        .await
        .optional()?;

    let Some(deployment_id) = latest else {
        return Ok(None);
    };

    let now = Utc::now();
    let target = deployments::table.find(deployment_id);
    let result = if status.is_finished() {
        close_unfinished(conn, environment_id, Some(deployment_id), "Superseded by a newer commit")
            .await?;
        diesel::update(target)
            .set((
                deployments::status.eq(status.as_str()),
                deployments::completed_at.eq(now),
                deployments::error_message.eq(error_message),
                deployments::updated_at.eq(now),
            ))
            .get_result::<Deployment>(conn)
            .await?
    } else {
        diesel::update(target)
            .set((
                deployments::status.eq(status.as_str()),
                deployments::started_at.eq(now),
                deployments::updated_at.eq(now),
            ))
            .get_result::<Deployment>(conn)
            .await?
    };

    tracing::debug!(
        deployment_id,
        env_id = environment_id,
        status = %status,
        "Deployment updated"
    );
    Ok(Some(result))
}

/// Fail every queued or in-progress deployment of an environment, except `keep`.
pub async fn close_unfinished(
    conn: &mut AsyncPgConnection,
    environment_id: i64,
    keep: Option<i64>,
    reason: &str,
) -> anyhow::Result<usize> {
    let unfinished = [
        DeploymentStatus::Queued.as_str(),
        DeploymentStatus::InProgress.as_str(),
    ];
    let now = Utc::now();
    let closed = diesel::update(
        deployments::table
            .filter(deployments::environment_id.eq(environment_id))
            .filter(deployments::status.eq_any(unfinished))
            .filter(deployments::id.ne(keep.unwrap_or(0))),
    )
    .set((
        deployments::status.eq(DeploymentStatus::Failed.as_str()),
        deployments::completed_at.eq(now),
        deployments::error_message.eq(reason),
        deployments::updated_at.eq(now),
    ))
    .execute(conn)
    .await?;

    if closed > 0 {
        tracing::debug!(env_id = environment_id, closed, reason, "Closed unfinished deployments");
    }
    Ok(closed)
}
