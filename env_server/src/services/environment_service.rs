//! Preview environment records and guarded status transitions.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::events::environment::EnvironmentEvent;
use crate::models::environment::{
    disambiguate_namespace, Environment, EnvironmentStatus, NewEnvironment,
};
use crate::schema::environments;

/// Postgres name of the `UNIQUE` constraint on `environments.namespace`.
const NAMESPACE_CONSTRAINT: &str = "environments_namespace_key";

/// PR head fields refreshed by open/reopen/synchronize events.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = environments)]
pub struct HeadUpdate {
    pub commit_sha: String,
    pub branch_name: String,
    pub pr_title: Option<String>,
    pub head_updated_at: Option<DateTime<Utc>>,
    pub installation_id: Option<i64>,
}

#[derive(AsChangeset)]
#[diesel(table_name = environments)]
struct StatusChange {
    status: String,
    updated_at: DateTime<Utc>,
    error_message: Option<Option<String>>,
    last_deployed_at: Option<DateTime<Utc>>,
    destroyed_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    fn for_event(event: &EnvironmentEvent, now: DateTime<Utc>) -> Self {
        let target = event.target();
        Self {
            status: target.as_str().to_string(),
            updated_at: now,
            error_message: match event {
                EnvironmentEvent::Failed { reason } => Some(Some(reason.clone())),
                EnvironmentEvent::Provisioned | EnvironmentEvent::Updated => Some(None),
                _ => None,
            },
            last_deployed_at: (target == EnvironmentStatus::Ready).then_some(now),
            destroyed_at: (target == EnvironmentStatus::Destroyed).then_some(now),
        }
    }
}

fn status_strs(statuses: &[EnvironmentStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

/// Get an environment by ID.
pub async fn get_environment(
    conn: &mut AsyncPgConnection,
    env_id: i64,
) -> anyhow::Result<Option<Environment>> {
    let result = environments::table
        .find(env_id)
        .first::<Environment>(conn)
        .await
        .optional()?;
    Ok(result)
}

/// Get the environment for a repository + PR number.
pub async fn find_by_pr(
    conn: &mut AsyncPgConnection,
    repository_full_name: &str,
    pr_number: i32,
) -> anyhow::Result<Option<Environment>> {
    let result = environments::table
        .filter(environments::repository_full_name.eq(repository_full_name))
        .filter(environments::pr_number.eq(pr_number))
        .first::<Environment>(conn)
        .await
        .optional()?;
    Ok(result)
}

/// Get the environment owning a Kubernetes namespace.
pub async fn find_by_namespace(
    conn: &mut AsyncPgConnection,
    namespace: &str,
) -> anyhow::Result<Option<Environment>> {
    let result = environments::table
        .filter(environments::namespace.eq(namespace))
        .first::<Environment>(conn)
        .await
        .optional()?;
    Ok(result)
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentFilter {
    pub repository: Option<String>,
    pub active_only: bool,
    pub limit: i64,
}

/// List environments, newest first.
pub async fn list_environments(
    conn: &mut AsyncPgConnection,
    filter: &EnvironmentFilter,
) -> anyhow::Result<Vec<Environment>> {
    let mut query = environments::table.into_boxed();
    if let Some(repo) = &filter.repository {
        query = query.filter(environments::repository_full_name.eq(repo.clone()));
    }
    if filter.active_only {
        let active: Vec<EnvironmentStatus> = EnvironmentStatus::ALL
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        query = query.filter(environments::status.eq_any(status_strs(&active)));
    }
    let results = query
        .order(environments::id.desc())
        .limit(filter.limit)
        .load::<Environment>(conn)
        .await?;
    Ok(results)
}

/// Environments currently in `status`.
pub async fn list_by_status(
    conn: &mut AsyncPgConnection,
    status: EnvironmentStatus,
) -> anyhow::Result<Vec<Environment>> {
    let results = environments::table
        .filter(environments::status.eq(status.as_str()))
        .order(environments::id.asc())
        .load::<Environment>(conn)
        .await?;
    Ok(results)
}

/// Environments that have sat in `status` since before `cutoff`.
pub async fn list_stale(
    conn: &mut AsyncPgConnection,
    status: EnvironmentStatus,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<Vec<Environment>> {
    let results = environments::table
        .filter(environments::status.eq(status.as_str()))
        .filter(environments::updated_at.lt(cutoff))
        .order(environments::id.asc())
        .load::<Environment>(conn)
        .await?;
    Ok(results)
}

/// Count environments that hold (or are about to hold) a namespace.
pub async fn count_active(conn: &mut AsyncPgConnection) -> anyhow::Result<i64> {
    let active: Vec<EnvironmentStatus> = EnvironmentStatus::ALL
        .into_iter()
        .filter(|s| s.is_active())
        .collect();
    let count = environments::table
        .filter(environments::status.eq_any(status_strs(&active)))
        .count()
        .get_result(conn)
        .await?;
    Ok(count)
}

/// Create a new environment record.
pub async fn create_environment(
    conn: &mut AsyncPgConnection,
    new_env: NewEnvironment,
) -> anyhow::Result<Environment> {
    let result = diesel::insert_into(environments::table)
        .values(&new_env)
        .get_result::<Environment>(conn)
        .await?;

    crate::metrics::environment_status_changed(EnvironmentStatus::Pending.as_str());
    tracing::info!(
        env_id = result.id,
        namespace = %result.namespace,
        repo = %result.repository_full_name,
        pr = result.pr_number,
        "Environment created"
    );
    Ok(result)
}

/// Create an environment under its plain namespace, falling back once to the
/// repository-suffixed name when another repository already holds it.
pub async fn create_with_namespace(
    conn: &mut AsyncPgConnection,
    mut new_env: NewEnvironment,
) -> anyhow::Result<Environment> {
    match create_environment(conn, new_env.clone()).await {
        Err(e) if is_namespace_conflict(&e) => {
            let taken = std::mem::take(&mut new_env.namespace);
            new_env.namespace = disambiguate_namespace(&taken, &new_env.repository_full_name);
            tracing::info!(
                taken = %taken,
                namespace = %new_env.namespace,
                repo = %new_env.repository_full_name,
                "Namespace owned by another repository; using suffixed name"
            );
            create_environment(conn, new_env).await
        }
        other => other,
    }
}

fn is_namespace_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<DieselError>(),
        Some(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info))
            if info.constraint_name() == Some(NAMESPACE_CONSTRAINT)
    )
}

/// Apply a lifecycle event as a compare-and-set on the current status.
///
/// Returns the updated record, or `None` when the record is missing or no
/// longer in a state the event may leave from.
pub async fn apply_event(
    conn: &mut AsyncPgConnection,
    env_id: i64,
    event: &EnvironmentEvent,
) -> anyhow::Result<Option<Environment>> {
    let change = StatusChange::for_event(event, Utc::now());
    let result = diesel::update(
        environments::table
            .filter(environments::id.eq(env_id))
            .filter(environments::status.eq_any(status_strs(event.allowed_from()))),
    )
    .set(&change)
    .get_result::<Environment>(conn)
    .await
    .optional()?;

    match &result {
        Some(env) => {
            crate::metrics::environment_status_changed(&env.status);
            tracing::info!(
                env_id,
                namespace = %env.namespace,
                status = %env.status,
                error = event.error_message(),
                "Environment status changed"
            );
        }
        None => {
            tracing::warn!(
                env_id,
                target = %event.target(),
                "Transition skipped: environment not in an allowed state"
            );
        }
    }
    Ok(result)
}

/// Restart the lifecycle of a failed or destroyed environment for a reopened PR.
pub async fn requeue(
    conn: &mut AsyncPgConnection,
    env_id: i64,
    head: &HeadUpdate,
) -> anyhow::Result<Option<Environment>> {
    let event = EnvironmentEvent::Requeued;
    let result = diesel::update(
        environments::table
            .filter(environments::id.eq(env_id))
            .filter(environments::status.eq_any(status_strs(event.allowed_from()))),
    )
    .set((
        head,
        environments::status.eq(event.target().as_str()),
        environments::error_message.eq(None::<String>),
        environments::destroyed_at.eq(None::<DateTime<Utc>>),
        environments::updated_at.eq(Utc::now()),
    ))
    .get_result::<Environment>(conn)
    .await
    .optional()?;

    if let Some(env) = &result {
        crate::metrics::environment_status_changed(&env.status);
        tracing::info!(env_id, namespace = %env.namespace, "Environment requeued");
    }
    Ok(result)
}

/// Record a new PR head, refusing to move backwards.
///
/// The update only applies when the record is still live, the SHA differs,
/// and the event is not older than the last accepted one. `updated_at` is
/// left alone: it is the sweep's clock for time spent in a status.
pub async fn record_head(
    conn: &mut AsyncPgConnection,
    env_id: i64,
    head: &HeadUpdate,
) -> anyhow::Result<Option<Environment>> {
    let closed = status_strs(&[EnvironmentStatus::Destroying, EnvironmentStatus::Destroyed]);
    let live = environments::table
        .filter(environments::id.eq(env_id))
        .filter(environments::status.ne_all(closed))
        .filter(environments::commit_sha.ne(head.commit_sha.clone()));
    let result = match head.head_updated_at {
        Some(ts) => {
            let not_older = environments::head_updated_at
                .is_null()
                .or(environments::head_updated_at.le(ts));
            diesel::update(live.filter(not_older))
                .set(head)
                .get_result::<Environment>(conn)
                .await
                .optional()?
        }
        None => {
            diesel::update(live)
                .set(head)
                .get_result::<Environment>(conn)
                .await
                .optional()?
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::test_support::{backdate, reload, seed_environment, set_status, test_pool};

    fn head(sha: &str, at: Option<DateTime<Utc>>) -> HeadUpdate {
        HeadUpdate {
            commit_sha: sha.to_string(),
            branch_name: "feature/seeded".to_string(),
            pr_title: Some("Seeded".to_string()),
            head_updated_at: at,
            installation_id: None,
        }
    }

    #[test]
    fn ready_transition_stamps_deploy_time_and_clears_error() {
        let now = Utc::now();
        let change = StatusChange::for_event(&EnvironmentEvent::Provisioned, now);
        assert_eq!(change.status, "ready");
        assert_eq!(change.last_deployed_at, Some(now));
        assert_eq!(change.error_message, Some(None));
        assert_eq!(change.destroyed_at, None);
    }

    #[test]
    fn failure_records_reason_only() {
        let now = Utc::now();
        let change = StatusChange::for_event(&EnvironmentEvent::failed("quota denied"), now);
        assert_eq!(change.status, "failed");
        assert_eq!(change.error_message, Some(Some("quota denied".to_string())));
        assert_eq!(change.last_deployed_at, None);
    }

    #[test]
    fn destroyed_transition_stamps_destroy_time() {
        let now = Utc::now();
        let change = StatusChange::for_event(&EnvironmentEvent::Destroyed, now);
        assert_eq!(change.destroyed_at, Some(now));
        // Error text from an earlier failure is kept for the record.
        assert_eq!(change.error_message, None);
    }

    #[tokio::test]
    async fn transitions_only_apply_from_allowed_states() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();
        let env = seed_environment(&mut conn, "acme/api", 1, EnvironmentStatus::Pending).await;

        let skipped = apply_event(&mut conn, env.id, &EnvironmentEvent::Provisioned)
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(reload(&mut conn, env.id).await.status, "pending");

        let started = apply_event(&mut conn, env.id, &EnvironmentEvent::ProvisioningStarted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.status, "provisioning");

        // A second worker for the same task loses the race.
        let again = apply_event(&mut conn, env.id, &EnvironmentEvent::ProvisioningStarted)
            .await
            .unwrap();
        assert!(again.is_none());

        let ready = apply_event(&mut conn, env.id, &EnvironmentEvent::Provisioned)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.status, "ready");
        assert!(ready.last_deployed_at.is_some());

        assert!(apply_event(&mut conn, 999_999, &EnvironmentEvent::Destroyed)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn requeue_clears_the_previous_outcome() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();
        let env = seed_environment(&mut conn, "acme/api", 2, EnvironmentStatus::Provisioning).await;
        apply_event(&mut conn, env.id, &EnvironmentEvent::failed("quota denied"))
            .await
            .unwrap()
            .unwrap();

        let requeued = requeue(&mut conn, env.id, &head("bbb", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.status, "pending");
        assert_eq!(requeued.commit_sha, "bbb");
        assert_eq!(requeued.error_message, None);

        // Only ended records can be requeued.
        assert!(requeue(&mut conn, env.id, &head("ccc", None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn head_never_moves_backwards() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();
        let env = seed_environment(&mut conn, "acme/api", 3, EnvironmentStatus::Ready).await;
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let moved = record_head(&mut conn, env.id, &head("bbb", Some(noon)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.commit_sha, "bbb");
        assert_eq!(moved.head_updated_at, Some(noon));

        // An older event delivered late is refused by the UPDATE itself.
        let earlier = noon - chrono::Duration::minutes(5);
        let stale = record_head(&mut conn, env.id, &head("ccc", Some(earlier)))
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(reload(&mut conn, env.id).await.commit_sha, "bbb");

        // Same SHA is a no-op.
        let later = noon + chrono::Duration::minutes(5);
        assert!(record_head(&mut conn, env.id, &head("bbb", Some(later)))
            .await
            .unwrap()
            .is_none());

        let newer = record_head(&mut conn, env.id, &head("ddd", Some(later)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newer.commit_sha, "ddd");

        set_status(&mut conn, env.id, EnvironmentStatus::Destroying).await;
        assert!(record_head(&mut conn, env.id, &head("eee", None))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn new_head_keeps_the_stale_clock_running() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();
        let env = seed_environment(&mut conn, "acme/api", 4, EnvironmentStatus::Pending).await;
        let stuck_since = backdate(&mut conn, env.id, 45).await;

        record_head(&mut conn, env.id, &head("bbb", None))
            .await
            .unwrap()
            .unwrap();

        let after = reload(&mut conn, env.id).await;
        assert_eq!(after.commit_sha, "bbb");
        assert_eq!(after.updated_at, stuck_since);
        let cutoff = Utc::now() - chrono::Duration::minutes(30);
        let stale = list_stale(&mut conn, EnvironmentStatus::Pending, cutoff)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn namespace_held_by_another_repository_gets_a_suffix() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();
        let first = seed_environment(&mut conn, "acme/app", 1, EnvironmentStatus::Ready).await;
        assert_eq!(first.namespace, "pr-1-app");

        let mut new_env = NewEnvironment {
            repository_full_name: "other/app".to_string(),
            repository_name: "app".to_string(),
            pr_number: 1,
            pr_title: None,
            branch_name: "main".to_string(),
            commit_sha: "fff".to_string(),
            namespace: "pr-1-app".to_string(),
            environment_url: None,
            status: EnvironmentStatus::Pending.as_str().to_string(),
            installation_id: None,
            owner_id: first.owner_id,
            head_updated_at: None,
        };
        let second = create_with_namespace(&mut conn, new_env.clone()).await.unwrap();
        assert_eq!(second.namespace, disambiguate_namespace("pr-1-app", "other/app"));

        // A conflict on (repository, PR) is not a namespace clash and is surfaced.
        new_env.namespace = "pr-1-elsewhere".to_string();
        let err = create_with_namespace(&mut conn, new_env).await.unwrap_err();
        assert!(!is_namespace_conflict(&err));
    }

    #[tokio::test]
    async fn listing_filters_by_repository_and_activity() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let mut conn = pool.get().await.unwrap();
        seed_environment(&mut conn, "acme/api", 1, EnvironmentStatus::Ready).await;
        seed_environment(&mut conn, "acme/api", 2, EnvironmentStatus::Destroyed).await;
        seed_environment(&mut conn, "acme/web", 1, EnvironmentStatus::Pending).await;

        let filter = EnvironmentFilter {
            repository: Some("acme/api".to_string()),
            active_only: true,
            limit: 100,
        };
        let found = list_environments(&mut conn, &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pr_number, 1);

        assert_eq!(count_active(&mut conn).await.unwrap(), 2);
        let by_ns = find_by_namespace(&mut conn, "pr-1-web").await.unwrap().unwrap();
        assert_eq!(by_ns.repository_full_name, "acme/web");
    }
}
