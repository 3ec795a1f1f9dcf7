//! Periodic sweep for environments stuck in a transient state, and for
//! ready environments whose namespace vanished.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::events::environment::EnvironmentEvent;
use crate::models::environment::EnvironmentStatus;
use crate::services::dispatcher::TaskContext;
use crate::services::environment_tasks::{remove_namespace, MISSING_NAMESPACE};
use crate::services::{delivery_service, deployment_service, environment_service};

pub const STUCK_PROVISIONING: &str = "Environment stuck in provisioning state";
pub const STUCK_UPDATING: &str = "Environment stuck in updating state";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub provisioning_stuck: usize,
    pub updating_stuck: usize,
    pub destroying_stuck: usize,
    pub missing_namespace: usize,
    /// Records actually moved to a closing state.
    pub cleaned: usize,
    /// Webhook delivery ids past their retention.
    pub deliveries_pruned: usize,
}

impl SweepReport {
    pub fn found(&self) -> usize {
        self.provisioning_stuck + self.updating_stuck + self.destroying_stuck + self.missing_namespace
    }
}

/// Run the sweep loop forever. Spawned as a background tokio task.
pub async fn run_sweeper(ctx: TaskContext) {
    let interval = Duration::from_secs(ctx.config.sweep_interval_secs);
    tracing::info!(
        interval_secs = ctx.config.sweep_interval_secs,
        stale_after_mins = ctx.config.stale_after_mins,
        "Environment sweeper started"
    );

    loop {
        match sweep_once(&ctx).await {
            Ok(report) if report.found() > 0 || report.deliveries_pruned > 0 => {
                tracing::info!(
                    provisioning_stuck = report.provisioning_stuck,
                    updating_stuck = report.updating_stuck,
                    destroying_stuck = report.destroying_stuck,
                    missing_namespace = report.missing_namespace,
                    cleaned = report.cleaned,
                    deliveries_pruned = report.deliveries_pruned,
                    "Sweep finished"
                );
            }
            Ok(_) => tracing::debug!("Sweep found nothing stale"),
            Err(e) => tracing::error!("Sweep error: {e:#}"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// One pass over every stale or orphaned environment.
pub async fn sweep_once(ctx: &TaskContext) -> anyhow::Result<SweepReport> {
    let cutoff = Utc::now() - chrono::Duration::minutes(ctx.config.stale_after_mins);
    let mut report = SweepReport::default();
    let mut conn = ctx.pool.get().await?;

    for status in [EnvironmentStatus::Pending, EnvironmentStatus::Provisioning] {
        for env in environment_service::list_stale(&mut conn, status, cutoff).await? {
            report.provisioning_stuck += 1;
            remove_namespace(ctx.cluster.as_ref(), &env.namespace).await;
            let failed = environment_service::apply_event(
                &mut conn,
                env.id,
                &EnvironmentEvent::failed(STUCK_PROVISIONING),
            )
            .await?;
            if failed.is_some() {
                deployment_service::close_unfinished(&mut conn, env.id, None, STUCK_PROVISIONING)
                    .await?;
                report.cleaned += 1;
            }
        }
    }

    for env in environment_service::list_stale(&mut conn, EnvironmentStatus::Updating, cutoff).await? {
        report.updating_stuck += 1;
        let failed = environment_service::apply_event(
            &mut conn,
            env.id,
            &EnvironmentEvent::failed(STUCK_UPDATING),
        )
        .await?;
        if failed.is_some() {
            deployment_service::close_unfinished(&mut conn, env.id, None, STUCK_UPDATING).await?;
            report.cleaned += 1;
        }
    }

    for env in
        environment_service::list_stale(&mut conn, EnvironmentStatus::Destroying, cutoff).await?
    {
        report.destroying_stuck += 1;
        if !remove_namespace(ctx.cluster.as_ref(), &env.namespace).await {
            continue;
        }
        let destroyed =
            environment_service::apply_event(&mut conn, env.id, &EnvironmentEvent::Destroyed)
                .await?;
        if destroyed.is_some() {
            report.cleaned += 1;
        }
    }

    if ctx.config.sweep_check_ready && ctx.cluster.is_enabled() {
        for env in environment_service::list_by_status(&mut conn, EnvironmentStatus::Ready).await? {
            match ctx.cluster.namespace_exists(&env.namespace).await {
                Ok(true) => {}
                Ok(false) => {
                    report.missing_namespace += 1;
                    let failed = environment_service::apply_event(
                        &mut conn,
                        env.id,
                        &EnvironmentEvent::failed(MISSING_NAMESPACE),
                    )
                    .await?;
                    if failed.is_some() {
                        report.cleaned += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        env_id = env.id,
                        namespace = %env.namespace,
                        "Namespace check failed during sweep: {e}"
                    );
                }
            }
        }
    }

    let retention = Utc::now() - chrono::Duration::days(ctx.config.delivery_retention_days);
    report.deliveries_pruned = delivery_service::prune_deliveries(&mut conn, retention).await?;

    let active = environment_service::count_active(&mut conn).await?;
    crate::metrics::active_environments(active);
    crate::metrics::sweep_completed(&report);
    Ok(report)
}
