//! Task dispatcher: an in-process bounded queue of environment tasks,
//! executed by background workers gated on a semaphore.
//!
//! Tasks run at most once. A failed task records `failed` on the
//! environment and is never retried; a task lost to a crash is closed
//! later by the sweep.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::services::environment_tasks;
use crate::services::github_service::PullRequestNotifier;
use crate::services::kubernetes_service::ClusterApi;

/// Work produced by webhook events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentTask {
    Provision { env_id: i64 },
    Update { env_id: i64, commit_sha: String },
    Destroy { env_id: i64, merged: bool },
}

impl EnvironmentTask {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvironmentTask::Provision { .. } => "provision",
            EnvironmentTask::Update { .. } => "update",
            EnvironmentTask::Destroy { .. } => "destroy",
        }
    }

    pub fn env_id(&self) -> i64 {
        match self {
            EnvironmentTask::Provision { env_id }
            | EnvironmentTask::Update { env_id, .. }
            | EnvironmentTask::Destroy { env_id, .. } => *env_id,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("task queue is full")]
    QueueFull,
    #[error("task dispatcher has shut down")]
    Closed,
}

/// Sending half of the task queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskDispatcher {
    tx: mpsc::Sender<EnvironmentTask>,
}

impl TaskDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EnvironmentTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. A full queue is reported, not awaited.
    pub fn dispatch(&self, task: EnvironmentTask) -> Result<(), DispatchError> {
        let kind = task.kind();
        let env_id = task.env_id();
        match self.tx.try_send(task) {
            Ok(()) => {
                tracing::debug!(env_id, kind, "Task queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                crate::metrics::task_rejected(kind);
                Err(DispatchError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

/// Everything a task needs to reach the database, the cluster and GitHub.
#[derive(Clone)]
pub struct TaskContext {
    pub pool: DbPool,
    pub cluster: Arc<dyn ClusterApi>,
    pub notifier: Arc<dyn PullRequestNotifier>,
    pub config: Arc<AppConfig>,
}

/// Run the dispatcher until every sender is dropped, then drain in-flight tasks.
pub async fn run_dispatcher(ctx: TaskContext, mut rx: mpsc::Receiver<EnvironmentTask>) {
    let permits = Arc::new(Semaphore::new(ctx.config.worker_concurrency.max(1)));
    let mut running = JoinSet::new();

    tracing::info!(
        workers = ctx.config.worker_concurrency,
        "Task dispatcher started"
    );

    while let Some(task) = rx.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ctx = ctx.clone();
        running.spawn(async move {
            let _permit = permit;
            execute(&ctx, task).await;
        });
        while running.try_join_next().is_some() {}
    }

    tracing::info!(in_flight = running.len(), "Task queue closed, draining");
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Environment task panicked: {e}");
        }
    }
    tracing::info!("Task dispatcher stopped");
}

/// Run one task to completion, recording its outcome.
pub async fn execute(ctx: &TaskContext, task: EnvironmentTask) {
    let kind = task.kind();
    let env_id = task.env_id();
    let started = Instant::now();

    let result = match task {
        EnvironmentTask::Provision { env_id } => environment_tasks::provision(ctx, env_id).await,
        EnvironmentTask::Update { env_id, commit_sha } => {
            environment_tasks::update(ctx, env_id, &commit_sha).await
        }
        EnvironmentTask::Destroy { env_id, merged } => {
            environment_tasks::destroy(ctx, env_id, merged).await
        }
    };

    let outcome = match &result {
        Ok(()) => "ok",
        Err(e) => {
            tracing::error!(env_id, kind, "Environment task error: {e:#}");
            "error"
        }
    };
    crate::metrics::task_finished(kind, outcome, started.elapsed());
}
