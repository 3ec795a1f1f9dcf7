//! GitHub webhook handler: receives pull request events and drives
//! environment lifecycles.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use chrono::{DateTime, Utc};
use diesel_async::AsyncPgConnection;
use serde_json::{json, Value};

use crate::events::environment::EnvironmentEvent;
use crate::events::github::{PullRequestAction, PullRequestEvent};
use crate::models::environment::{generate_namespace, Environment, EnvironmentStatus, NewEnvironment};
use crate::routes::AppState;
use crate::services::dispatcher::{DispatchError, EnvironmentTask};
use crate::services::{
    delivery_service, deployment_service, environment_service, github_service, user_service,
};

type WebhookResponse = Result<(StatusCode, Json<Value>), StatusCode>;

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(state: &AppState, headers: &HeaderMap, body: Bytes) -> WebhookResponse {
    let signature = header(headers, "x-hub-signature-256").unwrap_or("");
    if !github_service::validate_signature(&state.config.github_webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let Some(delivery_id) = header(headers, "x-github-delivery") else {
        tracing::warn!("Webhook without delivery id");
        return Err(StatusCode::BAD_REQUEST);
    };
    let event_type = header(headers, "x-github-event").unwrap_or("unknown");

    let payload: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let first_seen = delivery_service::record_delivery(&mut conn, delivery_id, event_type)
        .await
        .map_err(internal("record delivery"))?;
    if !first_seen {
        return Ok((StatusCode::OK, Json(json!({ "status": "duplicate" }))));
    }

    let response = route_event(state, &mut conn, event_type, delivery_id, payload).await;
    if let Err(status) = &response {
        // Let GitHub's redelivery of this id be processed again.
        tracing::warn!(delivery_id, %status, "Webhook processing failed; releasing delivery id");
        if let Err(e) = delivery_service::forget_delivery(&mut conn, delivery_id).await {
            tracing::error!(delivery_id, "Failed to release delivery id: {e:#}");
        }
    }
    response
}

async fn route_event(
    state: &AppState,
    conn: &mut AsyncPgConnection,
    event_type: &str,
    delivery_id: &str,
    payload: Value,
) -> WebhookResponse {
    match event_type {
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            Ok((StatusCode::OK, Json(json!({ "status": "pong" }))))
        }
        "pull_request" => {
            let event: PullRequestEvent = serde_json::from_value(payload).map_err(|e| {
                tracing::warn!(delivery_id, "Malformed pull_request payload: {e}");
                StatusCode::BAD_REQUEST
            })?;
            handle_pull_request(state, conn, &event).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "received",
                    "event": event_type,
                    "action": event.action,
                    "pr": event.number,
                    "delivery_id": delivery_id,
                })),
            ))
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))))
        }
    }
}

async fn handle_pull_request(
    state: &AppState,
    conn: &mut AsyncPgConnection,
    event: &PullRequestEvent,
) -> Result<(), StatusCode> {
    tracing::info!(
        repo = %event.repository.full_name,
        pr = event.number,
        action = %event.action,
        sha = %event.head_sha(),
        "Pull request event"
    );

    match event.kind() {
        PullRequestAction::Open => handle_open(state, conn, event).await,
        PullRequestAction::Synchronize => handle_synchronize(state, conn, event).await,
        PullRequestAction::Close => handle_close(state, conn, event).await,
        PullRequestAction::Other => {
            tracing::debug!(action = %event.action, "Ignoring pull request action");
            Ok(())
        }
    }
}

/// What an opened/reopened PR does to its (possibly absent) environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenDecision {
    Create,
    Requeue,
    /// Still pending: queue the provision task again.
    Resume,
    Skip,
}

pub fn open_decision(existing: Option<&Environment>) -> OpenDecision {
    match existing.map(Environment::lifecycle_status) {
        None => OpenDecision::Create,
        Some(Ok(EnvironmentStatus::Pending)) => OpenDecision::Resume,
        Some(Ok(status)) if EnvironmentEvent::Requeued.permits(status) => OpenDecision::Requeue,
        Some(_) => OpenDecision::Skip,
    }
}

async fn handle_open(
    state: &AppState,
    conn: &mut AsyncPgConnection,
    event: &PullRequestEvent,
) -> Result<(), StatusCode> {
    let repo = &event.repository;
    let existing = environment_service::find_by_pr(conn, &repo.full_name, event.number)
        .await
        .map_err(internal("find environment"))?;

    let env = match open_decision(existing.as_ref()) {
        OpenDecision::Create => match create_environment(state, conn, event).await? {
            Some(env) => env,
            None => return Ok(()),
        },
        OpenDecision::Requeue => {
            let Some(current) = existing else {
                return Ok(());
            };
            let requeued = environment_service::requeue(conn, current.id, &event.head_update())
                .await
                .map_err(internal("requeue environment"))?;
            match requeued {
                Some(env) => env,
                None => return Ok(()),
            }
        }
        OpenDecision::Resume => {
            let Some(current) = existing else {
                return Ok(());
            };
            tracing::info!(env_id = current.id, "Environment still pending; queueing provision");
            return dispatch(state, EnvironmentTask::Provision { env_id: current.id });
        }
        OpenDecision::Skip => {
            if let Some(current) = existing {
                tracing::info!(
                    env_id = current.id,
                    status = %current.status,
                    "Environment already live; ignoring open"
                );
            }
            return Ok(());
        }
    };

    deployment_service::create_deployment(conn, env.id, event.head_sha(), None)
        .await
        .map_err(internal("create deployment"))?;
    dispatch(state, EnvironmentTask::Provision { env_id: env.id })
}

async fn create_environment(
    state: &AppState,
    conn: &mut AsyncPgConnection,
    event: &PullRequestEvent,
) -> Result<Option<Environment>, StatusCode> {
    let repo = &event.repository;
    let owner = user_service::get_or_create_user(conn, event.author())
        .await
        .map_err(internal("upsert user"))?;

    let head = event.head_update();
    let new_env = NewEnvironment {
        repository_full_name: repo.full_name.clone(),
        repository_name: repo.name.clone(),
        pr_number: event.number,
        pr_title: head.pr_title,
        branch_name: head.branch_name,
        commit_sha: head.commit_sha,
        namespace: generate_namespace(&repo.name, event.number),
        environment_url: Some(github_service::environment_url(
            event.number,
            &repo.name,
            &state.config.base_domain,
        )),
        status: EnvironmentStatus::Pending.as_str().to_string(),
        installation_id: head.installation_id,
        owner_id: owner.id,
        head_updated_at: head.head_updated_at,
    };

    match environment_service::create_with_namespace(conn, new_env).await {
        Ok(env) => Ok(Some(env)),
        Err(e) => {
            // A concurrent delivery for the same PR may have won the insert.
            let raced = environment_service::find_by_pr(conn, &repo.full_name, event.number)
                .await
                .map_err(internal("find environment"))?;
            if raced.is_some() {
                tracing::info!(pr = event.number, "Environment created concurrently; skipping");
                Ok(None)
            } else {
                tracing::error!("Failed to create environment: {e}");
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Record,
    /// Head already recorded and the update never reached a worker.
    Resume,
    Ignore(&'static str),
}

/// Whether a synchronize event may move the recorded head forward.
pub fn sync_decision(
    env: &Environment,
    sha: &str,
    updated_at: Option<DateTime<Utc>>,
) -> SyncDecision {
    match env.lifecycle_status() {
        Ok(EnvironmentStatus::Destroying | EnvironmentStatus::Destroyed) => {
            return SyncDecision::Ignore("environment closing")
        }
        Err(_) => return SyncDecision::Ignore("unknown status"),
        Ok(_) => {}
    }
    if env.commit_sha == sha {
        return match env.lifecycle_status() {
            Ok(EnvironmentStatus::Updating) => SyncDecision::Resume,
            _ => SyncDecision::Ignore("head unchanged"),
        };
    }
    if let (Some(stored), Some(incoming)) = (env.head_updated_at, updated_at) {
        if incoming < stored {
            return SyncDecision::Ignore("out-of-order event");
        }
    }
    SyncDecision::Record
}

async fn handle_synchronize(
    state: &AppState,
    conn: &mut AsyncPgConnection,
    event: &PullRequestEvent,
) -> Result<(), StatusCode> {
    let existing =
        environment_service::find_by_pr(conn, &event.repository.full_name, event.number)
            .await
            .map_err(internal("find environment"))?;
    let Some(env) = existing else {
        tracing::debug!(pr = event.number, "No environment for synchronized PR");
        return Ok(());
    };

    let head = event.head_update();
    match sync_decision(&env, &head.commit_sha, head.head_updated_at) {
        SyncDecision::Record => {}
        SyncDecision::Resume => {
            tracing::info!(env_id = env.id, sha = %head.commit_sha, "Update still pending; queueing it again");
            return dispatch(
                state,
                EnvironmentTask::Update {
                    env_id: env.id,
                    commit_sha: head.commit_sha,
                },
            );
        }
        SyncDecision::Ignore(reason) => {
            tracing::info!(env_id = env.id, sha = %head.commit_sha, reason, "Ignoring synchronize");
            return Ok(());
        }
    }

    let Some(env) = environment_service::record_head(conn, env.id, &head)
        .await
        .map_err(internal("record head"))?
    else {
        tracing::info!(env_id = env.id, "Head moved concurrently; ignoring synchronize");
        return Ok(());
    };

    if env.status == EnvironmentStatus::Failed.as_str() {
        tracing::info!(env_id = env.id, sha = %head.commit_sha, "Recorded new head on failed environment");
        return Ok(());
    }

    deployment_service::create_deployment(conn, env.id, &head.commit_sha, None)
        .await
        .map_err(internal("create deployment"))?;

    // Pending and provisioning records pick the new head up when their task completes.
    let updating = environment_service::apply_event(conn, env.id, &EnvironmentEvent::UpdateRequested)
        .await
        .map_err(internal("request update"))?;
    match updating {
        Some(_) => dispatch(
            state,
            EnvironmentTask::Update {
                env_id: env.id,
                commit_sha: head.commit_sha,
            },
        ),
        None => close_unattended_deployment(conn, env.id).await,
    }
}

/// Fail the deployment just appended when the record has meanwhile ended and
/// no task is left to finish it.
async fn close_unattended_deployment(
    conn: &mut AsyncPgConnection,
    env_id: i64,
) -> Result<(), StatusCode> {
    let Some(current) = environment_service::get_environment(conn, env_id)
        .await
        .map_err(internal("reload environment"))?
    else {
        return Ok(());
    };
    let reason = match current.lifecycle_status() {
        Ok(EnvironmentStatus::Failed) => current
            .error_message
            .unwrap_or_else(|| "Environment failed".to_string()),
        Ok(EnvironmentStatus::Destroyed) => "Pull request closed".to_string(),
        _ => return Ok(()),
    };
    deployment_service::close_unfinished(conn, env_id, None, &reason)
        .await
        .map_err(internal("close deployment"))?;
    Ok(())
}

async fn handle_close(
    state: &AppState,
    conn: &mut AsyncPgConnection,
    event: &PullRequestEvent,
) -> Result<(), StatusCode> {
    let existing =
        environment_service::find_by_pr(conn, &event.repository.full_name, event.number)
            .await
            .map_err(internal("find environment"))?;
    let Some(env) = existing else {
        tracing::debug!(pr = event.number, "No environment for closed PR");
        return Ok(());
    };

    let destroying =
        environment_service::apply_event(conn, env.id, &EnvironmentEvent::DestroyRequested)
            .await
            .map_err(internal("request destroy"))?;
    if destroying.is_none() {
        if env.status != EnvironmentStatus::Destroying.as_str() {
            return Ok(());
        }
        tracing::info!(env_id = env.id, "Environment already destroying; queueing destroy again");
    }
    dispatch(
        state,
        EnvironmentTask::Destroy {
            env_id: env.id,
            merged: event.merged(),
        },
    )
}

fn dispatch(state: &AppState, task: EnvironmentTask) -> Result<(), StatusCode> {
    let env_id = task.env_id();
    state.dispatcher.dispatch(task).map_err(|e| {
        tracing::error!(env_id, "Failed to queue environment task: {e}");
        match e {
            DispatchError::QueueFull | DispatchError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        }
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn internal(context: &'static str) -> impl Fn(anyhow::Error) -> StatusCode {
    move |e| {
        tracing::error!("Webhook {context} failed: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
