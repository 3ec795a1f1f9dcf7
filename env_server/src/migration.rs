//! Schema migration for the control plane tables.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// SQL migration for users, environments, deployments and webhook deliveries.
///
/// Idempotent: every statement is `IF NOT EXISTS`, so it runs on each startup.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id              BIGSERIAL PRIMARY KEY,
    github_id       BIGINT NOT NULL UNIQUE,
    github_login    VARCHAR(255) NOT NULL,
    email           VARCHAR(255),
    avatar_url      VARCHAR(512),
    is_active       BOOLEAN NOT NULL DEFAULT TRUE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_users_login ON users (github_login);

CREATE TABLE IF NOT EXISTS environments (
    id                   BIGSERIAL PRIMARY KEY,
    repository_full_name VARCHAR(255) NOT NULL,
    repository_name      VARCHAR(255) NOT NULL,
    pr_number            INTEGER NOT NULL,
    pr_title             VARCHAR(1024),
    branch_name          VARCHAR(255) NOT NULL,
    commit_sha           VARCHAR(40) NOT NULL,
    namespace            VARCHAR(63) NOT NULL UNIQUE,
    environment_url      VARCHAR(512),
    status               VARCHAR(32) NOT NULL DEFAULT 'pending',
    installation_id      BIGINT,
    owner_id             BIGINT NOT NULL REFERENCES users(id),
    error_message        TEXT,
    head_updated_at      TIMESTAMPTZ,
    last_deployed_at     TIMESTAMPTZ,
    destroyed_at         TIMESTAMPTZ,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (repository_full_name, pr_number)
);

CREATE INDEX IF NOT EXISTS idx_environments_status ON environments (status);
CREATE INDEX IF NOT EXISTS idx_environments_repo ON environments (repository_full_name);
CREATE INDEX IF NOT EXISTS idx_environments_updated ON environments (updated_at);

CREATE TABLE IF NOT EXISTS deployments (
    id              BIGSERIAL PRIMARY KEY,
    environment_id  BIGINT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
    commit_sha      VARCHAR(40) NOT NULL,
    commit_message  TEXT,
    status          VARCHAR(32) NOT NULL DEFAULT 'queued',
    started_at      TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    error_message   TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_deployments_environment ON deployments (environment_id, id DESC);
CREATE INDEX IF NOT EXISTS idx_deployments_commit ON deployments (commit_sha);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    delivery_id     VARCHAR(64) PRIMARY KEY,
    event_type      VARCHAR(64) NOT NULL,
    received_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_received ON webhook_deliveries (received_at);
"#;

/// Apply the control plane migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("Environment migration failed: {e}"))?;
    Ok(())
}
