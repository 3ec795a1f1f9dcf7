//! environment: One preview environment per (repository, pull request).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::schema::environments;

/// Longest repository slug kept in a namespace name.
const REPO_SLUG_MAX: usize = 20;
/// Kubernetes namespace names are DNS-1123 labels.
const NAMESPACE_MAX: usize = 63;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = environments)]
pub struct Environment {
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
    pub installation_id: Option<i64>,
    pub owner_id: i64,
    pub error_message: Option<String>,
    pub head_updated_at: Option<DateTime<Utc>>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    /// Parsed lifecycle status. Unknown values surface as an error rather
    /// than being coerced into a state.
    pub fn lifecycle_status(&self) -> Result<EnvironmentStatus, UnknownStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = environments)]
pub struct NewEnvironment {
    pub repository_full_name: String,
    pub repository_name: String,
    pub pr_number: i32,
    pub pr_title: Option<String>,
    pub branch_name: String,
    pub commit_sha: String,
    pub namespace: String,
    pub environment_url: Option<String>,
    pub status: String,
    pub installation_id: Option<i64>,
    pub owner_id: i64,
    pub head_updated_at: Option<DateTime<Utc>>,
}

/// Environment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Queued for creation.
    Pending,
    /// Namespace being created.
    Provisioning,
    /// Namespace exists and is reachable.
    Ready,
    /// New commits being rolled onto an existing namespace.
    Updating,
    /// Namespace being torn down.
    Destroying,
    /// Torn down. The row is kept.
    Destroyed,
    Failed,
}

impl EnvironmentStatus {
    pub const ALL: [EnvironmentStatus; 7] = [
        EnvironmentStatus::Pending,
        EnvironmentStatus::Provisioning,
        EnvironmentStatus::Ready,
        EnvironmentStatus::Updating,
        EnvironmentStatus::Destroying,
        EnvironmentStatus::Destroyed,
        EnvironmentStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Pending => "pending",
            EnvironmentStatus::Provisioning => "provisioning",
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Updating => "updating",
            EnvironmentStatus::Destroying => "destroying",
            EnvironmentStatus::Destroyed => "destroyed",
            EnvironmentStatus::Failed => "failed",
        }
    }

    /// States that count against the cluster (listed by `active_only`).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EnvironmentStatus::Pending
                | EnvironmentStatus::Provisioning
                | EnvironmentStatus::Ready
                | EnvironmentStatus::Updating
        )
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown environment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for EnvironmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvironmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Namespace name for a pull request: `pr-{number}-{repo-slug}`.
///
/// The slug is the lowercased repository short name with `_` and `.` mapped
/// to `-`, cut to 20 characters, with no leading or trailing `-`.
pub fn generate_namespace(repository_name: &str, pr_number: i32) -> String {
    let slug: String = repository_name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            _ => '-',
        })
        .take(REPO_SLUG_MAX)
        .collect();
    let slug = slug.trim_matches('-');

    let name = if slug.is_empty() {
        format!("pr-{pr_number}")
    } else {
        format!("pr-{pr_number}-{slug}")
    };
    name.chars().take(NAMESPACE_MAX).collect()
}

/// Namespace variant used when the plain name is already owned by another
/// repository: a short digest of the full repository name is appended.
pub fn disambiguate_namespace(namespace: &str, repository_full_name: &str) -> String {
    let digest = Sha256::digest(repository_full_name.as_bytes());
    let suffix = &hex::encode(digest)[..6];
    let max_base = NAMESPACE_MAX - suffix.len() - 1;
    let base: String = namespace.chars().take(max_base).collect();
    format!("{}-{suffix}", base.trim_end_matches('-'))
}
