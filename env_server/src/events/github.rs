//! Typed `pull_request` webhook payload.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::user::NewUser;
use crate::services::environment_service::HeadUpdate;

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: i32,
    pub pull_request: PullRequest,
    pub repository: Repository,
    #[serde(default)]
    pub installation: Option<Installation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub head: GitRef,
    pub user: Account,
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: i64,
}

/// What a pull request action means for its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestAction {
    Open,
    Synchronize,
    Close,
    Other,
}

impl PullRequestEvent {
    pub fn kind(&self) -> PullRequestAction {
        match self.action.as_str() {
            "opened" | "reopened" => PullRequestAction::Open,
            "synchronize" => PullRequestAction::Synchronize,
            "closed" => PullRequestAction::Close,
            _ => PullRequestAction::Other,
        }
    }

    pub fn merged(&self) -> bool {
        self.pull_request.merged.unwrap_or(false)
    }

    pub fn installation_id(&self) -> Option<i64> {
        self.installation.as_ref().map(|i| i.id)
    }

    pub fn head_sha(&self) -> &str {
        &self.pull_request.head.sha
    }

    pub fn head_update(&self) -> HeadUpdate {
        HeadUpdate {
            commit_sha: self.pull_request.head.sha.clone(),
            branch_name: self.pull_request.head.ref_name.clone(),
            pr_title: self.pull_request.title.clone(),
            head_updated_at: self.pull_request.updated_at,
            installation_id: self.installation_id(),
        }
    }

    pub fn author(&self) -> NewUser {
        let user = &self.pull_request.user;
        NewUser {
            github_id: user.id,
            github_login: user.login.clone(),
            email: user.email.clone(),
            avatar_url: user.avatar_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNCHRONIZE: &str = r#"{
        "action": "synchronize",
        "number": 17,
        "pull_request": {
            "title": "Speed up search",
            "head": { "ref": "perf/search", "sha": "d34db33f" },
            "user": { "id": 501, "login": "octo", "avatar_url": "https://avatars.example/501" },
            "merged": false,
            "updated_at": "2026-03-01T12:30:00Z"
        },
        "repository": { "name": "search-api", "full_name": "acme/search-api" },
        "installation": { "id": 8812 },
        "sender": { "login": "octo" }
    }"#;

    #[test]
    fn parses_pull_request_payload() {
        let event: PullRequestEvent = serde_json::from_str(SYNCHRONIZE).unwrap();
        assert_eq!(event.kind(), PullRequestAction::Synchronize);
        assert_eq!(event.number, 17);
        assert_eq!(event.head_sha(), "d34db33f");
        assert_eq!(event.installation_id(), Some(8812));
        assert!(!event.merged());

        let head = event.head_update();
        assert_eq!(head.branch_name, "perf/search");
        assert_eq!(head.pr_title.as_deref(), Some("Speed up search"));
        assert_eq!(
            head.head_updated_at.map(|t| t.to_rfc3339()),
            Some("2026-03-01T12:30:00+00:00".to_string())
        );

        let author = event.author();
        assert_eq!(author.github_id, 501);
        assert_eq!(author.github_login, "octo");
        assert_eq!(author.email, None);
    }

    #[test]
    fn optional_fields_may_be_absent_or_null() {
        let payload = r#"{
            "action": "closed",
            "number": 3,
            "pull_request": {
                "title": null,
                "head": { "ref": "main", "sha": "abc" },
                "user": { "id": 1, "login": "bot" },
                "merged": null
            },
            "repository": { "name": "api", "full_name": "acme/api" }
        }"#;
        let event: PullRequestEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.kind(), PullRequestAction::Close);
        assert!(!event.merged());
        assert_eq!(event.installation_id(), None);
        assert_eq!(event.head_update().head_updated_at, None);
    }

    #[test]
    fn actions_map_to_lifecycle_intent() {
        let mut event: PullRequestEvent = serde_json::from_str(SYNCHRONIZE).unwrap();
        for (action, kind) in [
            ("opened", PullRequestAction::Open),
            ("reopened", PullRequestAction::Open),
            ("closed", PullRequestAction::Close),
            ("labeled", PullRequestAction::Other),
        ] {
            event.action = action.to_string();
            assert_eq!(event.kind(), kind);
        }
    }

    #[test]
    fn missing_head_is_rejected() {
        let payload = r#"{"action":"opened","number":1,"pull_request":{"user":{"id":1,"login":"x"}},
            "repository":{"name":"a","full_name":"o/a"}}"#;
        assert!(serde_json::from_str::<PullRequestEvent>(payload).is_err());
    }
}
