//! Persisted document types.
//!
//! These are the JSON shapes written to the content store and returned by the
//! read API. Field names are part of the on-disk format; changing them
//! invalidates an existing mirror database.
//!
//! User-referencing fields (`reporter`, `assignees`, comment and event actor
//! logins) are never null in serialized form: a missing upstream user is
//! stored as the literal `"Ghost"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::owner::Owner;

/// The sentinel login used when a user reference is absent upstream.
pub const GHOST_LOGIN: &str = "Ghost";

/// Normalizes an optional upstream login to a real login or `"Ghost"`.
pub fn sanitize_login(login: Option<&str>) -> String {
    match login {
        Some(l) if !l.is_empty() => l.to_string(),
        _ => GHOST_LOGIN.to_string(),
    }
}

/// A mirrored repository: identity plus the observed non-PR issue range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub name: String,

    /// Set when the owner is an organization; mutually exclusive with
    /// `owner_user_name`.
    pub org_name: Option<String>,
    pub owner_user_name: Option<String>,

    pub repository_id: i64,

    /// Lowest non-PR issue number observed during the last repository scan.
    pub first_issue: Option<i64>,

    /// Highest non-PR issue number observed. Monotonically non-decreasing:
    /// the store rejects regressions on put.
    pub last_issue: Option<i64>,
}

impl RepositoryRecord {
    /// Reconstructs the owner from the record's nullable name pair.
    pub fn owner(&self) -> Option<Owner> {
        if let Some(org) = &self.org_name {
            Owner::org(org.clone()).ok()
        } else if let Some(user) = &self.owner_user_name {
            Owner::user(user.clone()).ok()
        } else {
            None
        }
    }
}

/// A mirrored non-PR issue with its comments and recognized events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub parent_repo: String,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub html_url: String,
    pub reporter: String,

    /// Upstream order, deduplicated by login.
    pub assignees: Vec<String>,

    /// Label names only, upstream order.
    pub labels: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,

    pub pull_request: bool,
    pub closed: bool,

    pub comments: Vec<IssueCommentRecord>,
    pub issue_events: Vec<IssueEventRecord>,
}

/// A single issue comment, upstream order preserved by the parent vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCommentRecord {
    pub user_login: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A recognized issue event. Unrecognized upstream kinds are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueEventRecord {
    /// The upstream event kind string (`assigned`, `labeled`, `renamed`, ...).
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub actor_user_login: String,

    /// Kind-specific payload; `None` for `reopened`/`merged`/`closed`.
    pub data: Option<IssueEventDetail>,
}

/// Payload of the recognized issue-event kinds that carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueEventDetail {
    AssignedUnassigned {
        assignee: String,
        assigner: String,
        assigned: bool,
    },
    LabeledUnlabeled {
        label: String,
        labeled: bool,
    },
    Renamed {
        from: String,
        to: String,
    },
}

/// A mirrored user. Refreshed on full scans only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub login: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// The ordered repository list of a mirrored user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRepositoriesRecord {
    pub user_name: String,
    pub repo_names: Vec<String>,
}

/// The ordered repository list of a mirrored organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub name: String,
    pub repositories: Vec<String>,
}

/// An entry in the engine's change log: a persisted issue changed shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChangeEvent {
    /// Epoch milliseconds. Also keys the log file the event is stored in.
    pub time: i64,
    pub uuid: String,
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
}

/// Response shape of the bulk issue endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkIssues {
    pub issues: Vec<IssueRecord>,
}
