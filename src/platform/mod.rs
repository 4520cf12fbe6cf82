//! Upstream platform contract.
//!
//! The ingestion engine drives the upstream code-hosting API exclusively
//! through the [`Platform`] trait: paged feeds over repositories, issues,
//! comments, issue events, and recent activity, plus a quota snapshot. The
//! octocrab-backed transport lives in [`octo`]; tests substitute an in-memory
//! fixture.
//!
//! Errors are categorized for dispatch: transient faults cause a requeue or a
//! skipped feed, quota exhaustion causes the startup resolution loop to sleep
//! and retry, permanent faults are surfaced.

pub mod octo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Owner;

/// The kind of upstream failure, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// Connection reset, 5xx, soft rate-limit responses. Retriable.
    Transient,

    /// The hourly request quota is exhausted. Callers back off for a fixed
    /// interval rather than retrying immediately.
    QuotaExhausted,

    /// Anything else (auth failures, malformed responses). Not retriable.
    Permanent,
}

/// An upstream API failure.
#[derive(Debug, Error)]
#[error("upstream error ({kind:?}): {message}")]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub message: String,
}

impl PlatformError {
    pub fn transient(message: impl Into<String>) -> Self {
        PlatformError {
            kind: PlatformErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        PlatformError {
            kind: PlatformErrorKind::QuotaExhausted,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        PlatformError {
            kind: PlatformErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == PlatformErrorKind::Transient
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.kind == PlatformErrorKind::QuotaExhausted
    }
}

/// Result type for platform operations.
pub type Result<T> = std::result::Result<T, PlatformError>;

/// A point-in-time view of the upstream request quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Requests left in the current window.
    pub remaining: i64,

    /// Seconds until the window resets. May be negative if the reset time
    /// has already passed; consumers clamp.
    pub seconds_to_reset: i64,

    /// Total requests allowed per window.
    pub total_hourly_limit: i64,
}

/// Source of quota snapshots for the work queue's pacing gate.
///
/// `None` means the upstream server does not report a quota (the queue falls
/// back to quota-blind pacing).
pub trait QuotaSource: Send + Sync {
    fn quota_snapshot(&self) -> Option<QuotaSnapshot>;
}

/// A quota source that never reports a quota. Used in tests and against
/// servers without rate limiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuota;

impl QuotaSource for NoQuota {
    fn quota_snapshot(&self) -> Option<QuotaSnapshot> {
        None
    }
}

/// A quota source backed by a shared snapshot that someone else (the
/// scheduler) refreshes periodically from the platform.
#[derive(Debug, Default)]
pub struct SharedQuota {
    snapshot: std::sync::Mutex<Option<QuotaSnapshot>>,
}

impl SharedQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, snapshot: Option<QuotaSnapshot>) {
        let mut held = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        *held = snapshot;
    }
}

impl QuotaSource for SharedQuota {
    fn quota_snapshot(&self) -> Option<QuotaSnapshot> {
        *self.snapshot.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A repository as listed under an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSummary {
    pub name: String,
    pub id: i64,
}

/// An issue as returned by the repository issue listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueSummary {
    pub number: i64,
    pub id: i64,
    pub pull_request: bool,
}

/// A fully-resolved issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueData {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub html_url: String,
    pub reporter_login: Option<String>,
    /// Upstream order; may contain duplicates or absent logins.
    pub assignee_logins: Vec<Option<String>>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pull_request: bool,
    pub closed: bool,
}

/// A single issue comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentData {
    pub user_login: Option<String>,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One entry of an issue's event timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueEventData {
    /// Upstream kind string (`assigned`, `labeled`, `renamed`, ...).
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub actor_login: Option<String>,
    pub assignee_login: Option<String>,
    pub assigner_login: Option<String>,
    pub label: Option<String>,
    pub rename_from: Option<String>,
    pub rename_to: Option<String>,
}

/// Recognized kinds on the owner/repo activity feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    /// A comment was added to an issue.
    IssueComment,
    /// An issue was opened, edited, closed, reopened, etc.
    Issues,
}

impl ActivityKind {
    /// Stable token used in event fingerprints. Never rendered to users.
    pub fn ordinal(&self) -> u32 {
        match self {
            ActivityKind::IssueComment => 14,
            ActivityKind::Issues => 15,
        }
    }
}

/// One entry of the owner- or repo-level activity feed, pre-filtered to the
/// kinds the scanner recognizes. The transport drops everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub repo_name: String,
    pub issue_number: i64,
    pub issue_id: i64,
    pub pull_request: bool,
    pub created_at: DateTime<Utc>,
    pub actor_login: Option<String>,
}

/// One entry of a repository's issue-events feed (the scanner's second feed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueFeedEvent {
    pub kind: String,
    pub issue_number: i64,
    pub issue_id: i64,
    pub pull_request: bool,
    pub created_at: DateTime<Utc>,
    pub actor_login: Option<String>,
}

/// A user profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    pub login: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// The upstream platform API, as far as the ingestion engine needs it.
///
/// Paged methods take a 1-based page number and return an empty vector at
/// end-of-feed. Fetch methods return `Ok(None)` for absent resources; errors
/// are reserved for transport and quota failures.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn organization_exists(&self, name: &str) -> Result<bool>;

    async fn user_exists(&self, name: &str) -> Result<bool>;

    async fn list_org_repositories(&self, org: &str) -> Result<Vec<RepoSummary>>;

    async fn list_user_repositories(&self, user: &str) -> Result<Vec<RepoSummary>>;

    async fn fetch_repository(&self, owner_name: &str, repo: &str)
    -> Result<Option<RepoSummary>>;

    /// Issues in state ALL, including pull requests (callers skip them).
    async fn list_issues_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<IssueSummary>>;

    async fn fetch_issue(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Option<IssueData>>;

    async fn list_issue_comments(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<CommentData>>;

    async fn list_issue_events(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<IssueEventData>>;

    /// The owner-level activity feed (orgs and users), newest first.
    async fn owner_events_page(&self, owner: &Owner, page: u32) -> Result<Vec<ActivityEvent>>;

    /// The repo-level activity feed, newest first. Used for repo-list owners.
    async fn repo_events_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<ActivityEvent>>;

    /// The repo-level issue-events feed, newest first.
    async fn repo_issue_events_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<IssueFeedEvent>>;

    async fn fetch_user(&self, login: &str) -> Result<Option<UserData>>;

    /// Fetches a fresh quota snapshot. `Ok(None)` when the server does not
    /// enforce a quota (e.g. GitHub Enterprise without rate limiting).
    async fn quota(&self) -> Result<Option<QuotaSnapshot>>;
}
