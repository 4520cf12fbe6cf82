//! Octocrab-backed platform transport.
//!
//! Drives the REST API through raw routes rather than octocrab's typed
//! wrappers: the engine's DTOs are deliberately narrow (only the fields the
//! mirror persists), and several feeds it needs (owner activity, repo-level
//! issue events) have no typed wrapper.
//!
//! Quota reporting follows the upstream convention that a server without
//! rate limiting answers with an absurdly high remaining count; such servers
//! are reported as having no quota at all, which switches the work queue to
//! quota-blind pacing.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::Deserialize;
use tracing::{debug, info};

use crate::types::Owner;

use super::{
    ActivityEvent, ActivityKind, CommentData, IssueData, IssueEventData, IssueFeedEvent,
    IssueSummary, Platform, PlatformError, QuotaSnapshot, RepoSummary, Result, UserData,
};

/// Page size for all paged routes.
const PER_PAGE: u32 = 100;

/// Remaining count at or above which the server is treated as quota-free.
const UNLIMITED_SENTINEL: i64 = 1_000_000;

/// Octocrab-backed implementation of [`Platform`].
pub struct OctoPlatform {
    client: Octocrab,

    /// Rate-limit reset bookkeeping. The reset timestamp from the server is
    /// only trusted when the previous one has elapsed or the remaining count
    /// went back up (implying a reset happened).
    quota_state: Mutex<QuotaState>,
}

#[derive(Debug, Default)]
struct QuotaState {
    reset_time_ms: i64,
    last_remaining_seen: Option<i64>,
}

impl OctoPlatform {
    /// Connects to `github.com` or a GitHub Enterprise host.
    ///
    /// A server name ending in `github.com` selects the public API; anything
    /// else is treated as an enterprise host at `https://<host>/api/v3`.
    pub fn connect(server: &str, username: &str, password: &str) -> Result<Self> {
        let mut builder = Octocrab::builder().basic_auth(username.to_string(), password.to_string());

        if !server.to_lowercase().ends_with("github.com") {
            builder = builder
                .base_uri(format!("https://{}/api/v3", server))
                .map_err(|e| PlatformError::permanent(format!("invalid server uri: {}", e)))?;
        }

        let client = builder
            .build()
            .map_err(|e| PlatformError::permanent(format!("client construction failed: {}", e)))?;

        Ok(OctoPlatform {
            client,
            quota_state: Mutex::new(QuotaState::default()),
        })
    }

    /// Wraps a pre-built octocrab instance (custom auth schemes).
    pub fn from_octocrab(client: Octocrab) -> Self {
        OctoPlatform {
            client,
            quota_state: Mutex::new(QuotaState::default()),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, route: String) -> Result<T> {
        self.client
            .get(route, None::<&()>)
            .await
            .map_err(classify_error)
    }

    /// GET that maps upstream 404 to `Ok(None)`.
    async fn get_json_opt<T: for<'de> Deserialize<'de>>(&self, route: String) -> Result<Option<T>> {
        match self.client.get(route, None::<&()>).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(classify_error(err)),
        }
    }

    /// Pages through a listing route until an empty page comes back.
    async fn get_all_pages<T: for<'de> Deserialize<'de>>(&self, route_base: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for page in 1u32.. {
            let batch: Vec<T> = self
                .get_json(format!("{}per_page={}&page={}", route_base, PER_PAGE, page))
                .await?;
            let done = (batch.len() as u32) < PER_PAGE;
            out.extend(batch);
            if done {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Platform for OctoPlatform {
    async fn organization_exists(&self, name: &str) -> Result<bool> {
        let org: Option<serde_json::Value> = self.get_json_opt(format!("/orgs/{}", name)).await?;
        Ok(org.is_some())
    }

    async fn user_exists(&self, name: &str) -> Result<bool> {
        let user: Option<serde_json::Value> = self.get_json_opt(format!("/users/{}", name)).await?;
        Ok(user.is_some())
    }

    async fn list_org_repositories(&self, org: &str) -> Result<Vec<RepoSummary>> {
        let repos: Vec<RepoDto> = self
            .get_all_pages(&format!("/orgs/{}/repos?", org))
            .await?;
        Ok(repos.into_iter().map(RepoDto::into_summary).collect())
    }

    async fn list_user_repositories(&self, user: &str) -> Result<Vec<RepoSummary>> {
        let repos: Vec<RepoDto> = self
            .get_all_pages(&format!("/users/{}/repos?", user))
            .await?;
        Ok(repos.into_iter().map(RepoDto::into_summary).collect())
    }

    async fn fetch_repository(
        &self,
        owner_name: &str,
        repo: &str,
    ) -> Result<Option<RepoSummary>> {
        let dto: Option<RepoDto> = self
            .get_json_opt(format!("/repos/{}/{}", owner_name, repo))
            .await?;
        Ok(dto.map(RepoDto::into_summary))
    }

    async fn list_issues_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<IssueSummary>> {
        let issues: Vec<IssueDto> = self
            .get_json(format!(
                "/repos/{}/{}/issues?state=all&per_page={}&page={}",
                owner_name, repo, PER_PAGE, page
            ))
            .await?;
        Ok(issues
            .into_iter()
            .map(|dto| IssueSummary {
                number: dto.number,
                id: dto.id,
                pull_request: dto.pull_request.is_some(),
            })
            .collect())
    }

    async fn fetch_issue(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Option<IssueData>> {
        let dto: Option<IssueDto> = self
            .get_json_opt(format!("/repos/{}/{}/issues/{}", owner_name, repo, number))
            .await?;
        Ok(dto.map(IssueDto::into_data))
    }

    async fn list_issue_comments(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<CommentData>> {
        let comments: Vec<CommentDto> = self
            .get_all_pages(&format!(
                "/repos/{}/{}/issues/{}/comments?",
                owner_name, repo, number
            ))
            .await?;
        Ok(comments
            .into_iter()
            .map(|dto| CommentData {
                user_login: dto.user.and_then(|u| u.login),
                body: dto.body,
                created_at: dto.created_at,
                updated_at: dto.updated_at,
            })
            .collect())
    }

    async fn list_issue_events(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<IssueEventData>> {
        let events: Vec<IssueEventDto> = self
            .get_all_pages(&format!(
                "/repos/{}/{}/issues/{}/events?",
                owner_name, repo, number
            ))
            .await?;
        Ok(events.into_iter().map(IssueEventDto::into_data).collect())
    }

    async fn owner_events_page(&self, owner: &Owner, page: u32) -> Result<Vec<ActivityEvent>> {
        let route = match owner {
            Owner::Org(name) => format!(
                "/orgs/{}/events?per_page={}&page={}",
                name, PER_PAGE, page
            ),
            Owner::User(name) => format!(
                "/users/{}/events?per_page={}&page={}",
                name, PER_PAGE, page
            ),
        };
        let events: Vec<ActivityEventDto> = self.get_json(route).await?;
        Ok(events
            .into_iter()
            .filter_map(ActivityEventDto::into_event)
            .collect())
    }

    async fn repo_events_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<ActivityEvent>> {
        let events: Vec<ActivityEventDto> = self
            .get_json(format!(
                "/repos/{}/{}/events?per_page={}&page={}",
                owner_name, repo, PER_PAGE, page
            ))
            .await?;
        Ok(events
            .into_iter()
            .filter_map(ActivityEventDto::into_event)
            .collect())
    }

    async fn repo_issue_events_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<IssueFeedEvent>> {
        let events: Vec<IssueEventDto> = self
            .get_json(format!(
                "/repos/{}/{}/issues/events?per_page={}&page={}",
                owner_name, repo, PER_PAGE, page
            ))
            .await?;
        Ok(events
            .into_iter()
            .filter_map(IssueEventDto::into_feed_event)
            .collect())
    }

    async fn fetch_user(&self, login: &str) -> Result<Option<UserData>> {
        let dto: Option<UserDto> = self.get_json_opt(format!("/users/{}", login)).await?;
        Ok(dto.map(|d| UserData {
            login: d.login,
            name: d.name,
            email: d.email,
        }))
    }

    async fn quota(&self) -> Result<Option<QuotaSnapshot>> {
        let dto: RateLimitDto = self.get_json("/rate_limit".to_string()).await?;
        let core = dto.resources.core;

        if core.remaining >= UNLIMITED_SENTINEL {
            debug!("server does not enforce a rate limit");
            return Ok(None);
        }

        let now_ms = Utc::now().timestamp_millis();
        let server_reset_ms = core.reset * 1000;

        let reset_ms = {
            let mut state = self
                .quota_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            // Adopt the server's reset time when ours has elapsed, or when the
            // remaining count increased (a reset happened under us).
            let remaining_went_up = state
                .last_remaining_seen
                .is_some_and(|last| last < core.remaining);
            if now_ms > state.reset_time_ms || remaining_went_up {
                if state.reset_time_ms != server_reset_ms {
                    info!(reset_ms = server_reset_ms, "updating rate limit reset time");
                }
                state.reset_time_ms = server_reset_ms;
            }
            state.last_remaining_seen = Some(core.remaining);
            state.reset_time_ms
        };

        Ok(Some(QuotaSnapshot {
            remaining: core.remaining,
            seconds_to_reset: (reset_ms - now_ms) / 1000,
            total_hourly_limit: core.limit,
        }))
    }
}

fn is_not_found(err: &octocrab::Error) -> bool {
    matches!(
        err,
        octocrab::Error::GitHub { source, .. } if source.status_code.as_u16() == 404
    )
}

fn classify_error(err: octocrab::Error) -> PlatformError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            let message = format!("HTTP {}: {}", status, source.message);

            let rate_limited = status == 429
                || (status == 403 && source.message.to_lowercase().contains("rate limit"));
            if rate_limited {
                PlatformError::quota_exhausted(message)
            } else if status >= 500 {
                PlatformError::transient(message)
            } else {
                PlatformError::permanent(message)
            }
        }
        // Transport-level failures (connection reset, timeouts) are transient.
        octocrab::Error::Hyper { .. } | octocrab::Error::Http { .. } => {
            PlatformError::transient(err.to_string())
        }
        _ => PlatformError::permanent(err.to_string()),
    }
}

// ─── Wire DTOs ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RepoDto {
    name: String,
    id: i64,
}

impl RepoDto {
    fn into_summary(self) -> RepoSummary {
        RepoSummary {
            name: self.name,
            id: self.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserRefDto {
    login: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserDto {
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelDto {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueDto {
    id: i64,
    number: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    user: Option<UserRefDto>,
    #[serde(default)]
    assignees: Vec<UserRefDto>,
    #[serde(default)]
    labels: Vec<LabelDto>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
    #[serde(default)]
    state: Option<String>,
}

impl IssueDto {
    fn into_data(self) -> IssueData {
        IssueData {
            id: self.id,
            number: self.number,
            title: self.title.unwrap_or_default(),
            body: self.body,
            html_url: self.html_url.unwrap_or_default(),
            reporter_login: self.user.and_then(|u| u.login),
            assignee_logins: self.assignees.into_iter().map(|u| u.login).collect(),
            labels: self.labels.into_iter().filter_map(|l| l.name).collect(),
            created_at: self.created_at,
            closed_at: self.closed_at,
            pull_request: self.pull_request.is_some(),
            closed: self.state.as_deref() == Some("closed"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentDto {
    #[serde(default)]
    user: Option<UserRefDto>,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RenameDto {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueRefDto {
    id: i64,
    number: i64,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IssueEventDto {
    #[serde(default)]
    event: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    actor: Option<UserRefDto>,
    #[serde(default)]
    assignee: Option<UserRefDto>,
    #[serde(default)]
    assigner: Option<UserRefDto>,
    #[serde(default)]
    label: Option<LabelDto>,
    #[serde(default)]
    rename: Option<RenameDto>,
    #[serde(default)]
    issue: Option<IssueRefDto>,
}

impl IssueEventDto {
    fn into_data(self) -> IssueEventData {
        IssueEventData {
            kind: self.event.unwrap_or_default(),
            created_at: self.created_at,
            actor_login: self.actor.and_then(|u| u.login),
            assignee_login: self.assignee.and_then(|u| u.login),
            assigner_login: self.assigner.and_then(|u| u.login),
            label: self.label.and_then(|l| l.name),
            rename_from: self.rename.as_ref().and_then(|r| r.from.clone()),
            rename_to: self.rename.as_ref().and_then(|r| r.to.clone()),
        }
    }

    /// Converts a repo-level issue event into a feed entry. Entries without
    /// an issue reference cannot be scanned and are dropped.
    fn into_feed_event(self) -> Option<IssueFeedEvent> {
        let issue = self.issue?;
        Some(IssueFeedEvent {
            kind: self.event.unwrap_or_default(),
            issue_number: issue.number,
            issue_id: issue.id,
            pull_request: issue.pull_request.is_some(),
            created_at: self.created_at,
            actor_login: self.actor.and_then(|u| u.login),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EventRepoDto {
    /// Full name, `owner/repo`.
    name: String,
}

#[derive(Debug, Deserialize)]
struct ActivityPayloadDto {
    #[serde(default)]
    issue: Option<IssueRefDto>,
}

#[derive(Debug, Deserialize)]
struct ActivityEventDto {
    #[serde(rename = "type")]
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    actor: Option<UserRefDto>,
    #[serde(default)]
    repo: Option<EventRepoDto>,
    #[serde(default)]
    payload: Option<ActivityPayloadDto>,
    created_at: DateTime<Utc>,
}

impl ActivityEventDto {
    /// Narrows an activity-feed entry to the kinds the scanner consumes.
    /// Everything else (pushes, forks, PR events, ...) is dropped here.
    fn into_event(self) -> Option<ActivityEvent> {
        let kind = match self.event_type.as_deref() {
            Some("IssueCommentEvent") => ActivityKind::IssueComment,
            Some("IssuesEvent") => ActivityKind::Issues,
            _ => return None,
        };

        let issue = self.payload.and_then(|p| p.issue)?;
        let repo_full = self.repo?.name;
        let repo_name = repo_full
            .rsplit('/')
            .next()
            .unwrap_or(repo_full.as_str())
            .to_string();

        Some(ActivityEvent {
            kind,
            repo_name,
            issue_number: issue.number,
            issue_id: issue.id,
            pull_request: issue.pull_request.is_some(),
            created_at: self.created_at,
            actor_login: self.actor.and_then(|u| u.login),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitDto {
    resources: RateLimitResourcesDto,
}

#[derive(Debug, Deserialize)]
struct RateLimitResourcesDto {
    core: RateLimitCoreDto,
}

#[derive(Debug, Deserialize)]
struct RateLimitCoreDto {
    limit: i64,
    remaining: i64,
    /// Epoch seconds.
    reset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_dto_narrows_to_recognized_kinds() {
        let json = serde_json::json!({
            "type": "IssueCommentEvent",
            "actor": {"login": "octocat"},
            "repo": {"name": "eclipse/che"},
            "payload": {"issue": {"id": 7, "number": 42}},
            "created_at": "2020-01-01T00:00:00Z"
        });
        let dto: ActivityEventDto = serde_json::from_value(json).unwrap();
        let event = dto.into_event().unwrap();
        assert_eq!(event.kind, ActivityKind::IssueComment);
        assert_eq!(event.repo_name, "che");
        assert_eq!(event.issue_number, 42);
        assert!(!event.pull_request);
    }

    #[test]
    fn activity_dto_drops_unrecognized_kinds() {
        let json = serde_json::json!({
            "type": "PushEvent",
            "repo": {"name": "eclipse/che"},
            "created_at": "2020-01-01T00:00:00Z"
        });
        let dto: ActivityEventDto = serde_json::from_value(json).unwrap();
        assert!(dto.into_event().is_none());
    }

    #[test]
    fn activity_dto_marks_pull_requests() {
        let json = serde_json::json!({
            "type": "IssuesEvent",
            "repo": {"name": "eclipse/che"},
            "payload": {"issue": {"id": 7, "number": 3, "pull_request": {}}},
            "created_at": "2020-01-01T00:00:00Z"
        });
        let dto: ActivityEventDto = serde_json::from_value(json).unwrap();
        assert!(dto.into_event().unwrap().pull_request);
    }

    #[test]
    fn issue_dto_maps_closed_state() {
        let json = serde_json::json!({
            "id": 1,
            "number": 5,
            "title": "t",
            "state": "closed",
            "created_at": "2020-01-01T00:00:00Z"
        });
        let dto: IssueDto = serde_json::from_value(json).unwrap();
        let data = dto.into_data();
        assert!(data.closed);
        assert!(!data.pull_request);
    }

    #[test]
    fn issue_event_dto_without_issue_is_not_a_feed_event() {
        let json = serde_json::json!({
            "event": "labeled",
            "created_at": "2020-01-01T00:00:00Z"
        });
        let dto: IssueEventDto = serde_json::from_value(json).unwrap();
        assert!(dto.into_feed_event().is_none());
    }
}
