//! Test helpers: an in-memory upstream platform.
//!
//! `FixturePlatform` implements the full [`Platform`] contract against data
//! held in memory, with interior mutability so tests can change the upstream
//! state between scans (new comments, removed labels, moved issues) and
//! inject transient faults.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::platform::{
    ActivityEvent, CommentData, IssueData, IssueEventData, IssueFeedEvent, IssueSummary, Platform,
    PlatformError, QuotaSnapshot, QuotaSource, RepoSummary, Result, UserData,
};
use crate::types::Owner;

const PAGE_SIZE: usize = 100;

#[derive(Default)]
struct FixtureState {
    org_repos: HashMap<String, Vec<RepoSummary>>,
    user_repos: HashMap<String, Vec<RepoSummary>>,
    /// Keyed by `owner/repo`.
    issues: HashMap<String, Vec<IssueData>>,
    /// Keyed by `owner/repo/number`.
    comments: HashMap<String, Vec<CommentData>>,
    /// Keyed by `owner/repo/number`.
    issue_events: HashMap<String, Vec<IssueEventData>>,
    /// Keyed by owner name.
    owner_events: HashMap<String, Vec<ActivityEvent>>,
    /// Keyed by `owner/repo`.
    repo_events: HashMap<String, Vec<ActivityEvent>>,
    /// Keyed by `owner/repo`.
    repo_issue_feeds: HashMap<String, Vec<IssueFeedEvent>>,
    user_profiles: HashMap<String, UserData>,
    quota: Option<QuotaSnapshot>,
    /// Remaining transient failures per `owner/repo/number` issue fetch.
    issue_fetch_faults: HashMap<String, u32>,
}

/// In-memory implementation of the upstream platform.
#[derive(Default)]
pub struct FixturePlatform {
    state: Mutex<FixtureState>,
}

pub fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

/// A plain issue with no comments, labels, or assignees.
pub fn basic_issue(number: i64, id: i64, owner: &str, repo: &str, body: &str) -> IssueData {
    IssueData {
        id,
        number,
        title: format!("Issue {}", number),
        body: Some(body.to_string()),
        html_url: format!("https://github.com/{}/{}/issues/{}", owner, repo, number),
        reporter_login: Some("octocat".to_string()),
        assignee_logins: vec![],
        labels: vec![],
        created_at: ts(1_500_000_000),
        closed_at: None,
        pull_request: false,
        closed: false,
    }
}

impl FixturePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ─── Fixture setup ────────────────────────────────────────────────────────

    pub fn add_org(&self, org: &str) {
        self.lock().org_repos.entry(org.to_string()).or_default();
    }

    pub fn add_user_account(&self, user: &str) {
        self.lock().user_repos.entry(user.to_string()).or_default();
        self.set_user_profile(user, Some(user), None);
    }

    pub fn add_org_repo(&self, org: &str, repo: &str, id: i64) {
        self.lock()
            .org_repos
            .entry(org.to_string())
            .or_default()
            .push(RepoSummary {
                name: repo.to_string(),
                id,
            });
    }

    pub fn add_user_repo(&self, user: &str, repo: &str, id: i64) {
        self.lock()
            .user_repos
            .entry(user.to_string())
            .or_default()
            .push(RepoSummary {
                name: repo.to_string(),
                id,
            });
    }

    pub fn put_issue(&self, owner: &str, repo: &str, issue: IssueData) {
        let mut state = self.lock();
        let issues = state
            .issues
            .entry(format!("{}/{}", owner, repo))
            .or_default();
        issues.retain(|i| i.number != issue.number);
        issues.push(issue);
    }

    pub fn set_comments(&self, owner: &str, repo: &str, number: i64, comments: Vec<CommentData>) {
        self.lock()
            .comments
            .insert(format!("{}/{}/{}", owner, repo, number), comments);
    }

    pub fn set_issue_events(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        events: Vec<IssueEventData>,
    ) {
        self.lock()
            .issue_events
            .insert(format!("{}/{}/{}", owner, repo, number), events);
    }

    /// Owner-level activity feed, newest first.
    pub fn set_owner_events(&self, owner: &str, events: Vec<ActivityEvent>) {
        self.lock().owner_events.insert(owner.to_string(), events);
    }

    /// Repo-level activity feed, newest first.
    pub fn set_repo_events(&self, owner: &str, repo: &str, events: Vec<ActivityEvent>) {
        self.lock()
            .repo_events
            .insert(format!("{}/{}", owner, repo), events);
    }

    /// Repo-level issue-events feed, newest first.
    pub fn set_repo_issue_feed(&self, owner: &str, repo: &str, events: Vec<IssueFeedEvent>) {
        self.lock()
            .repo_issue_feeds
            .insert(format!("{}/{}", owner, repo), events);
    }

    pub fn set_user_profile(&self, login: &str, name: Option<&str>, email: Option<&str>) {
        self.lock().user_profiles.insert(
            login.to_string(),
            UserData {
                login: Some(login.to_string()),
                name: name.map(str::to_string),
                email: email.map(str::to_string),
            },
        );
    }

    pub fn set_quota(&self, quota: Option<QuotaSnapshot>) {
        self.lock().quota = quota;
    }

    /// Makes the next `times` fetches of this issue fail transiently.
    pub fn fail_issue_fetches(&self, owner: &str, repo: &str, number: i64, times: u32) {
        self.lock()
            .issue_fetch_faults
            .insert(format!("{}/{}/{}", owner, repo, number), times);
    }
}

fn page_of<T: Clone>(items: Option<&Vec<T>>, page: u32) -> Vec<T> {
    let Some(items) = items else {
        return Vec::new();
    };
    let start = (page as usize - 1) * PAGE_SIZE;
    if start >= items.len() {
        return Vec::new();
    }
    let end = (start + PAGE_SIZE).min(items.len());
    items[start..end].to_vec()
}

#[async_trait]
impl Platform for FixturePlatform {
    async fn organization_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().org_repos.contains_key(name))
    }

    async fn user_exists(&self, name: &str) -> Result<bool> {
        let state = self.lock();
        Ok(state.user_repos.contains_key(name) || state.user_profiles.contains_key(name))
    }

    async fn list_org_repositories(&self, org: &str) -> Result<Vec<RepoSummary>> {
        Ok(self.lock().org_repos.get(org).cloned().unwrap_or_default())
    }

    async fn list_user_repositories(&self, user: &str) -> Result<Vec<RepoSummary>> {
        Ok(self.lock().user_repos.get(user).cloned().unwrap_or_default())
    }

    async fn fetch_repository(
        &self,
        owner_name: &str,
        repo: &str,
    ) -> Result<Option<RepoSummary>> {
        let state = self.lock();
        let found = state
            .org_repos
            .get(owner_name)
            .or_else(|| state.user_repos.get(owner_name))
            .and_then(|repos| repos.iter().find(|r| r.name == repo))
            .cloned();
        Ok(found)
    }

    async fn list_issues_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<IssueSummary>> {
        let state = self.lock();
        let issues = state.issues.get(&format!("{}/{}", owner_name, repo));
        Ok(page_of(issues, page)
            .into_iter()
            .map(|i| IssueSummary {
                number: i.number,
                id: i.id,
                pull_request: i.pull_request,
            })
            .collect())
    }

    async fn fetch_issue(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Option<IssueData>> {
        let mut state = self.lock();

        let fault_key = format!("{}/{}/{}", owner_name, repo, number);
        if let Some(remaining) = state.issue_fetch_faults.get_mut(&fault_key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(PlatformError::transient("injected fault"));
        }

        Ok(state
            .issues
            .get(&format!("{}/{}", owner_name, repo))
            .and_then(|issues| issues.iter().find(|i| i.number == number))
            .cloned())
    }

    async fn list_issue_comments(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<CommentData>> {
        Ok(self
            .lock()
            .comments
            .get(&format!("{}/{}/{}", owner_name, repo, number))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_issue_events(
        &self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<IssueEventData>> {
        Ok(self
            .lock()
            .issue_events
            .get(&format!("{}/{}/{}", owner_name, repo, number))
            .cloned()
            .unwrap_or_default())
    }

    async fn owner_events_page(&self, owner: &Owner, page: u32) -> Result<Vec<ActivityEvent>> {
        let state = self.lock();
        Ok(page_of(state.owner_events.get(owner.name()), page))
    }

    async fn repo_events_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<ActivityEvent>> {
        let state = self.lock();
        Ok(page_of(
            state.repo_events.get(&format!("{}/{}", owner_name, repo)),
            page,
        ))
    }

    async fn repo_issue_events_page(
        &self,
        owner_name: &str,
        repo: &str,
        page: u32,
    ) -> Result<Vec<IssueFeedEvent>> {
        let state = self.lock();
        Ok(page_of(
            state
                .repo_issue_feeds
                .get(&format!("{}/{}", owner_name, repo)),
            page,
        ))
    }

    async fn fetch_user(&self, login: &str) -> Result<Option<UserData>> {
        Ok(self.lock().user_profiles.get(login).cloned())
    }

    async fn quota(&self) -> Result<Option<QuotaSnapshot>> {
        Ok(self.lock().quota)
    }
}

impl QuotaSource for FixturePlatform {
    fn quota_snapshot(&self) -> Option<QuotaSnapshot> {
        self.lock().quota
    }
}
