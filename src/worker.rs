//! Worker pool: pulls units from the work queue, fetches the corresponding
//! upstream resources, and persists them.
//!
//! Five workers run concurrently, each corresponding to one simultaneous
//! upstream connection. A worker drains the queue in fixed kind priority
//! (Owner, then Repository, then Issue, then User) so newly-learned
//! repositories and issues surface before the user tail.
//!
//! Failures requeue the unit and never kill the pool; a per-unit watchdog
//! cancels upstream calls that are accepted but never answered, which then
//! take the same requeue path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::filter::MirrorFilter;
use crate::logfile::FileLog;
use crate::platform::{Platform, PlatformError};
use crate::queue::{IssueUnit, OwnerUnit, QueuedRepo, RepoUnit, UserUnit, WorkQueue};
use crate::store::{Store, StoreError};
use crate::types::{
    IssueCommentRecord, IssueEventDetail, IssueEventRecord, IssueRecord, OrganizationRecord,
    Owner, RepositoryRecord, ResourceChangeEvent, UserRecord, UserRepositoriesRecord,
    sanitize_login,
};

/// Number of worker tasks (simultaneous upstream connections).
pub const WORKER_COUNT: usize = 5;

/// A unit that has made no progress for this long is considered stalled.
const STALL_EXPIRY: Duration = Duration::from_secs(2 * 60);

/// Watchdog wake interval.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);

/// Errors from processing one work unit.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The watchdog fired: the upstream call made no progress within the
    /// expiry and was cancelled.
    #[error("unit stalled past the watchdog expiry")]
    Stalled,

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// One worker. Construct via [`spawn_workers`], or directly in tests.
pub struct Worker {
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) filter: Arc<dyn MirrorFilter>,
    pub(crate) file_log: Arc<FileLog>,
}

/// Spawns the worker pool. Workers exit when `shutdown` fires.
pub fn spawn_workers(
    queue: Arc<WorkQueue>,
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    filter: Arc<dyn MirrorFilter>,
    file_log: Arc<FileLog>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..WORKER_COUNT)
        .map(|index| {
            let worker = Worker {
                queue: queue.clone(),
                store: store.clone(),
                platform: platform.clone(),
                filter: filter.clone(),
                file_log: file_log.clone(),
            };
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker.run(index, shutdown).await;
            })
        })
        .collect()
}

impl Worker {
    async fn run(&self, index: usize, shutdown: CancellationToken) {
        info!(worker = index, "worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.wait_for_available_work() => {}
            }
            self.step().await;
        }

        info!(worker = index, "worker stopped");
    }

    /// Polls the queue in kind priority order and handles the first unit
    /// found. Exposed for tests that drive the pipeline to completion
    /// without spawning tasks.
    pub(crate) async fn step(&self) -> bool {
        if let Some(unit) = self.queue.poll_owner() {
            if let Err(e) = self.guarded(self.process_owner(&unit)).await {
                warn!(owner = %unit.owner, error = %e, "owner unit failed; requeueing");
                self.queue.add_owner(unit.clone());
            }
            self.queue.mark_processed(&unit);
            return true;
        }

        if let Some(unit) = self.queue.poll_repository() {
            if let Err(e) = self.guarded(self.process_repository(&unit)).await {
                warn!(
                    owner = %unit.owner,
                    repo = %unit.repo.name,
                    error = %e,
                    "repository unit failed; requeueing"
                );
                self.queue.add_repository(unit.clone());
            }
            self.queue.mark_processed(&unit);
            return true;
        }

        if let Some(unit) = self.queue.poll_issue() {
            if let Err(e) = self.guarded(self.process_issue(&unit)).await {
                warn!(
                    owner = %unit.owner,
                    repo = %unit.repo_name,
                    issue = unit.number,
                    error = %e,
                    "issue unit failed; requeueing"
                );
                self.queue.add_issue(unit.clone());
            }
            self.queue.mark_processed(&unit);
            return true;
        }

        if let Some(unit) = self.queue.poll_user() {
            if let Err(e) = self.guarded(self.process_user(&unit)).await {
                warn!(login = %unit.login, error = %e, "user unit failed; requeueing");
                self.queue.add_user_retry(unit.clone());
            }
            self.queue.mark_processed(&unit);
            return true;
        }

        false
    }

    /// Runs one unit under the stall watchdog.
    async fn guarded<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let stall = CancellationToken::new();
        let watchdog = tokio::spawn(watchdog(stall.clone()));

        let result = tokio::select! {
            result = work => result,
            _ = stall.cancelled() => Err(WorkerError::Stalled),
        };

        watchdog.abort();
        result
    }

    // ─── Unit processing ──────────────────────────────────────────────────────

    /// Resolves an owner's repositories, queues each accepted repository,
    /// and persists the owner's repository list.
    pub(crate) async fn process_owner(&self, unit: &OwnerUnit) -> Result<()> {
        let owner = &unit.owner;

        if !self.filter.process_owner(owner) {
            return Ok(());
        }

        info!(owner = %owner, "processing owner");

        let repositories: Vec<QueuedRepo> = match &unit.repos {
            Some(preresolved) => preresolved.clone(),
            None => {
                let listed = if owner.is_org() {
                    self.platform.list_org_repositories(owner.name()).await?
                } else {
                    self.platform.list_user_repositories(owner.name()).await?
                };
                listed
                    .into_iter()
                    .map(|r| QueuedRepo {
                        name: r.name,
                        id: r.id,
                    })
                    .collect()
            }
        };

        let mut accepted_names = Vec::new();
        for repo in repositories {
            if !self.filter.process_repo(owner, &repo.name) {
                continue;
            }
            accepted_names.push(repo.name.clone());
            self.queue.add_repository(RepoUnit {
                owner: owner.clone(),
                repo,
            });
        }

        match owner {
            Owner::Org(name) => self.store.put_organization(&OrganizationRecord {
                name: name.clone(),
                repositories: accepted_names,
            })?,
            Owner::User(name) => self.store.put_user_repositories(&UserRepositoriesRecord {
                user_name: name.clone(),
                repo_names: accepted_names,
            })?,
        }

        Ok(())
    }

    /// Walks all issues of a repository, queues the accepted non-PR issues,
    /// and persists the repository record with the observed issue range.
    pub(crate) async fn process_repository(&self, unit: &RepoUnit) -> Result<()> {
        let owner = &unit.owner;
        let repo_name = &unit.repo.name;

        if !self.filter.process_repo(owner, repo_name) {
            return Ok(());
        }

        info!(owner = %owner, repo = %repo_name, "processing repository");

        let mut smallest: Option<i64> = None;
        let mut largest: Option<i64> = None;

        for page in 1u32.. {
            let issues = self
                .platform
                .list_issues_page(owner.name(), repo_name, page)
                .await?;
            if issues.is_empty() {
                break;
            }

            for issue in issues {
                if issue.pull_request {
                    continue;
                }
                if !self.filter.process_issue(owner, repo_name, issue.number) {
                    continue;
                }

                smallest = Some(smallest.map_or(issue.number, |s: i64| s.min(issue.number)));
                largest = Some(largest.map_or(issue.number, |l: i64| l.max(issue.number)));

                self.queue.add_issue(IssueUnit {
                    owner: owner.clone(),
                    repo_name: repo_name.clone(),
                    number: issue.number,
                });
            }
        }

        self.store.put_repository(&RepositoryRecord {
            name: repo_name.clone(),
            org_name: owner.org_name().map(str::to_string),
            owner_user_name: owner.user_name().map(str::to_string),
            repository_id: unit.repo.id,
            first_issue: smallest,
            last_issue: largest,
        })?;

        Ok(())
    }

    /// Mirrors one issue: the issue itself, its comments, its recognized
    /// events. Queues the involved users, bumps the repo's issue high-water
    /// mark, and emits a change event when the persisted form changed.
    pub(crate) async fn process_issue(&self, unit: &IssueUnit) -> Result<()> {
        let owner = &unit.owner;
        let repo_name = &unit.repo_name;
        let number = unit.number;

        if !self.filter.process_issue(owner, repo_name, number) {
            return Ok(());
        }

        let Some(issue) = self
            .platform
            .fetch_issue(owner.name(), repo_name, number)
            .await?
        else {
            debug!(owner = %owner, repo = %repo_name, issue = number, "issue gone upstream");
            return Ok(());
        };

        // Pull requests are never persisted, regardless of how the unit got
        // queued.
        if issue.pull_request {
            return Ok(());
        }

        info!(owner = %owner, repo = %repo_name, issue = number, "processing issue");

        let reporter = sanitize_login(issue.reporter_login.as_deref());
        if let Some(login) = &issue.reporter_login
            && self.filter.process_user(login)
        {
            self.queue.add_user(UserUnit {
                login: login.clone(),
            });
        }

        let mut assignees: Vec<String> = Vec::new();
        for login in issue.assignee_logins.iter().flatten() {
            if assignees.iter().any(|a| a == login) {
                continue;
            }
            assignees.push(login.clone());
            if self.filter.process_user(login) {
                self.queue.add_user(UserUnit {
                    login: login.clone(),
                });
            }
        }

        let comments: Vec<IssueCommentRecord> = self
            .platform
            .list_issue_comments(owner.name(), repo_name, number)
            .await?
            .into_iter()
            .map(|c| IssueCommentRecord {
                user_login: sanitize_login(c.user_login.as_deref()),
                body: c.body,
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect();

        let mut issue_events = Vec::new();
        if self.filter.process_issue_events(owner, repo_name, number) {
            for event in self
                .platform
                .list_issue_events(owner.name(), repo_name, number)
                .await?
            {
                if let Some(record) = convert_issue_event(event) {
                    issue_events.push(record);
                }
            }
        }

        let record = IssueRecord {
            parent_repo: repo_name.clone(),
            number,
            title: issue.title,
            body: issue.body,
            html_url: issue.html_url,
            reporter,
            assignees,
            labels: issue.labels,
            created_at: issue.created_at,
            closed_at: issue.closed_at,
            pull_request: issue.pull_request,
            closed: issue.closed,
            comments,
            issue_events,
        };

        let previous = self.store.get_issue(owner, repo_name, number)?;
        self.store.put_issue(owner, &record)?;

        // A newly-appeared issue raises the repo's high-water mark.
        if let Some(mut repo_record) = self.store.get_repository(owner, repo_name)?
            && let Some(last) = repo_record.last_issue
            && last < number
        {
            debug!(repo = %repo_name, from = last, to = number, "updating last issue");
            repo_record.last_issue = Some(number);
            self.store.put_repository(&repo_record)?;
        }

        if !crate::canonical::canonically_equal(previous.as_ref(), Some(&record))? {
            let change = ResourceChangeEvent {
                time: chrono::Utc::now().timestamp_millis(),
                uuid: uuid::Uuid::new_v4().to_string(),
                owner: owner.name().to_string(),
                repo: repo_name.clone(),
                issue_number: number,
            };
            self.store.append_change_events(std::slice::from_ref(&change))?;

            let json = serde_json::to_string(&record)?;
            self.file_log.out(&format!(
                "resource-change-event: {} {} {}",
                change.time, change.uuid, json
            ));
        }

        Ok(())
    }

    /// Persists one user profile. A profile without a login is a no-op.
    pub(crate) async fn process_user(&self, unit: &UserUnit) -> Result<()> {
        if !self.filter.process_user(&unit.login) {
            return Ok(());
        }

        let Some(user) = self.platform.fetch_user(&unit.login).await? else {
            return Ok(());
        };
        let Some(login) = user.login else {
            return Ok(());
        };

        info!(login = %login, "processing user");

        self.store.put_user(&UserRecord {
            login,
            name: user.name,
            email: user.email,
        })?;

        Ok(())
    }
}

/// Per-unit watchdog: wakes periodically and cancels the unit once the
/// expiry has passed without completion.
async fn watchdog(stall: CancellationToken) {
    let expiry = Instant::now() + STALL_EXPIRY;
    loop {
        tokio::time::sleep(WATCHDOG_INTERVAL).await;
        if Instant::now() >= expiry {
            warn!("watchdog expired; interrupting worker unit");
            stall.cancel();
            return;
        }
    }
}

/// Converts an upstream issue event into its persisted form. Unrecognized
/// kinds return `None` and are dropped.
fn convert_issue_event(event: crate::platform::IssueEventData) -> Option<IssueEventRecord> {
    let actor_user_login = sanitize_login(event.actor_login.as_deref());
    let header = |data| IssueEventRecord {
        event_type: event.kind.clone(),
        created_at: event.created_at,
        actor_user_login: actor_user_login.clone(),
        data,
    };

    match event.kind.as_str() {
        "assigned" | "unassigned" => Some(header(Some(IssueEventDetail::AssignedUnassigned {
            assignee: sanitize_login(event.assignee_login.as_deref()),
            assigner: sanitize_login(event.assigner_login.as_deref()),
            assigned: event.kind == "assigned",
        }))),
        "labeled" | "unlabeled" => Some(header(Some(IssueEventDetail::LabeledUnlabeled {
            label: event.label.clone().unwrap_or_default(),
            labeled: event.kind == "labeled",
        }))),
        "renamed" => Some(header(Some(IssueEventDetail::Renamed {
            from: event.rename_from.clone().unwrap_or_default(),
            to: event.rename_to.clone().unwrap_or_default(),
        }))),
        "reopened" | "merged" | "closed" => Some(header(None)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PermissiveFilter;
    use crate::platform::{CommentData, IssueEventData, NoQuota};
    use crate::store::JsonStore;
    use crate::test_utils::{FixturePlatform, basic_issue, ts};
    use tempfile::tempdir;

    fn worker(platform: Arc<FixturePlatform>, store: Arc<dyn Store>) -> Worker {
        Worker {
            queue: Arc::new(WorkQueue::new(
                Arc::new(NoQuota),
                36_000_000,
                Duration::ZERO,
            )),
            store,
            platform,
            filter: Arc::new(PermissiveFilter),
            file_log: Arc::new(FileLog::disabled()),
        }
    }

    fn org(name: &str) -> Owner {
        Owner::org(name).unwrap()
    }

    /// Drains the queue through the worker until nothing is left, riding out
    /// momentarily-closed pacing gates.
    async fn drain(worker: &Worker) {
        loop {
            if worker.step().await {
                continue;
            }
            if worker.queue.available_work() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn owner_unit_lists_repos_and_persists_org() {
        let platform = Arc::new(FixturePlatform::new());
        platform.add_org_repo("microclimate-dev2ops", "microclimate-vscode-tools", 10);

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());

        worker
            .process_owner(&OwnerUnit::org_or_user(org("microclimate-dev2ops")))
            .await
            .unwrap();

        let record = store
            .get_organization("microclimate-dev2ops")
            .unwrap()
            .unwrap();
        assert_eq!(record.repositories, vec!["microclimate-vscode-tools"]);
        assert_eq!(worker.queue.available_work(), 1);
    }

    #[tokio::test]
    async fn repository_unit_records_issue_range_and_skips_prs() {
        let platform = Arc::new(FixturePlatform::new());
        platform.add_org_repo("eclipse", "che", 7);
        platform.put_issue("eclipse", "che", basic_issue(3, 103, "eclipse", "che", "three"));
        platform.put_issue("eclipse", "che", basic_issue(9, 109, "eclipse", "che", "nine"));
        let mut pr = basic_issue(11, 111, "eclipse", "che", "a pr");
        pr.pull_request = true;
        platform.put_issue("eclipse", "che", pr);

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());

        worker
            .process_repository(&RepoUnit {
                owner: org("eclipse"),
                repo: QueuedRepo {
                    name: "che".into(),
                    id: 7,
                },
            })
            .await
            .unwrap();

        let record = store.get_repository(&org("eclipse"), "che").unwrap().unwrap();
        assert_eq!(record.first_issue, Some(3));
        assert_eq!(record.last_issue, Some(9));
        assert_eq!(record.repository_id, 7);
        // Two issue units queued; the PR was skipped.
        assert_eq!(worker.queue.available_work(), 2);
    }

    #[tokio::test]
    async fn issue_unit_persists_full_record() {
        let platform = Arc::new(FixturePlatform::new());
        let mut issue = basic_issue(26, 126, "microclimate-dev2ops", "microclimate-vscode-tools", "Document it");
        issue.labels = vec!["bug".into()];
        issue.assignee_logins = vec![Some("jgwest".into()), Some("jgwest".into()), None];
        platform.put_issue("microclimate-dev2ops", "microclimate-vscode-tools", issue);
        platform.set_comments(
            "microclimate-dev2ops",
            "microclimate-vscode-tools",
            26,
            vec![CommentData {
                user_login: None,
                body: Some("first".into()),
                created_at: ts(1_500_000_100),
                updated_at: None,
            }],
        );
        platform.set_issue_events(
            "microclimate-dev2ops",
            "microclimate-vscode-tools",
            26,
            vec![
                IssueEventData {
                    kind: "labeled".into(),
                    created_at: ts(1_500_000_200),
                    actor_login: Some("jgwest".into()),
                    assignee_login: None,
                    assigner_login: None,
                    label: Some("bug".into()),
                    rename_from: None,
                    rename_to: None,
                },
                IssueEventData {
                    kind: "subscribed".into(),
                    created_at: ts(1_500_000_300),
                    actor_login: Some("jgwest".into()),
                    assignee_login: None,
                    assigner_login: None,
                    label: None,
                    rename_from: None,
                    rename_to: None,
                },
            ],
        );

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());
        let owner = org("microclimate-dev2ops");

        worker
            .process_issue(&IssueUnit {
                owner: owner.clone(),
                repo_name: "microclimate-vscode-tools".into(),
                number: 26,
            })
            .await
            .unwrap();

        let record = store
            .get_issue(&owner, "microclimate-vscode-tools", 26)
            .unwrap()
            .unwrap();
        assert!(record.body.as_deref().unwrap().contains("Document it"));
        // Assignees deduplicated; absent login dropped.
        assert_eq!(record.assignees, vec!["jgwest"]);
        // Ghost normalization on the comment author.
        assert_eq!(record.comments[0].user_login, "Ghost");
        // Unrecognized "subscribed" event dropped; "labeled" kept.
        assert_eq!(record.issue_events.len(), 1);
        assert_eq!(record.issue_events[0].event_type, "labeled");

        // Exactly one change event for the fresh write.
        let changes = store.read_recent_change_events(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].issue_number, 26);
    }

    #[tokio::test]
    async fn unchanged_issue_emits_no_second_change_event() {
        let platform = Arc::new(FixturePlatform::new());
        platform.put_issue("eclipse", "che", basic_issue(1, 101, "eclipse", "che", "body"));

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());
        let unit = IssueUnit {
            owner: org("eclipse"),
            repo_name: "che".into(),
            number: 1,
        };

        worker.process_issue(&unit).await.unwrap();
        worker.process_issue(&unit).await.unwrap();

        assert_eq!(store.read_recent_change_events(0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_issue_emits_exactly_one_more_change_event() {
        let platform = Arc::new(FixturePlatform::new());
        let mut issue = basic_issue(1, 101, "eclipse", "che", "body");
        issue.labels = vec!["bug".into(), "help wanted".into()];
        platform.put_issue("eclipse", "che", issue.clone());

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform.clone(), store.clone());
        let unit = IssueUnit {
            owner: org("eclipse"),
            repo_name: "che".into(),
            number: 1,
        };

        worker.process_issue(&unit).await.unwrap();

        // A label disappears upstream between scans.
        issue.labels = vec!["bug".into()];
        platform.put_issue("eclipse", "che", issue);
        worker.process_issue(&unit).await.unwrap();

        let changes = store.read_recent_change_events(0).unwrap();
        assert_eq!(changes.len(), 2);

        let record = store.get_issue(&org("eclipse"), "che", 1).unwrap().unwrap();
        assert_eq!(record.labels, vec!["bug"]);
    }

    #[tokio::test]
    async fn pull_request_is_never_persisted() {
        let platform = Arc::new(FixturePlatform::new());
        let mut pr = basic_issue(5, 105, "eclipse", "che", "pr body");
        pr.pull_request = true;
        platform.put_issue("eclipse", "che", pr);

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());

        worker
            .process_issue(&IssueUnit {
                owner: org("eclipse"),
                repo_name: "che".into(),
                number: 5,
            })
            .await
            .unwrap();

        assert!(store.get_issue(&org("eclipse"), "che", 5).unwrap().is_none());
        assert!(store.read_recent_change_events(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_issue_bumps_repo_high_water_mark() {
        let platform = Arc::new(FixturePlatform::new());
        platform.put_issue("eclipse", "che", basic_issue(30, 130, "eclipse", "che", "late"));

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        store
            .put_repository(&RepositoryRecord {
                name: "che".into(),
                org_name: Some("eclipse".into()),
                owner_user_name: None,
                repository_id: 7,
                first_issue: Some(1),
                last_issue: Some(20),
            })
            .unwrap();

        let worker = worker(platform, store.clone());
        worker
            .process_issue(&IssueUnit {
                owner: org("eclipse"),
                repo_name: "che".into(),
                number: 30,
            })
            .await
            .unwrap();

        let record = store.get_repository(&org("eclipse"), "che").unwrap().unwrap();
        assert_eq!(record.last_issue, Some(30));
    }

    #[tokio::test]
    async fn user_unit_persists_profile() {
        let platform = Arc::new(FixturePlatform::new());
        platform.set_user_profile("jgwest", Some("Jonathan"), Some("jgwest@example.com"));

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());

        worker
            .process_user(&UserUnit {
                login: "jgwest".into(),
            })
            .await
            .unwrap();

        let user = store.get_user("jgwest").unwrap().unwrap();
        assert_eq!(user.name.as_deref(), Some("Jonathan"));
        assert_eq!(user.email.as_deref(), Some("jgwest@example.com"));
    }

    #[tokio::test]
    async fn failed_issue_is_requeued_and_retried() {
        let platform = Arc::new(FixturePlatform::new());
        platform.put_issue("eclipse", "che", basic_issue(1, 101, "eclipse", "che", "body"));
        platform.fail_issue_fetches("eclipse", "che", 1, 1);

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());

        worker.queue.add_issue(IssueUnit {
            owner: org("eclipse"),
            repo_name: "che".into(),
            number: 1,
        });

        // First step fails and requeues; second step succeeds.
        drain(&worker).await;

        assert!(store.get_issue(&org("eclipse"), "che", 1).unwrap().is_some());
        assert_eq!(worker.queue.available_work() + worker.queue.active_resources(), 0);
    }

    #[tokio::test]
    async fn full_pipeline_drains_owner_to_users() {
        let platform = Arc::new(FixturePlatform::new());
        platform.add_org_repo("eclipse", "che", 7);
        platform.put_issue("eclipse", "che", basic_issue(1, 101, "eclipse", "che", "body"));
        platform.set_user_profile("octocat", Some("The Octocat"), None);

        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(JsonStore::new(dir.path()));
        let worker = worker(platform, store.clone());

        worker
            .queue
            .add_owner(OwnerUnit::org_or_user(org("eclipse")));
        drain(&worker).await;

        assert!(store.get_organization("eclipse").unwrap().is_some());
        assert!(store.get_repository(&org("eclipse"), "che").unwrap().is_some());
        assert!(store.get_issue(&org("eclipse"), "che", 1).unwrap().is_some());
        assert!(store.get_user("octocat").unwrap().is_some());
        assert_eq!(worker.queue.available_work() + worker.queue.active_resources(), 0);
    }

    #[test]
    fn unrecognized_event_kinds_are_dropped() {
        let event = IssueEventData {
            kind: "milestoned".into(),
            created_at: ts(0),
            actor_login: None,
            assignee_login: None,
            assigner_login: None,
            label: None,
            rename_from: None,
            rename_to: None,
        };
        assert!(convert_issue_event(event).is_none());
    }

    #[test]
    fn assigned_event_carries_ghost_for_missing_users() {
        let event = IssueEventData {
            kind: "assigned".into(),
            created_at: ts(0),
            actor_login: None,
            assignee_login: None,
            assigner_login: Some("chetan-rns".into()),
            label: None,
            rename_from: None,
            rename_to: None,
        };
        let record = convert_issue_event(event).unwrap();
        assert_eq!(record.actor_user_login, "Ghost");
        match record.data.unwrap() {
            IssueEventDetail::AssignedUnassigned {
                assignee,
                assigner,
                assigned,
            } => {
                assert_eq!(assignee, "Ghost");
                assert_eq!(assigner, "chetan-rns");
                assert!(assigned);
            }
            other => panic!("unexpected detail: {:?}", other),
        }
    }
}
