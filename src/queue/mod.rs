//! Deduplicated work queue with adaptive request pacing.
//!
//! The queue holds four ordered lists of pending units (owners,
//! repositories, issues, users) plus the set of units currently being
//! processed. Workers poll by kind; the scheduler watches
//! `available_work() + active_resources()` drop to zero to conclude a scan
//! has drained.
//!
//! # Pacing
//!
//! Every upstream call in the engine passes through this queue's gate: a
//! `next_work_available_at` deadline that polls respect and that advances
//! after every successful poll (or voluntary [`WorkQueue::wait_if_needed`]).
//! With a quota snapshot available the gate spreads the remaining quota
//! across the window (capped at 10 s per step); without one it falls back to
//! a fixed per-request budget derived from the configured hourly limit.
//!
//! Per-kind request estimates reflect the average upstream cost of
//! processing one unit of that kind.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::platform::{QuotaSnapshot, QuotaSource};
use crate::types::Owner;

/// Estimated upstream requests consumed by one unit, per kind.
const ESTIMATE_OWNER: u32 = 5;
const ESTIMATE_REPOSITORY: u32 = 20;
const ESTIMATE_ISSUE: u32 = 3;
const ESTIMATE_USER: u32 = 1;

/// Requests held back from the reported remaining quota as headroom.
const QUOTA_RESERVE: i64 = 250;

/// Upper bound on a single quota-aware pacing step.
const MAX_QUOTA_WAIT_SECS: i64 = 10;

/// Poll interval for the blocking waits.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// A repository as carried inside queue units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRepo {
    pub name: String,
    pub id: i64,
}

/// An owner unit: an org, a user, or a preresolved list of individual repos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerUnit {
    pub owner: Owner,

    /// `Some` for repo-list owners (individually configured repositories);
    /// `None` for orgs and users, whose repositories are listed upstream.
    pub repos: Option<Vec<QueuedRepo>>,
}

impl OwnerUnit {
    pub fn org_or_user(owner: Owner) -> Self {
        OwnerUnit { owner, repos: None }
    }

    pub fn repo_list(owner: Owner, repos: Vec<QueuedRepo>) -> Self {
        OwnerUnit {
            owner,
            repos: Some(repos),
        }
    }
}

/// A repository unit: scan the repo's issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUnit {
    pub owner: Owner,
    pub repo: QueuedRepo,
}

/// An issue unit: mirror one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueUnit {
    pub owner: Owner,
    pub repo_name: String,
    pub number: i64,
}

/// A user unit: mirror one user profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUnit {
    pub login: String,
}

/// Structural identity of a queued unit, used for deduplication and for
/// matching `mark_processed` calls against prior polls.
pub trait QueueKey {
    fn queue_key(&self) -> String;
}

impl QueueKey for OwnerUnit {
    fn queue_key(&self) -> String {
        let repos = match &self.repos {
            Some(repos) => {
                let mut full_names: Vec<String> = repos
                    .iter()
                    .map(|r| format!("{}/{}", self.owner.name(), r.name))
                    .collect();
                full_names.sort();
                full_names.join("/")
            }
            None => "null".to_string(),
        };
        format!(
            "owner-{}-{}-{}",
            or_null(self.owner.org_name()),
            or_null(self.owner.user_name()),
            repos
        )
    }
}

impl QueueKey for RepoUnit {
    fn queue_key(&self) -> String {
        format!(
            "repo-{}-{}-{}",
            or_null(self.owner.org_name()),
            or_null(self.owner.user_name()),
            self.repo.name
        )
    }
}

impl QueueKey for IssueUnit {
    fn queue_key(&self) -> String {
        format!(
            "issue-{}-{}-{}-{}",
            or_null(self.owner.org_name()),
            or_null(self.owner.user_name()),
            self.repo_name,
            self.number
        )
    }
}

impl QueueKey for UserUnit {
    fn queue_key(&self) -> String {
        format!("user-{}", self.login)
    }
}

fn or_null(value: Option<&str>) -> &str {
    value.unwrap_or("null")
}

struct QueueState {
    owners: VecDeque<OwnerUnit>,
    repositories: VecDeque<RepoUnit>,
    issues: VecDeque<IssueUnit>,
    users: VecDeque<UserUnit>,

    /// Keys of units polled but not yet marked processed.
    active: HashSet<String>,

    /// Users are near-immutable, so each login is fetched at most once per
    /// process lifetime (except via the explicit retry path).
    ever_seen_users: HashSet<String>,

    next_work_available_at: Instant,

    accepting: bool,
}

/// The shared work queue. Thread safe; cheap to share via `Arc`.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    quota: Arc<dyn QuotaSource>,
    requests_per_hour: u32,
    pause_between_requests: Duration,
}

impl WorkQueue {
    pub fn new(
        quota: Arc<dyn QuotaSource>,
        requests_per_hour: u32,
        pause_between_requests: Duration,
    ) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState {
                owners: VecDeque::new(),
                repositories: VecDeque::new(),
                issues: VecDeque::new(),
                users: VecDeque::new(),
                active: HashSet::new(),
                ever_seen_users: HashSet::new(),
                next_work_available_at: Instant::now(),
                accepting: true,
            }),
            quota,
            requests_per_hour,
            pause_between_requests,
        }
    }

    // ─── Adding work ──────────────────────────────────────────────────────────

    pub fn add_owner(&self, unit: OwnerUnit) {
        let mut state = self.lock();
        let key = unit.queue_key();
        if !state.owners.iter().any(|u| u.queue_key() == key) {
            state.owners.push_back(unit);
        }
    }

    pub fn add_repository(&self, unit: RepoUnit) {
        let mut state = self.lock();
        let key = unit.queue_key();
        if !state.repositories.iter().any(|u| u.queue_key() == key) {
            state.repositories.push_back(unit);
        }
    }

    pub fn add_issue(&self, unit: IssueUnit) {
        let mut state = self.lock();
        let key = unit.queue_key();
        if !state.issues.iter().any(|u| u.queue_key() == key) {
            state.issues.push_back(unit);
        }
    }

    /// Adds a user unless this login was already fetched this process.
    pub fn add_user(&self, unit: UserUnit) {
        let mut state = self.lock();
        if state.ever_seen_users.contains(&unit.login) {
            return;
        }
        let key = unit.queue_key();
        if !state.users.iter().any(|u| u.queue_key() == key) {
            state.ever_seen_users.insert(unit.login.clone());
            state.users.push_back(unit);
        }
    }

    /// Re-adds a user after a failed fetch, bypassing the once-per-process
    /// rule (but not the pending-list dedup).
    pub fn add_user_retry(&self, unit: UserUnit) {
        let mut state = self.lock();
        let key = unit.queue_key();
        if !state.users.iter().any(|u| u.queue_key() == key) {
            state.ever_seen_users.insert(unit.login.clone());
            state.users.push_back(unit);
        }
    }

    // ─── Polling ──────────────────────────────────────────────────────────────

    pub fn poll_owner(&self) -> Option<OwnerUnit> {
        let mut state = self.lock();
        if !self.can_poll(&state) || state.owners.is_empty() {
            return None;
        }
        self.advance_gate(&mut state, ESTIMATE_OWNER);
        let unit = state.owners.pop_front()?;
        state.active.insert(unit.queue_key());
        Some(unit)
    }

    pub fn poll_repository(&self) -> Option<RepoUnit> {
        let mut state = self.lock();
        if !self.can_poll(&state) || state.repositories.is_empty() {
            return None;
        }
        self.advance_gate(&mut state, ESTIMATE_REPOSITORY);
        let unit = state.repositories.pop_front()?;
        state.active.insert(unit.queue_key());
        Some(unit)
    }

    pub fn poll_issue(&self) -> Option<IssueUnit> {
        let mut state = self.lock();
        if !self.can_poll(&state) || state.issues.is_empty() {
            return None;
        }
        self.advance_gate(&mut state, ESTIMATE_ISSUE);
        let unit = state.issues.pop_front()?;
        state.active.insert(unit.queue_key());
        Some(unit)
    }

    pub fn poll_user(&self) -> Option<UserUnit> {
        let mut state = self.lock();
        if !self.can_poll(&state) || state.users.is_empty() {
            return None;
        }
        self.advance_gate(&mut state, ESTIMATE_USER);
        let unit = state.users.pop_front()?;
        state.active.insert(unit.queue_key());
        Some(unit)
    }

    /// Marks a previously polled unit as handled (successfully or not).
    ///
    /// # Panics
    ///
    /// Panics when the unit was never polled (or was already marked): that is
    /// a bookkeeping bug that would silently break drain detection.
    pub fn mark_processed<U: QueueKey>(&self, unit: &U) {
        let mut state = self.lock();
        let key = unit.queue_key();
        if !state.active.remove(&key) {
            panic!("mark_processed without a matching poll: {}", key);
        }
    }

    // ─── Observation ──────────────────────────────────────────────────────────

    /// Total units pending across all four lists.
    pub fn available_work(&self) -> usize {
        let state = self.lock();
        state.owners.len() + state.repositories.len() + state.issues.len() + state.users.len()
    }

    /// Units polled but not yet marked processed.
    pub fn active_resources(&self) -> usize {
        self.lock().active.len()
    }

    /// Stops further polling. Work already in flight still completes (or is
    /// requeued by its worker's failure path).
    pub fn stop_accepting(&self) {
        self.lock().accepting = false;
    }

    // ─── Waiting ──────────────────────────────────────────────────────────────

    /// Parks until the pacing gate is open and at least one list is
    /// non-empty. Callers that need cancellation select against their own
    /// token.
    pub async fn wait_for_available_work(&self) {
        loop {
            {
                let state = self.lock();
                if self.gate_open(&state) && !all_empty(&state) {
                    return;
                }
            }
            tokio::time::sleep(WAIT_SLICE).await;
        }
    }

    /// Charges `estimated_requests` against the gate and sleeps until it
    /// reopens. Used by the event scanner to pace its own upstream calls.
    pub async fn wait_if_needed(&self, estimated_requests: u32) {
        let deadline = {
            let mut state = self.lock();
            self.advance_gate(&mut state, estimated_requests)
        };
        while Instant::now() < deadline {
            tokio::time::sleep(WAIT_SLICE).await;
        }
    }

    // ─── Internal ─────────────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn gate_open(&self, state: &QueueState) -> bool {
        Instant::now() >= state.next_work_available_at
    }

    fn can_poll(&self, state: &QueueState) -> bool {
        state.accepting && self.gate_open(state)
    }

    fn advance_gate(&self, state: &mut QueueState, estimated_requests: u32) -> Instant {
        let wait = pacing_wait(
            self.quota.quota_snapshot(),
            estimated_requests,
            self.requests_per_hour,
            self.pause_between_requests,
        );
        if wait > Duration::from_secs(5) {
            debug!(wait_ms = wait.as_millis() as u64, "pacing gate closing");
        }
        state.next_work_available_at = Instant::now() + wait;
        state.next_work_available_at
    }
}

/// Computes the pacing delay for one gate advance.
///
/// Quota-aware: spread the remaining quota (minus a fixed reserve) across the
/// window so consumption tracks the target requests-per-second; a computed
/// zero falls back to `estimate × pause`. Quota-blind: a fixed per-request
/// budget from the configured hourly limit.
fn pacing_wait(
    quota: Option<QuotaSnapshot>,
    estimated_requests: u32,
    requests_per_hour: u32,
    pause_between_requests: Duration,
) -> Duration {
    match quota {
        Some(snapshot) => {
            let remaining = (snapshot.remaining - QUOTA_RESERVE).max(1);
            let seconds_to_reset = snapshot.seconds_to_reset.max(0);

            let target_rps = snapshot.total_hourly_limit as f64 / 3600.0;
            let wait_seconds = (seconds_to_reset - (remaining as f64 / target_rps) as i64)
                .clamp(0, MAX_QUOTA_WAIT_SECS);

            if wait_seconds == 0 {
                pause_between_requests * estimated_requests
            } else {
                Duration::from_secs(wait_seconds as u64)
            }
        }
        None => {
            let per_request = 3600.0 / requests_per_hour.max(1) as f64;
            Duration::from_secs_f64(per_request * estimated_requests as f64)
        }
    }
}

fn all_empty(state: &QueueState) -> bool {
    state.owners.is_empty()
        && state.repositories.is_empty()
        && state.issues.is_empty()
        && state.users.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NoQuota;
    use proptest::prelude::*;

    /// Quota source returning a fixed snapshot.
    struct StaticQuota(Option<QuotaSnapshot>);

    impl QuotaSource for StaticQuota {
        fn quota_snapshot(&self) -> Option<QuotaSnapshot> {
            self.0
        }
    }

    fn open_queue() -> WorkQueue {
        // High hourly limit keeps the gate effectively open between polls.
        WorkQueue::new(Arc::new(NoQuota), 36_000_000, Duration::ZERO)
    }

    fn owner(name: &str) -> Owner {
        Owner::org(name).unwrap()
    }

    fn issue_unit(repo: &str, number: i64) -> IssueUnit {
        IssueUnit {
            owner: owner("eclipse"),
            repo_name: repo.to_string(),
            number,
        }
    }

    #[test]
    fn issues_are_fifo_and_deduplicated() {
        let queue = open_queue();

        queue.add_issue(issue_unit("che", 1));
        queue.add_issue(issue_unit("che", 2));
        queue.add_issue(issue_unit("che", 1)); // duplicate

        assert_eq!(queue.available_work(), 2);
        assert_eq!(queue.poll_issue().unwrap().number, 1);
        assert_eq!(queue.poll_issue().unwrap().number, 2);
        assert!(queue.poll_issue().is_none());
    }

    #[test]
    fn user_is_fetched_once_per_process() {
        let queue = open_queue();

        queue.add_user(UserUnit {
            login: "octocat".into(),
        });
        let unit = queue.poll_user().unwrap();
        queue.mark_processed(&unit);

        // A second add of the same login is ignored...
        queue.add_user(UserUnit {
            login: "octocat".into(),
        });
        assert!(queue.poll_user().is_none());

        // ...unless it comes through the retry path.
        queue.add_user_retry(UserUnit {
            login: "octocat".into(),
        });
        assert!(queue.poll_user().is_some());
    }

    #[test]
    fn retry_does_not_duplicate_pending_user() {
        let queue = open_queue();

        queue.add_user(UserUnit {
            login: "octocat".into(),
        });
        queue.add_user_retry(UserUnit {
            login: "octocat".into(),
        });
        assert_eq!(queue.available_work(), 1);
    }

    #[test]
    fn active_tracking_and_drain_sentinel() {
        let queue = open_queue();

        queue.add_issue(issue_unit("che", 1));
        assert_eq!(queue.available_work(), 1);
        assert_eq!(queue.active_resources(), 0);

        let unit = queue.poll_issue().unwrap();
        assert_eq!(queue.available_work(), 0);
        assert_eq!(queue.active_resources(), 1);

        queue.mark_processed(&unit);
        assert_eq!(queue.available_work() + queue.active_resources(), 0);
    }

    #[test]
    #[should_panic(expected = "mark_processed without a matching poll")]
    fn mark_processed_without_poll_panics() {
        let queue = open_queue();
        queue.mark_processed(&issue_unit("che", 1));
    }

    #[test]
    fn stop_accepting_turns_off_polling() {
        let queue = open_queue();
        queue.add_issue(issue_unit("che", 1));

        queue.stop_accepting();
        assert!(queue.poll_issue().is_none());
        // The unit is still there; it was never polled.
        assert_eq!(queue.available_work(), 1);
    }

    #[test]
    fn gate_closes_after_poll() {
        // remaining is tiny and the reset is far away, so the quota-aware
        // formula yields the 10 s cap.
        let quota = StaticQuota(Some(QuotaSnapshot {
            remaining: 300,
            seconds_to_reset: 3000,
            total_hourly_limit: 5000,
        }));
        let queue = WorkQueue::new(Arc::new(quota), 5000, Duration::from_millis(100));

        queue.add_issue(issue_unit("che", 1));
        queue.add_issue(issue_unit("che", 2));

        assert!(queue.poll_issue().is_some());
        // Gate is now closed for ~10 s; the second poll comes back empty.
        assert!(queue.poll_issue().is_none());
        assert_eq!(queue.available_work(), 1);
    }

    #[test]
    fn owner_keys_distinguish_repo_lists() {
        let plain = OwnerUnit::org_or_user(owner("eclipse"));
        let with_repos = OwnerUnit::repo_list(
            owner("eclipse"),
            vec![QueuedRepo {
                name: "che".into(),
                id: 1,
            }],
        );
        assert_ne!(plain.queue_key(), with_repos.queue_key());
    }

    #[test]
    fn repo_list_key_is_order_insensitive() {
        let a = OwnerUnit::repo_list(
            owner("eclipse"),
            vec![
                QueuedRepo {
                    name: "che".into(),
                    id: 1,
                },
                QueuedRepo {
                    name: "codewind".into(),
                    id: 2,
                },
            ],
        );
        let b = OwnerUnit::repo_list(
            owner("eclipse"),
            vec![
                QueuedRepo {
                    name: "codewind".into(),
                    id: 2,
                },
                QueuedRepo {
                    name: "che".into(),
                    id: 1,
                },
            ],
        );
        assert_eq!(a.queue_key(), b.queue_key());
    }

    // ─── Pacing formula ───

    #[test]
    fn quota_blind_wait_is_proportional() {
        // Issue estimate 3 at 3600 requests/hour: 3 × 1 s.
        let wait = pacing_wait(None, 3, 3600, Duration::from_millis(100));
        assert_eq!(wait, Duration::from_secs(3));
    }

    #[test]
    fn quota_aware_ahead_of_budget_waits() {
        // 4750 effective remaining at ~1.39 rps target covers ~3400 s; with
        // 3600 s to reset we are ~180 s ahead, clamped to 10 s.
        let quota = Some(QuotaSnapshot {
            remaining: 5000,
            seconds_to_reset: 3600,
            total_hourly_limit: 5000,
        });
        let wait = pacing_wait(quota, 3, 5000, Duration::from_millis(100));
        assert_eq!(wait, Duration::from_secs(10));
    }

    #[test]
    fn quota_aware_behind_budget_uses_pause_fallback() {
        // Plenty of quota, reset imminent: formula floors at zero and the
        // per-request pause takes over.
        let quota = Some(QuotaSnapshot {
            remaining: 5000,
            seconds_to_reset: 5,
            total_hourly_limit: 5000,
        });
        let wait = pacing_wait(quota, 3, 5000, Duration::from_millis(100));
        assert_eq!(wait, Duration::from_millis(300));
    }

    #[test]
    fn quota_reserve_floors_at_one() {
        // remaining below the reserve must not go negative or divide by zero.
        let quota = Some(QuotaSnapshot {
            remaining: 10,
            seconds_to_reset: 600,
            total_hourly_limit: 5000,
        });
        let wait = pacing_wait(quota, 1, 5000, Duration::from_millis(100));
        assert_eq!(wait, Duration::from_secs(10));
    }

    #[test]
    fn negative_seconds_to_reset_is_clamped() {
        let quota = Some(QuotaSnapshot {
            remaining: 5000,
            seconds_to_reset: -30,
            total_hourly_limit: 5000,
        });
        let wait = pacing_wait(quota, 2, 5000, Duration::from_millis(50));
        assert_eq!(wait, Duration::from_millis(100));
    }

    proptest! {
        /// Quota-blind spacing is exactly estimate × 3600/R seconds, which
        /// makes the sustained mean trivially converge to that value.
        #[test]
        fn prop_quota_blind_formula(
            estimate in 1u32..30,
            rph in 100u32..100_000,
        ) {
            let wait = pacing_wait(None, estimate, rph, Duration::ZERO);
            let expected = estimate as f64 * 3600.0 / rph as f64;
            let diff = (wait.as_secs_f64() - expected).abs();
            prop_assert!(diff < 1e-6);
        }

        /// The quota-aware step never exceeds the 10 s cap (when the pause
        /// fallback stays under it).
        #[test]
        fn prop_quota_wait_capped(
            remaining in 0i64..10_000,
            seconds in -100i64..100_000,
            limit in 1000i64..20_000,
        ) {
            let wait = pacing_wait(
                Some(QuotaSnapshot {
                    remaining,
                    seconds_to_reset: seconds,
                    total_hourly_limit: limit,
                }),
                1,
                5000,
                Duration::from_millis(100),
            );
            prop_assert!(wait <= Duration::from_secs(10));
        }
    }
}
