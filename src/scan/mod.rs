//! Event scanning: incremental up-to-date detection.
//!
//! Instead of rescanning every repository, the scanner reads the upstream
//! activity feeds to find which issues changed recently, and decides per
//! feed whether touching only those issues brings the mirror fully up to
//! date. Two termination conditions prove it can:
//!
//! - **Cached streak**: twenty consecutive events whose fingerprints are
//!   already in the processed set mean every remaining (older) event has
//!   been handled too.
//! - **Pre-scan timestamp**: an event older than the last full-scan start is
//!   already captured by that scan.
//!
//! If neither fires before the feed ends, there may be activity the feed no
//! longer covers, and a full scan is unavoidable.
//!
//! Fingerprints of newly-seen events are recorded regardless of the verdict;
//! they are knowledge about the feed either way.

pub mod fingerprint;
pub mod resolver;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::heartbeat::{ProgressHandle, TaskPanicked};
use crate::platform::{Platform, PlatformError};
use crate::queue::{IssueUnit, OwnerUnit, WorkQueue};
use crate::types::Owner;

use fingerprint::event_fingerprint;
use resolver::ScanResolver;

/// Consecutive already-processed events that prove the mirror is current.
const CACHED_STREAK_BAILOUT: usize = 20;

/// Issue-feed kinds that are noise for mirroring purposes.
const ISSUE_FEED_IGNORED_KINDS: [&str; 2] = ["subscribed", "mentioned"];

/// Issue-feed kinds the mirror persists; everything else is dropped.
const RECOGNIZED_ISSUE_EVENT_KINDS: [&str; 8] = [
    "assigned",
    "unassigned",
    "labeled",
    "unlabeled",
    "renamed",
    "reopened",
    "merged",
    "closed",
];

/// In-memory set of processed activity-event fingerprints.
///
/// Seeded from the store at startup, cleared when a full scan begins.
/// Shared between the scheduler (which persists and clears it) and the
/// scanner (which reads and extends it).
pub struct EventScanData {
    processed: Mutex<HashSet<String>>,
}

impl EventScanData {
    pub fn new(seed: Vec<String>) -> Self {
        EventScanData {
            processed: Mutex::new(seed.into_iter().collect()),
        }
    }

    /// Returns true when the fingerprint was newly added.
    pub fn add_if_not_present(&self, fingerprint: &str) -> bool {
        let mut processed = self.lock();
        processed.insert(fingerprint.to_string())
    }

    pub fn is_processed(&self, fingerprint: &str) -> bool {
        self.lock().contains(fingerprint)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.processed.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Result of scanning one owner (or one feed).
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Fingerprints first seen during this scan, for persisting.
    pub new_fingerprints: Vec<String>,

    /// Whether the feed evidence was insufficient and only a full scan can
    /// reach a correct state.
    pub full_scan_required: bool,
}

impl ScanOutcome {
    fn combine(mut self, other: ScanOutcome) -> ScanOutcome {
        let mut seen: HashSet<String> = self.new_fingerprints.iter().cloned().collect();
        for fingerprint in other.new_fingerprints {
            if seen.insert(fingerprint.clone()) {
                self.new_fingerprints.push(fingerprint);
            }
        }
        self.full_scan_required |= other.full_scan_required;
        self
    }
}

/// Errors surfaced by an event scan.
#[derive(Debug, Error)]
pub enum ScanError {
    /// An issue moved to a different owner. Cross-owner moves are not
    /// supported; the scan iteration is abandoned. Fingerprints collected
    /// before the offending event are carried in `partial`.
    #[error("issue moved across owners: {from_owner}/{repo}#{issue} -> {to_owner}")]
    CrossOwnerMove {
        from_owner: String,
        to_owner: String,
        repo: String,
        issue: i64,
        partial: ScanOutcome,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Panicked(#[from] TaskPanicked),
}

/// One feed event that needs its issue (re)mirrored.
struct ScanEntry {
    repo_name: String,
    issue_number: i64,
    issue_id: i64,
    fingerprint: String,
}

/// Per-feed bookkeeping while walking events newest-first.
struct FeedState {
    entries: Vec<ScanEntry>,
    cached_streak: usize,
    full_scan_required: bool,
    last_created_at_ms: Option<i64>,
}

enum FeedStep {
    Continue,
    Bailout,
}

impl FeedState {
    fn new() -> Self {
        FeedState {
            entries: Vec::new(),
            cached_streak: 0,
            full_scan_required: true,
            last_created_at_ms: None,
        }
    }

    /// Feeds are expected newest-first; upstream occasionally violates that.
    /// Out-of-order events are logged and processed anyway.
    fn note_ordering(&mut self, kind: &str, repo_name: &str, issue_number: i64, created_ms: i64) {
        if let Some(last) = self.last_created_at_ms
            && created_ms > last
        {
            info!(
                kind = kind,
                repo = repo_name,
                issue = issue_number,
                "received out-of-order event"
            );
        }
        self.last_created_at_ms = Some(created_ms);
    }

    fn observe(
        &mut self,
        data: &EventScanData,
        kind_token: &str,
        kind_label: &str,
        owner: &Owner,
        repo_name: &str,
        issue_number: i64,
        issue_id: i64,
        created_at: DateTime<Utc>,
        actor_login: Option<&str>,
    ) -> FeedStep {
        let created_ms = created_at.timestamp_millis();
        self.note_ordering(kind_label, repo_name, issue_number, created_ms);

        let fingerprint = event_fingerprint(
            kind_token,
            owner,
            repo_name,
            issue_number,
            created_ms,
            actor_login,
        );

        if data.is_processed(&fingerprint) {
            self.cached_streak += 1;
        } else {
            self.cached_streak = 0;
            self.entries.push(ScanEntry {
                repo_name: repo_name.to_string(),
                issue_number,
                issue_id,
                fingerprint,
            });
        }

        if self.cached_streak >= CACHED_STREAK_BAILOUT {
            // This run of events is already mirrored, so everything older
            // necessarily is too.
            self.full_scan_required = false;
            return FeedStep::Bailout;
        }

        FeedStep::Continue
    }

    /// Handles the pre-full-scan timestamp bailout. Returns `Bailout` when
    /// the event predates the last full scan.
    fn check_cutoff(&mut self, created_at: DateTime<Utc>, last_full_scan_ms: i64) -> FeedStep {
        if created_at.timestamp_millis() < last_full_scan_ms {
            if self.full_scan_required {
                debug!(
                    created_at = %created_at,
                    "event predates the last full scan; feed is fully covered"
                );
            }
            self.full_scan_required = false;
            return FeedStep::Bailout;
        }
        FeedStep::Continue
    }
}

/// Scans one configured owner: the owner's activity feed, then every
/// repository's issue-events feed.
///
/// Transient faults on a single feed are logged and the scan continues with
/// the next feed; a cross-owner move aborts the remaining feeds.
pub async fn scan_owner(
    platform: &Arc<dyn Platform>,
    unit: &OwnerUnit,
    data: &EventScanData,
    queue: &WorkQueue,
    last_full_scan_ms: i64,
    progress: &ProgressHandle,
) -> Result<ScanOutcome, ScanError> {
    let mut resolver = ScanResolver::new(platform.clone());

    // (repo, issue) pairs already queued during this scan run.
    let mut queued_issues: HashSet<String> = HashSet::new();

    let mut outcome = ScanOutcome::default();
    let owner = &unit.owner;

    // Phase one: the activity feed(s).
    let activity_feeds: Vec<Option<String>> = match &unit.repos {
        // Orgs and users have one owner-level feed.
        None => vec![None],
        // Repo-list owners have one feed per configured repository.
        Some(repos) => repos.iter().map(|r| Some(r.name.clone())).collect(),
    };

    for feed_repo in activity_feeds {
        let scanned = scan_activity_feed(
            platform,
            &mut resolver,
            owner,
            feed_repo.as_deref(),
            data,
            queue,
            last_full_scan_ms,
            progress,
            &mut queued_issues,
        )
        .await;
        outcome = merge_feed_result(outcome, scanned)?;
    }

    // Phase two: each repository's issue-events feed.
    let repos: Vec<String> = match &unit.repos {
        None => resolver
            .repositories(owner.is_org(), owner.name())
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect(),
        Some(repos) => repos.iter().map(|r| r.name.clone()).collect(),
    };

    for repo_name in repos {
        let scanned = scan_issue_feed(
            platform,
            &mut resolver,
            owner,
            &repo_name,
            data,
            queue,
            last_full_scan_ms,
            progress,
            &mut queued_issues,
        )
        .await;
        outcome = merge_feed_result(outcome, scanned)?;
    }

    Ok(outcome)
}

/// Folds one feed's result into the running outcome. Transient faults skip
/// the feed; cross-owner moves abort the scan with everything collected so
/// far attached.
fn merge_feed_result(
    outcome: ScanOutcome,
    feed_result: Result<ScanOutcome, ScanError>,
) -> Result<ScanOutcome, ScanError> {
    match feed_result {
        Ok(scanned) => Ok(outcome.combine(scanned)),
        Err(ScanError::CrossOwnerMove {
            from_owner,
            to_owner,
            repo,
            issue,
            partial,
        }) => Err(ScanError::CrossOwnerMove {
            from_owner,
            to_owner,
            repo,
            issue,
            partial: outcome.combine(partial),
        }),
        Err(ScanError::Platform(e)) if e.is_transient() => {
            info!(error = %e, "ignoring transient fault on feed; will rescan next pass");
            Ok(outcome)
        }
        Err(e) => Err(e),
    }
}

/// Walks one activity feed (owner-level or repo-level) newest-first.
#[allow(clippy::too_many_arguments)]
async fn scan_activity_feed(
    platform: &Arc<dyn Platform>,
    resolver: &mut ScanResolver,
    owner: &Owner,
    feed_repo: Option<&str>,
    data: &EventScanData,
    queue: &WorkQueue,
    last_full_scan_ms: i64,
    progress: &ProgressHandle,
    queued_issues: &mut HashSet<String>,
) -> Result<ScanOutcome, ScanError> {
    let mut state = FeedState::new();
    let mut event_count: u32 = 0;

    'feed: for page in 1u32.. {
        let events = match feed_repo {
            None => platform.owner_events_page(owner, page).await?,
            Some(repo) => platform.repo_events_page(owner.name(), repo, page).await?,
        };
        if events.is_empty() {
            break;
        }
        progress.ping();

        for event in events {
            event_count += 1;
            if event_count % 20 == 0 {
                queue.wait_if_needed(1).await;
            }

            if let FeedStep::Bailout = state.check_cutoff(event.created_at, last_full_scan_ms) {
                break 'feed;
            }

            if event.pull_request {
                continue;
            }

            let token = event.kind.ordinal().to_string();
            let step = state.observe(
                data,
                &token,
                &format!("{:?}", event.kind),
                owner,
                &event.repo_name,
                event.issue_number,
                event.issue_id,
                event.created_at,
                event.actor_login.as_deref(),
            );
            if let FeedStep::Bailout = step {
                break 'feed;
            }
        }
    }

    queue.wait_if_needed(event_count / 20).await;

    resolve_and_enqueue(state, owner, resolver, data, queue, queued_issues).await
}

/// Walks one repository's issue-events feed newest-first.
#[allow(clippy::too_many_arguments)]
async fn scan_issue_feed(
    platform: &Arc<dyn Platform>,
    resolver: &mut ScanResolver,
    owner: &Owner,
    repo_name: &str,
    data: &EventScanData,
    queue: &WorkQueue,
    last_full_scan_ms: i64,
    progress: &ProgressHandle,
    queued_issues: &mut HashSet<String>,
) -> Result<ScanOutcome, ScanError> {
    let mut state = FeedState::new();

    'feed: for page in 1u32.. {
        let events = platform
            .repo_issue_events_page(owner.name(), repo_name, page)
            .await?;
        if events.is_empty() {
            break;
        }
        progress.ping();
        queue.wait_if_needed(1).await;

        for event in events {
            if let FeedStep::Bailout = state.check_cutoff(event.created_at, last_full_scan_ms) {
                break 'feed;
            }

            if ISSUE_FEED_IGNORED_KINDS.contains(&event.kind.as_str()) {
                continue;
            }
            if !RECOGNIZED_ISSUE_EVENT_KINDS.contains(&event.kind.as_str()) {
                continue;
            }
            if event.pull_request {
                continue;
            }

            let step = state.observe(
                data,
                &event.kind,
                &event.kind,
                owner,
                repo_name,
                event.issue_number,
                event.issue_id,
                event.created_at,
                event.actor_login.as_deref(),
            );
            if let FeedStep::Bailout = step {
                break 'feed;
            }
        }
    }

    resolve_and_enqueue(state, owner, resolver, data, queue, queued_issues).await
}

/// Resolves each scan entry to its current issue, detects repository moves,
/// and enqueues issue units (unless this feed demands a full scan anyway).
async fn resolve_and_enqueue(
    state: FeedState,
    owner: &Owner,
    resolver: &mut ScanResolver,
    data: &EventScanData,
    queue: &WorkQueue,
    queued_issues: &mut HashSet<String>,
) -> Result<ScanOutcome, ScanError> {
    let mut new_fingerprints: Vec<String> = Vec::new();
    let mut to_enqueue: Vec<IssueUnit> = Vec::new();

    for (index, entry) in state.entries.iter().enumerate() {
        new_fingerprints.push(entry.fingerprint.clone());

        // One queued unit per (repo, issue) per scan run.
        let dedup_key = format!("{}-{}", entry.repo_name, entry.issue_number);
        if !queued_issues.insert(dedup_key) {
            continue;
        }

        queue.wait_if_needed(1).await;

        let resolved = resolver
            .issue(owner.name(), &entry.repo_name, entry.issue_number)
            .await;

        let issue = match resolved {
            Ok(Some((issue, _from_cache))) => issue,
            Ok(None) => {
                info!(
                    repo = %entry.repo_name,
                    issue = entry.issue_number,
                    "issue no longer resolvable upstream; skipping"
                );
                continue;
            }
            Err(e) if e.is_transient() => {
                info!(error = %e, "transient fault resolving issue; skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let (repo_name, issue_number) = if issue.id != entry.issue_id {
            // The fetch followed a redirect: the issue moved. Its new home is
            // only recoverable from the URL.
            match parse_issue_url(&issue.html_url) {
                Some((new_owner, new_repo, new_number)) => {
                    if new_owner != owner.name() {
                        // Record everything seen before the offending event;
                        // the event itself stays unprocessed.
                        let mut partial: Vec<String> = state
                            .entries
                            .iter()
                            .take(index)
                            .map(|e| e.fingerprint.clone())
                            .collect();
                        partial.extend(
                            state
                                .entries
                                .iter()
                                .skip(index + 1)
                                .map(|e| e.fingerprint.clone()),
                        );
                        for fingerprint in &partial {
                            data.add_if_not_present(fingerprint);
                        }
                        return Err(ScanError::CrossOwnerMove {
                            from_owner: owner.name().to_string(),
                            to_owner: new_owner,
                            repo: entry.repo_name.clone(),
                            issue: entry.issue_number,
                            partial: ScanOutcome {
                                new_fingerprints: partial,
                                full_scan_required: false,
                            },
                        });
                    }
                    (new_repo, new_number)
                }
                None => {
                    warn!(url = %issue.html_url, "unparseable moved-issue url; skipping");
                    continue;
                }
            }
        } else {
            (entry.repo_name.clone(), entry.issue_number)
        };

        to_enqueue.push(IssueUnit {
            owner: owner.clone(),
            repo_name,
            number: issue_number,
        });
    }

    if state.full_scan_required {
        // The imminent full scan covers these issues; queueing them now
        // would double the work.
        if !to_enqueue.is_empty() {
            info!(
                owner = %owner,
                suppressed = to_enqueue.len(),
                "full scan required; event-scan issues not enqueued"
            );
        }
    } else {
        for unit in to_enqueue {
            queue.add_issue(unit);
        }
    }

    for fingerprint in &new_fingerprints {
        data.add_if_not_present(fingerprint);
    }

    Ok(ScanOutcome {
        new_fingerprints,
        full_scan_required: state.full_scan_required,
    })
}

/// Parses `.../<owner>/<repo>/issues/<number>` out of an issue URL.
fn parse_issue_url(url: &str) -> Option<(String, String, i64)> {
    let segments: Vec<&str> = url.split('/').filter(|s| !s.is_empty()).collect();
    let len = segments.len();
    if len < 4 || segments[len - 2] != "issues" {
        return None;
    }

    let number: i64 = segments[len - 1].parse().ok()?;
    let repo = segments[len - 3].to_string();
    let owner = segments[len - 4].to_string();
    Some((owner, repo, number))
}
