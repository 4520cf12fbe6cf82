//! Background scheduler.
//!
//! One long-lived loop drives the mirror's scan lifecycle:
//!
//! 1. Detect that a running full scan has drained (queue empty, nothing
//!    active) and mark it complete.
//! 2. Decide whether a full scan is required: the daily 3 a.m. window, an
//!    uninitialized store, or no recorded previous scan.
//! 3. When no full scan is required and the queue is nearly drained, run the
//!    event scanner for each owner whose per-owner deadline has elapsed. A
//!    scan can itself conclude that a full scan is unavoidable.
//! 4. Fold in externally requested full scans.
//! 5. Begin a full scan if one is required, at most once per calendar day:
//!    persist the scan-start timestamp, clear the processed-events state,
//!    and enqueue every configured owner.
//!
//! No error escapes the loop; a failed tick is logged and the next tick
//! proceeds. Workers and the event scanner never mutate the scan flags;
//! all transitions happen here.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Datelike, Local, Timelike, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::heartbeat::run_with_heartbeat;
use crate::platform::{Platform, SharedQuota};
use crate::queue::{OwnerUnit, WorkQueue};
use crate::scan::{EventScanData, ScanError, scan_owner};
use crate::store::{KEY_LAST_FULL_SCAN_START, Store};

/// Scheduler heartbeat.
const TICK_INTERVAL: Duration = Duration::from_secs(20);

/// Local hour at which the daily full scan triggers.
const DAILY_SCAN_HOUR: u32 = 3;

/// Queue depth below which the engine counts as "nearly drained" and event
/// scans may run.
const NEARLY_DRAINED_THRESHOLD: usize = 10;

/// One configured owner plus its event-scan cadence.
#[derive(Clone)]
pub struct ScanTarget {
    pub unit: OwnerUnit,
    pub interval: Duration,
}

/// Mutable state carried across ticks.
pub(crate) struct SchedulerState {
    pub(crate) full_scan_in_progress: bool,

    /// `year*1000 + day_of_year` keys of days a full scan was initiated.
    pub(crate) daily_scan_ran: HashSet<i64>,

    /// Per-owner event-scan deadlines, parallel to `Scheduler::targets`.
    pub(crate) scan_deadlines: Vec<Instant>,
}

/// The background scheduler. One instance per engine.
pub struct Scheduler {
    queue: Arc<WorkQueue>,
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    scan_data: Arc<EventScanData>,
    shared_quota: Arc<SharedQuota>,
    targets: Vec<ScanTarget>,
    full_scan_requested: Arc<AtomicBool>,
    daily_scan_hour: u32,
}

impl Scheduler {
    pub fn new(
        queue: Arc<WorkQueue>,
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        scan_data: Arc<EventScanData>,
        shared_quota: Arc<SharedQuota>,
        targets: Vec<ScanTarget>,
        full_scan_requested: Arc<AtomicBool>,
    ) -> Self {
        Scheduler {
            queue,
            store,
            platform,
            scan_data,
            shared_quota,
            targets,
            full_scan_requested,
            daily_scan_hour: DAILY_SCAN_HOUR,
        }
    }

    /// Overrides the daily full-scan hour. Tests pass an unreachable hour to
    /// keep ticks independent of the wall clock.
    #[cfg(test)]
    pub(crate) fn with_daily_scan_hour(mut self, hour: u32) -> Self {
        self.daily_scan_hour = hour;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("background scheduler started");

        let mut state = SchedulerState {
            full_scan_in_progress: false,
            daily_scan_ran: HashSet::new(),
            scan_deadlines: vec![Instant::now(); self.targets.len()],
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }

            debug!("scheduler tick");
            if let Err(e) = self.tick(&mut state).await {
                error!(error = %e, "scheduler tick failed; continuing");
            }
        }

        info!("background scheduler stopped");
    }

    pub(crate) async fn tick(
        &self,
        state: &mut SchedulerState,
    ) -> Result<(), crate::store::StoreError> {
        // Keep the pacing gate's view of the quota current.
        match self.platform.quota().await {
            Ok(snapshot) => self.shared_quota.set(snapshot),
            Err(e) => debug!(error = %e, "quota refresh failed"),
        }

        // A full scan is complete once it started and the pipeline drained.
        if state.full_scan_in_progress
            && self.queue.available_work() == 0
            && self.queue.active_resources() == 0
        {
            state.full_scan_in_progress = false;
            info!("full scan detected as complete");
        }

        let last_full_scan = self.store.get_long(KEY_LAST_FULL_SCAN_START)?;

        let now_local = Local::now();
        let hour = now_local.hour();
        let day_key = now_local.year() as i64 * 1000 + now_local.ordinal() as i64;

        let mut full_scan_required = hour == self.daily_scan_hour
            || !self.store.is_initialized()
            || last_full_scan.is_none();

        // Event scans run only while the pipeline is idle enough that their
        // enqueued issues get picked up promptly.
        if !full_scan_required
            && !state.full_scan_in_progress
            && self.queue.available_work() + self.queue.active_resources()
                <= NEARLY_DRAINED_THRESHOLD
            && let Some(last_full_scan_ms) = last_full_scan
        {
            let now = Instant::now();
            for (index, target) in self.targets.iter().enumerate() {
                if state.scan_deadlines[index] > now {
                    continue;
                }
                // The deadline advances per attempt, successful or not.
                state.scan_deadlines[index] = now + target.interval;

                if self.run_event_scan(target, last_full_scan_ms).await {
                    info!(owner = %target.unit.owner, "event scan requests a full scan");
                    full_scan_required = true;
                }
            }
        }

        if self.full_scan_requested.swap(false, Ordering::SeqCst) {
            info!("full scan requested externally");
            full_scan_required = true;
        }

        if full_scan_required && !state.full_scan_in_progress {
            if !self.store.is_initialized() {
                self.store.initialize();
            }

            if state.daily_scan_ran.insert(day_key) {
                info!("beginning full scan");
                state.full_scan_in_progress = true;

                self.store
                    .put_long(KEY_LAST_FULL_SCAN_START, Utc::now().timestamp_millis())?;

                // A clean slate for the event scanner while the full scan
                // rebuilds the mirror.
                self.store.clear_processed_events()?;
                self.scan_data.clear();

                for target in &self.targets {
                    self.queue.add_owner(target.unit.clone());
                }
            }
        }

        Ok(())
    }

    /// Runs one owner's event scan under the heartbeat runner. Returns
    /// whether the scan promoted a full scan.
    async fn run_event_scan(&self, target: &ScanTarget, last_full_scan_ms: i64) -> bool {
        let platform = self.platform.clone();
        let unit = target.unit.clone();
        let data = self.scan_data.clone();
        let queue = self.queue.clone();

        let result = run_with_heartbeat(move |progress| async move {
            scan_owner(&platform, &unit, &data, &queue, last_full_scan_ms, &progress).await
        })
        .await;

        match result {
            Ok(Some(outcome)) => {
                self.persist_fingerprints(&outcome.new_fingerprints);
                outcome.full_scan_required
            }
            Ok(None) => {
                warn!(owner = %target.unit.owner, "event scan stalled and was cancelled");
                false
            }
            Err(ScanError::CrossOwnerMove {
                from_owner,
                to_owner,
                repo,
                issue,
                partial,
            }) => {
                // Unsupported; abandon this scan iteration but keep the
                // knowledge gathered before the offending event.
                error!(
                    from = %from_owner,
                    to = %to_owner,
                    repo = %repo,
                    issue = issue,
                    "cross-owner issue move is not supported"
                );
                self.persist_fingerprints(&partial.new_fingerprints);
                false
            }
            Err(e) => {
                warn!(owner = %target.unit.owner, error = %e, "event scan failed");
                false
            }
        }
    }

    fn persist_fingerprints(&self, fingerprints: &[String]) {
        if fingerprints.is_empty() {
            return;
        }
        if let Err(e) = self.store.add_processed_events(fingerprints) {
            warn!(error = %e, "failed to persist processed-event fingerprints");
        }
    }
}
