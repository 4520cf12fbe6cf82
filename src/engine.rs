//! Engine lifecycle: construction, startup resolution, and shutdown.
//!
//! A `MirrorEngine` owns the whole ingestion pipeline: the content store,
//! the work queue, five workers, and the background scheduler. The read API
//! holds an engine handle and reads through [`MirrorEngine::store`].
//!
//! Startup resolves every configured target against upstream before any
//! worker runs. Startup is not allowed to give up on quota exhaustion: it
//! sleeps a minute and retries the whole resolution loop until it succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConfigError, MirrorConfig};
use crate::filter::MirrorFilter;
use crate::logfile::FileLog;
use crate::platform::{Platform, PlatformError, SharedQuota};
use crate::queue::{OwnerUnit, QueuedRepo, WorkQueue};
use crate::scan::EventScanData;
use crate::scheduler::{ScanTarget, Scheduler};
use crate::store::{CachedStore, JsonStore, Store, StoreError};
use crate::types::{InvalidOwnerName, Owner};
use crate::worker::spawn_workers;

/// Sleep between startup resolution attempts when the quota is exhausted.
const QUOTA_RETRY_SLEEP: Duration = Duration::from_secs(60);

/// Errors raised while starting the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    OwnerName(#[from] InvalidOwnerName),

    #[error("configured target not found upstream: {0}")]
    TargetNotFound(String),
}

/// Handle to a running mirror engine.
pub struct MirrorEngine {
    store: Arc<dyn Store>,
    queue: Arc<WorkQueue>,
    full_scan_requested: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl MirrorEngine {
    /// Builds the store, resolves the configured targets, and spawns the
    /// worker pool and scheduler.
    pub async fn start(
        config: &MirrorConfig,
        filter: Arc<dyn MirrorFilter>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let json_store = Arc::new(JsonStore::new(&config.db_path));
        let store: Arc<dyn Store> = Arc::new(CachedStore::new(json_store));

        store.reconcile_against_config(
            &config.org_list,
            &config.user_repo_list,
            &config.individual_repo_names(),
        )?;

        // Resolve targets, retrying for as long as the quota blocks us.
        let targets = loop {
            match resolve_targets(config, platform.as_ref()).await {
                Ok(targets) => break targets,
                Err(EngineError::Platform(e)) if e.is_quota_exhausted() => {
                    warn!(error = %e, "quota exhausted during startup resolution; retrying in 60s");
                    tokio::time::sleep(QUOTA_RETRY_SLEEP).await;
                }
                Err(e) => return Err(e),
            }
        };
        info!(targets = targets.len(), "resolved configured targets");

        let shared_quota = Arc::new(SharedQuota::new());
        // Seed the pacing gate before the first worker poll; the scheduler
        // refreshes it from then on.
        match platform.quota().await {
            Ok(snapshot) => shared_quota.set(snapshot),
            Err(e) => warn!(error = %e, "initial quota fetch failed"),
        }

        let queue = Arc::new(WorkQueue::new(
            shared_quota.clone(),
            config.num_requests_per_hour,
            Duration::from_millis(config.pause_between_requests_in_msecs),
        ));

        let file_log = Arc::new(match &config.file_logger_path {
            Some(path) => FileLog::new(path),
            None => FileLog::disabled(),
        });

        let scan_data = Arc::new(EventScanData::new(store.get_processed_events()?));
        let full_scan_requested = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        spawn_workers(
            queue.clone(),
            store.clone(),
            platform.clone(),
            filter,
            file_log,
            shutdown.clone(),
        );

        let scheduler = Scheduler::new(
            queue.clone(),
            store.clone(),
            platform,
            scan_data,
            shared_quota,
            targets,
            full_scan_requested.clone(),
        );
        tokio::spawn(scheduler.run(shutdown.clone()));

        Ok(MirrorEngine {
            store,
            queue,
            full_scan_requested,
            shutdown,
        })
    }

    /// The store handle the read API serves from.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Asks the scheduler to begin a full scan on its next tick.
    pub fn request_full_scan(&self) {
        self.full_scan_requested.store(true, Ordering::SeqCst);
    }

    /// The flag consumed by the scheduler; the read API shares it so a
    /// `POST /fullScan` reaches the next tick.
    pub fn full_scan_signal(&self) -> Arc<AtomicBool> {
        self.full_scan_requested.clone()
    }

    /// Pending plus in-flight units; zero means drained.
    pub fn outstanding_work(&self) -> usize {
        self.queue.available_work() + self.queue.active_resources()
    }

    /// Stops polling and cancels all background tasks. The tasks are
    /// daemons: they are not joined.
    pub fn shutdown(&self) {
        self.queue.stop_accepting();
        self.shutdown.cancel();
    }
}

/// Resolves the configured orgs, users, and individual repos into scan
/// targets. Individual repos are grouped per owner into one repo-list
/// target; its cadence is the tightest override among the grouped repos.
async fn resolve_targets(
    config: &MirrorConfig,
    platform: &dyn Platform,
) -> Result<Vec<ScanTarget>, EngineError> {
    let default_interval = Duration::from_secs(config.time_between_event_scans_in_seconds);
    let mut targets = Vec::new();

    for org in &config.org_list {
        if !platform.organization_exists(org).await? {
            return Err(EngineError::TargetNotFound(format!("org {}", org)));
        }
        targets.push(ScanTarget {
            unit: OwnerUnit::org_or_user(Owner::org(org.clone())?),
            interval: default_interval,
        });
    }

    for user in &config.user_repo_list {
        if !platform.user_exists(user).await? {
            return Err(EngineError::TargetNotFound(format!("user {}", user)));
        }
        targets.push(ScanTarget {
            unit: OwnerUnit::org_or_user(Owner::user(user.clone())?),
            interval: default_interval,
        });
    }

    // Group individual repos by owner, preserving a stable owner order.
    let mut grouped: BTreeMap<String, Vec<(QueuedRepo, Option<u64>)>> = BTreeMap::new();
    for individual in &config.individual_repo_list {
        let Some((owner_name, repo_name)) = individual.repo.split_once('/') else {
            return Err(EngineError::Config(ConfigError::InvalidRepoFormat {
                repo: individual.repo.clone(),
            }));
        };

        let Some(summary) = platform.fetch_repository(owner_name, repo_name).await? else {
            return Err(EngineError::TargetNotFound(format!(
                "repository {}",
                individual.repo
            )));
        };

        grouped.entry(owner_name.to_string()).or_default().push((
            QueuedRepo {
                name: summary.name,
                id: summary.id,
            },
            individual.time_between_event_scans_in_seconds,
        ));
    }

    for (owner_name, repos) in grouped {
        let interval = repos
            .iter()
            .filter_map(|(_, override_secs)| *override_secs)
            .map(Duration::from_secs)
            .min()
            .unwrap_or(default_interval);

        let repo_list = repos.into_iter().map(|(repo, _)| repo).collect();
        targets.push(ScanTarget {
            unit: OwnerUnit::repo_list(Owner::org(owner_name)?, repo_list),
            interval,
        });
    }

    Ok(targets)
}
