//! Progress-guarded task execution.
//!
//! Runs a unit of work on a helper task while watching a progress handle the
//! work is expected to ping. If no progress is reported for five minutes the
//! helper is aborted and the runner yields nothing; the caller treats that as
//! "no new information". This exists for upstream endpoints that accept a
//! request and then never answer, without tripping the client's own
//! timeouts.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// How long the task may go without reporting progress.
const MAX_TIME_WITHOUT_PROGRESS: Duration = Duration::from_secs(5 * 60);

/// How often the runner checks on the helper.
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(1);

/// Handle through which the supervised task reports liveness.
#[derive(Clone)]
pub struct ProgressHandle {
    last_progress: Arc<Mutex<Instant>>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        ProgressHandle {
            last_progress: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Records that a unit of work completed.
    pub fn ping(&self) {
        let mut last = self
            .last_progress
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *last = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.last_progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }
}

/// Runs `task` under progress supervision.
///
/// Returns `Ok(None)` when the task stalled and was aborted. Task errors
/// propagate; a panic inside the task surfaces as an error.
pub async fn run_with_heartbeat<T, E, F, Fut>(task: F) -> Result<Option<T>, E>
where
    F: FnOnce(ProgressHandle) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + From<TaskPanicked> + 'static,
{
    let handle = ProgressHandle::new();
    let mut helper = tokio::spawn(task(handle.clone()));

    loop {
        tokio::select! {
            outcome = &mut helper => {
                return match outcome {
                    Ok(Ok(value)) => Ok(Some(value)),
                    Ok(Err(e)) => Err(e),
                    // Cancellation only happens through our own abort below,
                    // which exits the loop first, so a join error is a panic.
                    Err(join_error) => Err(TaskPanicked {
                        message: join_error.to_string(),
                    }
                    .into()),
                };
            }
            _ = tokio::time::sleep(SUPERVISION_INTERVAL) => {
                if handle.elapsed() > MAX_TIME_WITHOUT_PROGRESS {
                    warn!("task reported no progress for 5 minutes, aborting");
                    helper.abort();
                    return Ok(None);
                }
            }
        }
    }
}

/// The supervised task panicked.
#[derive(Debug, thiserror::Error)]
#[error("supervised task panicked: {message}")]
pub struct TaskPanicked {
    pub message: String,
}
