//! Advisory resource filter.
//!
//! A filter is consulted at each pipeline boundary before a resource is
//! fetched or persisted. Skipping a unit is always safe: the worker persists
//! nothing for a skipped unit, so no orphan records are left behind.

use crate::types::Owner;

/// Pluggable predicate over the resources the engine is willing to process.
///
/// Implementations must be cheap and side-effect free; they are called from
/// every worker.
pub trait MirrorFilter: Send + Sync {
    fn process_owner(&self, owner: &Owner) -> bool;

    fn process_repo(&self, owner: &Owner, repo_name: &str) -> bool;

    fn process_issue(&self, owner: &Owner, repo_name: &str, issue_number: i64) -> bool;

    /// Gates the (comparatively expensive) per-issue event feed fetch.
    fn process_issue_events(&self, owner: &Owner, repo_name: &str, issue_number: i64) -> bool;

    fn process_user(&self, login: &str) -> bool;
}

/// Accepts every resource. Used when no filter is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveFilter;

impl MirrorFilter for PermissiveFilter {
    fn process_owner(&self, _owner: &Owner) -> bool {
        true
    }

    fn process_repo(&self, _owner: &Owner, _repo_name: &str) -> bool {
        true
    }

    fn process_issue(&self, _owner: &Owner, _repo_name: &str, _issue_number: i64) -> bool {
        true
    }

    fn process_issue_events(&self, _owner: &Owner, _repo_name: &str, _issue_number: i64) -> bool {
        true
    }

    fn process_user(&self, _login: &str) -> bool {
        true
    }
}
