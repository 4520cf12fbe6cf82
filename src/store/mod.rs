//! Content store: durable persistence of mirrored resources.
//!
//! The store is the sole owner of everything on disk. Every other component
//! (workers, scanner, scheduler, read API) goes through the [`Store`] trait,
//! either directly against [`JsonStore`] or through the read-through
//! [`CachedStore`] wrapper.

pub mod cache;
pub mod change_log;
mod fsync;
pub mod json_store;

use std::io;

use thiserror::Error;

use crate::types::{
    IssueRecord, OrganizationRecord, Owner, RepositoryRecord, ResourceChangeEvent, UserRecord,
    UserRepositoriesRecord,
};

pub use cache::CachedStore;
pub use json_store::JsonStore;

/// Scalar key: epoch-ms timestamp of the most recent full-scan start.
pub const KEY_LAST_FULL_SCAN_START: &str = "lastFullScanStart";

/// Scalar key: content hash of the configured mirror targets.
pub const KEY_CONTENTS_HASH: &str = "githubContentsHash";

/// Errors from store operations. I/O failures are fatal for the operation
/// that hit them but never for the process.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scalar {key:?} is not a valid integer: {value:?}")]
    MalformedScalar { key: String, value: String },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Typed key/value persistence of mirrored resources plus the metadata area.
///
/// Writes are serialized, reads are concurrent, and a reader never observes
/// a torn write.
pub trait Store: Send + Sync {
    fn get_issue(&self, owner: &Owner, repo_name: &str, number: i64)
    -> Result<Option<IssueRecord>>;

    fn put_issue(&self, owner: &Owner, issue: &IssueRecord) -> Result<()>;

    fn get_organization(&self, name: &str) -> Result<Option<OrganizationRecord>>;

    fn put_organization(&self, org: &OrganizationRecord) -> Result<()>;

    fn get_repository(&self, owner: &Owner, repo_name: &str)
    -> Result<Option<RepositoryRecord>>;

    /// Persists a repository record. `last_issue` is monotonic: when the
    /// stored record has a higher `last_issue`, the stored value wins. The
    /// effective record (after merging) is returned.
    fn put_repository(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord>;

    fn get_user_repositories(&self, user_name: &str) -> Result<Option<UserRepositoriesRecord>>;

    fn put_user_repositories(&self, record: &UserRepositoriesRecord) -> Result<()>;

    fn get_user(&self, login: &str) -> Result<Option<UserRecord>>;

    fn put_user(&self, user: &UserRecord) -> Result<()>;

    /// Appends change events to the log, grouped under the first event's
    /// timestamp; millisecond collisions bump the timestamp until unused.
    fn append_change_events(&self, events: &[ResourceChangeEvent]) -> Result<()>;

    /// Returns events with `time >= since_ms` ascending by time. As a side
    /// effect, log files older than eight days are deleted (best effort).
    fn read_recent_change_events(&self, since_ms: i64) -> Result<Vec<ResourceChangeEvent>>;

    fn get_processed_events(&self) -> Result<Vec<String>>;

    /// Set-union add; the file is bounded to 1000 entries, oldest first out.
    fn add_processed_events(&self, hashes: &[String]) -> Result<()>;

    fn clear_processed_events(&self) -> Result<()>;

    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn put_string(&self, key: &str, value: &str) -> Result<()>;

    fn get_long(&self, key: &str) -> Result<Option<i64>>;

    fn put_long(&self, key: &str, value: i64) -> Result<()>;

    fn is_initialized(&self) -> bool;

    fn initialize(&self);

    /// Compares the configured targets against the stored content hash; on
    /// mismatch the entire store is moved aside into `old/` and the store is
    /// marked uninitialized. The only destructive operation in the engine.
    fn reconcile_against_config(
        &self,
        orgs: &[String],
        user_repos: &[String],
        individual_repos: &[String],
    ) -> Result<()>;
}
