//! Domain types: owner identity, storage keys, and persisted documents.

pub mod owner;
pub mod records;

pub use owner::{
    InvalidOwnerName, Owner, issue_key, org_key, repo_key, user_key, user_repositories_key,
};
pub use records::{
    BulkIssues, GHOST_LOGIN, IssueCommentRecord, IssueEventDetail, IssueEventRecord, IssueRecord,
    OrganizationRecord, RepositoryRecord, ResourceChangeEvent, UserRecord, UserRepositoriesRecord,
    sanitize_login,
};
