//! Short-lived upstream resolver cache.
//!
//! One resolver exists per event scan. It caches owner repository listings
//! and individual issues so that a scan touching the same issue through
//! multiple events pays for one upstream fetch. The cache must not outlive
//! the scan: a longer-lived cache would serve stale issues.

use std::collections::HashMap;
use std::sync::Arc;

use crate::platform::{IssueData, Platform, RepoSummary, Result};

/// Per-scan cache over the platform's repo and issue lookups.
pub struct ScanResolver {
    platform: Arc<dyn Platform>,
    org_repos: HashMap<String, Vec<RepoSummary>>,
    user_repos: HashMap<String, Vec<RepoSummary>>,
    issues: HashMap<String, IssueData>,
}

impl ScanResolver {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        ScanResolver {
            platform,
            org_repos: HashMap::new(),
            user_repos: HashMap::new(),
            issues: HashMap::new(),
        }
    }

    /// Lists an owner's repositories, cached for the scan's lifetime.
    pub async fn repositories(&mut self, is_org: bool, owner_name: &str) -> Result<Vec<RepoSummary>> {
        let cache = if is_org {
            &mut self.org_repos
        } else {
            &mut self.user_repos
        };

        if let Some(repos) = cache.get(owner_name) {
            return Ok(repos.clone());
        }

        let repos = if is_org {
            self.platform.list_org_repositories(owner_name).await?
        } else {
            self.platform.list_user_repositories(owner_name).await?
        };

        let cache = if is_org {
            &mut self.org_repos
        } else {
            &mut self.user_repos
        };
        cache.insert(owner_name.to_string(), repos.clone());
        Ok(repos)
    }

    /// Returns a cached issue without touching upstream.
    pub fn issue_from_cache(&self, owner_name: &str, repo: &str, number: i64) -> Option<&IssueData> {
        self.issues.get(&issue_cache_key(owner_name, repo, number))
    }

    /// Fetches an issue, consulting the cache first. Returns whether the
    /// value came from the cache (a fresh fetch costs quota; the caller
    /// paces accordingly).
    pub async fn issue(
        &mut self,
        owner_name: &str,
        repo: &str,
        number: i64,
    ) -> Result<Option<(IssueData, bool)>> {
        let key = issue_cache_key(owner_name, repo, number);

        if let Some(issue) = self.issues.get(&key) {
            return Ok(Some((issue.clone(), true)));
        }

        let Some(issue) = self.platform.fetch_issue(owner_name, repo, number).await? else {
            return Ok(None);
        };

        self.issues.insert(key, issue.clone());
        Ok(Some((issue, false)))
    }
}

fn issue_cache_key(owner_name: &str, repo: &str, number: i64) -> String {
    format!("{}/{}/{}", owner_name, repo, number)
}
