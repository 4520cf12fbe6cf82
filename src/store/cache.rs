//! Read-through / write-through cache over the content store.
//!
//! Entries are held in a bounded map and may be dropped at any moment: the
//! wrapper stands in for a soft-reference cache, so callers must never
//! depend on retention. A `get` miss that finds a value in the inner store
//! populates the cache; an absent value is not cached. A `put` delegates to
//! the inner store and then unconditionally populates the cache.
//!
//! Change events, processed events, and lifecycle operations pass straight
//! through: they are either append-only or consulted too rarely to benefit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::{
    IssueRecord, OrganizationRecord, Owner, RepositoryRecord, ResourceChangeEvent, UserRecord,
    UserRepositoriesRecord, issue_key, org_key, repo_key, user_key, user_repositories_key,
};

use super::{Result, Store};

/// Default entry bound. Entries are evicted oldest-insertion-first once the
/// bound is exceeded.
const DEFAULT_CAPACITY: usize = 4096;

/// A bounded insertion-order cache of JSON documents.
struct BoundedCache {
    entries: HashMap<String, serde_json::Value>,
    insertion_order: VecDeque<String>,
    capacity: usize,
}

impl BoundedCache {
    fn new(capacity: usize) -> Self {
        BoundedCache {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, value: serde_json::Value) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.insertion_order.push_back(key);
        }

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Caching wrapper around any [`Store`] implementation.
pub struct CachedStore {
    inner: Arc<dyn Store>,
    cache: Mutex<BoundedCache>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<dyn Store>, capacity: usize) -> Self {
        CachedStore {
            inner,
            cache: Mutex::new(BoundedCache::new(capacity)),
        }
    }

    fn cached_get<T, F>(&self, key: &str, load: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<Option<T>>,
    {
        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(value) = cache.get(key) {
                // A cached entry that no longer deserializes would mean the
                // record type changed under us; fall through to the store.
                if let Ok(typed) = serde_json::from_value(value) {
                    return Ok(Some(typed));
                }
            }
        }

        let loaded = load()?;
        if let Some(found) = &loaded {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.put(key.to_string(), serde_json::to_value(found)?);
        }
        Ok(loaded)
    }

    fn cache_put<T: Serialize>(&self, key: String, value: &T) -> Result<()> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.put(key, serde_json::to_value(value)?);
        Ok(())
    }

    fn scalar_key(prefix: &str, key: &str) -> String {
        format!("{}-{}", prefix, key)
    }
}

impl Store for CachedStore {
    fn get_issue(
        &self,
        owner: &Owner,
        repo_name: &str,
        number: i64,
    ) -> Result<Option<IssueRecord>> {
        let key = issue_key(owner, repo_name, number);
        self.cached_get(&key, || self.inner.get_issue(owner, repo_name, number))
    }

    fn put_issue(&self, owner: &Owner, issue: &IssueRecord) -> Result<()> {
        self.inner.put_issue(owner, issue)?;
        self.cache_put(issue_key(owner, &issue.parent_repo, issue.number), issue)
    }

    fn get_organization(&self, name: &str) -> Result<Option<OrganizationRecord>> {
        self.cached_get(&org_key(name), || self.inner.get_organization(name))
    }

    fn put_organization(&self, org: &OrganizationRecord) -> Result<()> {
        self.inner.put_organization(org)?;
        self.cache_put(org_key(&org.name), org)
    }

    fn get_repository(
        &self,
        owner: &Owner,
        repo_name: &str,
    ) -> Result<Option<RepositoryRecord>> {
        let key = repo_key(owner, repo_name);
        self.cached_get(&key, || self.inner.get_repository(owner, repo_name))
    }

    fn put_repository(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        // The inner store may merge (last_issue monotonicity); cache what was
        // actually stored, not what was offered.
        let effective = self.inner.put_repository(repo)?;
        if let Some(owner) = effective.owner() {
            self.cache_put(repo_key(&owner, &effective.name), &effective)?;
        }
        Ok(effective)
    }

    fn get_user_repositories(&self, user_name: &str) -> Result<Option<UserRepositoriesRecord>> {
        self.cached_get(&user_repositories_key(user_name), || {
            self.inner.get_user_repositories(user_name)
        })
    }

    fn put_user_repositories(&self, record: &UserRepositoriesRecord) -> Result<()> {
        self.inner.put_user_repositories(record)?;
        self.cache_put(user_repositories_key(&record.user_name), record)
    }

    fn get_user(&self, login: &str) -> Result<Option<UserRecord>> {
        self.cached_get(&user_key(login), || self.inner.get_user(login))
    }

    fn put_user(&self, user: &UserRecord) -> Result<()> {
        self.inner.put_user(user)?;
        self.cache_put(user_key(&user.login), user)
    }

    fn append_change_events(&self, events: &[ResourceChangeEvent]) -> Result<()> {
        self.inner.append_change_events(events)
    }

    fn read_recent_change_events(&self, since_ms: i64) -> Result<Vec<ResourceChangeEvent>> {
        self.inner.read_recent_change_events(since_ms)
    }

    fn get_processed_events(&self) -> Result<Vec<String>> {
        self.inner.get_processed_events()
    }

    fn add_processed_events(&self, hashes: &[String]) -> Result<()> {
        self.inner.add_processed_events(hashes)
    }

    fn clear_processed_events(&self) -> Result<()> {
        self.inner.clear_processed_events()
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.cached_get(&Self::scalar_key("string", key), || {
            self.inner.get_string(key)
        })
    }

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.inner.put_string(key, value)?;
        self.cache_put(Self::scalar_key("string", key), &value.to_string())
    }

    fn get_long(&self, key: &str) -> Result<Option<i64>> {
        self.cached_get(&Self::scalar_key("long", key), || self.inner.get_long(key))
    }

    fn put_long(&self, key: &str, value: i64) -> Result<()> {
        self.inner.put_long(key, value)?;
        self.cache_put(Self::scalar_key("long", key), &value)
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    fn initialize(&self) {
        self.inner.initialize()
    }

    fn reconcile_against_config(
        &self,
        orgs: &[String],
        user_repos: &[String],
        individual_repos: &[String],
    ) -> Result<()> {
        self.inner
            .reconcile_against_config(orgs, user_repos, individual_repos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use tempfile::tempdir;

    fn cached_store(dir: &std::path::Path) -> (CachedStore, Arc<JsonStore>) {
        let inner = Arc::new(JsonStore::new(dir));
        (CachedStore::new(inner.clone()), inner)
    }

    fn sample_issue(number: i64) -> IssueRecord {
        IssueRecord {
            parent_repo: "che".into(),
            number,
            title: "t".into(),
            body: None,
            html_url: "https://github.com/eclipse/che/issues/1".into(),
            reporter: "octocat".into(),
            assignees: vec![],
            labels: vec![],
            created_at: chrono::Utc::now(),
            closed_at: None,
            pull_request: false,
            closed: false,
            comments: vec![],
            issue_events: vec![],
        }
    }

    #[test]
    fn write_through_then_read_back() {
        let dir = tempdir().unwrap();
        let (store, inner) = cached_store(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        store.put_issue(&owner, &sample_issue(1)).unwrap();

        // Visible both through the cache and directly from disk.
        assert!(store.get_issue(&owner, "che", 1).unwrap().is_some());
        assert!(inner.get_issue(&owner, "che", 1).unwrap().is_some());
    }

    #[test]
    fn read_through_populates_from_inner() {
        let dir = tempdir().unwrap();
        let (store, inner) = cached_store(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        // Written behind the cache's back.
        inner.put_issue(&owner, &sample_issue(2)).unwrap();

        assert!(store.get_issue(&owner, "che", 2).unwrap().is_some());
    }

    #[test]
    fn absent_values_are_not_cached() {
        let dir = tempdir().unwrap();
        let (store, inner) = cached_store(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        // Miss on an absent issue...
        assert!(store.get_issue(&owner, "che", 3).unwrap().is_none());

        // ...then the issue appears in the inner store; the cache must not
        // have pinned the "absent" answer.
        inner.put_issue(&owner, &sample_issue(3)).unwrap();
        assert!(store.get_issue(&owner, "che", 3).unwrap().is_some());
    }

    #[test]
    fn eviction_bounds_the_cache() {
        let dir = tempdir().unwrap();
        let inner = Arc::new(JsonStore::new(dir.path()));
        let store = CachedStore::with_capacity(inner, 2);
        let owner = Owner::org("eclipse").unwrap();

        for n in 1..=5 {
            store.put_issue(&owner, &sample_issue(n)).unwrap();
        }

        // Correctness survives eviction: everything still readable.
        for n in 1..=5 {
            assert!(store.get_issue(&owner, "che", n).unwrap().is_some());
        }
    }

    #[test]
    fn repository_cache_holds_merged_record() {
        let dir = tempdir().unwrap();
        let (store, _inner) = cached_store(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        let mut record = RepositoryRecord {
            name: "che".into(),
            org_name: Some("eclipse".into()),
            owner_user_name: None,
            repository_id: 7,
            first_issue: Some(1),
            last_issue: Some(40),
        };
        store.put_repository(&record).unwrap();

        record.last_issue = Some(10);
        store.put_repository(&record).unwrap();

        // The cached value reflects the monotonic merge, not the raw put.
        let loaded = store.get_repository(&owner, "che").unwrap().unwrap();
        assert_eq!(loaded.last_issue, Some(40));
    }

    #[test]
    fn scalars_cache_separately_per_type() {
        let dir = tempdir().unwrap();
        let (store, _inner) = cached_store(dir.path());

        store.put_long("lastFullScanStart", 5).unwrap();
        store.put_string("note", "text").unwrap();

        assert_eq!(store.get_long("lastFullScanStart").unwrap(), Some(5));
        assert_eq!(store.get_string("note").unwrap().as_deref(), Some("text"));
    }
}
