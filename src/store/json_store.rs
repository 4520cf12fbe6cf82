//! On-disk JSON store.
//!
//! Persists each mirrored resource as one JSON document, using paths to
//! encode the key hierarchy:
//!
//! ```text
//! <db_dir>/<owner>/<repo>/<repo>.json     repository
//! <db_dir>/<owner>/<repo>/<n>.json        issue
//! <db_dir>/<orgName>/<orgName>.json       organization
//! <db_dir>/<userName>/<userName>.json     user repository list
//! <db_dir>/users/<login>.json             user
//! <db_dir>/keys/<key>.txt                 small scalars
//! <db_dir>/metadata/event-hashes.txt      processed-event fingerprints
//! <db_dir>/events/issue-<ms>.json         change-event log
//! <db_dir>/old/                           quarantined previous contents
//! ```
//!
//! A single read-write lock serializes writers against readers. Documents
//! are written to a temp file and renamed into place with file and directory
//! fsyncs, so a reader (or a crash) never observes a torn write.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use hex::encode as hex_encode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::types::{
    IssueRecord, OrganizationRecord, Owner, RepositoryRecord, ResourceChangeEvent, UserRecord,
    UserRepositoriesRecord, issue_key, org_key, repo_key, user_key, user_repositories_key,
};

use super::fsync::{fsync_dir, fsync_file};
use super::{KEY_CONTENTS_HASH, Result, Store, StoreError, change_log};

/// Maximum number of processed-event fingerprints kept on disk. Oldest
/// entries are evicted first.
const MAX_PROCESSED_EVENTS: usize = 1000;

const EVENT_HASHES_FILE: &str = "event-hashes.txt";

/// The on-disk JSON store. All other persistence wraps this.
pub struct JsonStore {
    db_dir: PathBuf,

    /// Guards all file I/O: many readers, one writer.
    io_lock: RwLock<()>,

    initialized: AtomicBool,
}

impl JsonStore {
    /// Opens (or points at) a store rooted at `db_dir`.
    ///
    /// The store counts as initialized when the directory exists and has any
    /// contents.
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        let db_dir = db_dir.into();

        let has_contents = fs::read_dir(&db_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        JsonStore {
            db_dir,
            io_lock: RwLock::new(()),
            initialized: AtomicBool::new(has_contents),
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    fn read_document<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>> {
        let _guard = self.io_lock.read().unwrap_or_else(|p| p.into_inner());

        let path = self.db_dir.join(relative);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write_document<T: Serialize>(&self, relative: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let _guard = self.io_lock.write().unwrap_or_else(|p| p.into_inner());
        self.write_bytes_locked(relative, &bytes)
    }

    /// Atomic write: temp file, fsync, rename, fsync parent. Caller holds
    /// the write lock.
    fn write_bytes_locked(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        let path = self.db_dir.join(relative);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.db_dir.clone());
        fs::create_dir_all(&parent)?;

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(bytes)?;
            fsync_file(&file)?;
        }
        fs::rename(&tmp_path, &path)?;
        fsync_dir(&parent)?;

        Ok(())
    }

    fn read_text(&self, relative: &str) -> Result<Option<String>> {
        let _guard = self.io_lock.read().unwrap_or_else(|p| p.into_inner());

        let path = self.db_dir.join(relative);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn event_hashes_relative() -> String {
        format!("metadata/{}", EVENT_HASHES_FILE)
    }
}

impl Store for JsonStore {
    fn get_issue(
        &self,
        owner: &Owner,
        repo_name: &str,
        number: i64,
    ) -> Result<Option<IssueRecord>> {
        self.read_document(&format!("{}.json", issue_key(owner, repo_name, number)))
    }

    fn put_issue(&self, owner: &Owner, issue: &IssueRecord) -> Result<()> {
        let relative = format!(
            "{}.json",
            issue_key(owner, &issue.parent_repo, issue.number)
        );
        self.write_document(&relative, issue)
    }

    fn get_organization(&self, name: &str) -> Result<Option<OrganizationRecord>> {
        self.read_document(&format!("{}/{}.json", org_key(name), name))
    }

    fn put_organization(&self, org: &OrganizationRecord) -> Result<()> {
        let relative = format!("{}/{}.json", org_key(&org.name), org.name);
        self.write_document(&relative, org)
    }

    fn get_repository(
        &self,
        owner: &Owner,
        repo_name: &str,
    ) -> Result<Option<RepositoryRecord>> {
        self.read_document(&format!("{}/{}.json", repo_key(owner, repo_name), repo_name))
    }

    fn put_repository(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        let Some(owner) = repo.owner() else {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "repository record has no owner",
            )));
        };

        let mut effective = repo.clone();

        // last_issue never regresses across updates of the same repository.
        if let Some(existing) = self.get_repository(&owner, &repo.name)?
            && let (Some(stored_last), Some(new_last)) = (existing.last_issue, repo.last_issue)
            && stored_last > new_last
        {
            debug!(
                repo = %repo.name,
                stored = stored_last,
                incoming = new_last,
                "keeping stored last_issue"
            );
            effective.last_issue = Some(stored_last);
        }

        let relative = format!("{}/{}.json", repo_key(&owner, &repo.name), repo.name);
        self.write_document(&relative, &effective)?;
        Ok(effective)
    }

    fn get_user_repositories(&self, user_name: &str) -> Result<Option<UserRepositoriesRecord>> {
        self.read_document(&format!(
            "{}/{}.json",
            user_repositories_key(user_name),
            user_name
        ))
    }

    fn put_user_repositories(&self, record: &UserRepositoriesRecord) -> Result<()> {
        let relative = format!(
            "{}/{}.json",
            user_repositories_key(&record.user_name),
            record.user_name
        );
        self.write_document(&relative, record)
    }

    fn get_user(&self, login: &str) -> Result<Option<UserRecord>> {
        self.read_document(&format!("{}.json", user_key(login)))
    }

    fn put_user(&self, user: &UserRecord) -> Result<()> {
        self.write_document(&format!("{}.json", user_key(&user.login)), user)
    }

    fn append_change_events(&self, events: &[ResourceChangeEvent]) -> Result<()> {
        let _guard = self.io_lock.write().unwrap_or_else(|p| p.into_inner());
        change_log::append(&self.db_dir.join("events"), events)
    }

    fn read_recent_change_events(&self, since_ms: i64) -> Result<Vec<ResourceChangeEvent>> {
        // Write lock: the pass may delete expired files.
        let _guard = self.io_lock.write().unwrap_or_else(|p| p.into_inner());
        change_log::read_recent(&self.db_dir.join("events"), since_ms)
    }

    fn get_processed_events(&self) -> Result<Vec<String>> {
        let contents = self.read_text(&Self::event_hashes_relative())?;
        Ok(contents
            .map(|text| {
                text.lines()
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn add_processed_events(&self, hashes: &[String]) -> Result<()> {
        let _guard = self.io_lock.write().unwrap_or_else(|p| p.into_inner());

        let path = self.db_dir.join(Self::event_hashes_relative());
        let mut lines: Vec<String> = match fs::read_to_string(&path) {
            Ok(text) => text
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut seen: std::collections::HashSet<&str> =
            lines.iter().map(String::as_str).collect();
        let mut fresh = Vec::new();
        for hash in hashes {
            if !seen.contains(hash.as_str()) {
                fresh.push(hash.clone());
                seen.insert(hash.as_str());
            }
        }
        drop(seen);
        lines.extend(fresh);

        if lines.len() > MAX_PROCESSED_EVENTS {
            let excess = lines.len() - MAX_PROCESSED_EVENTS;
            lines.drain(..excess);
        }

        let mut text = lines.join("\n");
        text.push('\n');
        self.write_bytes_locked(&Self::event_hashes_relative(), text.as_bytes())
    }

    fn clear_processed_events(&self) -> Result<()> {
        let _guard = self.io_lock.write().unwrap_or_else(|p| p.into_inner());

        let path = self.db_dir.join(Self::event_hashes_relative());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.read_text(&format!("keys/{}.txt", key))
    }

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.io_lock.write().unwrap_or_else(|p| p.into_inner());
        self.write_bytes_locked(&format!("keys/{}.txt", key), value.as_bytes())
    }

    fn get_long(&self, key: &str) -> Result<Option<i64>> {
        match self.get_string(key)? {
            None => Ok(None),
            Some(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| StoreError::MalformedScalar {
                    key: key.to_string(),
                    value: text,
                }),
        }
    }

    fn put_long(&self, key: &str, value: i64) -> Result<()> {
        self.put_string(key, &value.to_string())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn initialize(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn reconcile_against_config(
        &self,
        orgs: &[String],
        user_repos: &[String],
        individual_repos: &[String],
    ) -> Result<()> {
        let hash = contents_hash(orgs, user_repos, individual_repos);

        if !self.is_initialized() {
            self.put_string(KEY_CONTENTS_HASH, &hash)?;
            return Ok(());
        }

        let stored = self.get_string(KEY_CONTENTS_HASH)?;
        if stored.as_deref().map(str::trim) == Some(hash.as_str()) {
            return Ok(());
        }

        // Configured targets changed: quarantine everything under old/.
        let _guard = self.io_lock.write().unwrap_or_else(|p| p.into_inner());

        let old_dir = self.db_dir.join("old");
        fs::create_dir_all(&old_dir)?;

        let moved_at = chrono::Utc::now().timestamp_millis();

        for entry in fs::read_dir(&self.db_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == old_dir {
                continue;
            }

            let name = entry.file_name();
            let target = old_dir.join(format!(
                "{}.old.{}",
                name.to_string_lossy(),
                moved_at
            ));
            fs::rename(&path, &target)?;
        }

        info!(old_dir = %old_dir.display(), "configured targets changed; previous store contents moved aside");

        self.write_bytes_locked(&format!("keys/{}.txt", KEY_CONTENTS_HASH), hash.as_bytes())?;
        self.initialized.store(false, Ordering::SeqCst);

        Ok(())
    }
}

/// SHA-256 over the lowercased, sorted target lists in a fixed framed form.
fn contents_hash(orgs: &[String], user_repos: &[String], individual_repos: &[String]) -> String {
    fn normalized(list: &[String]) -> Vec<String> {
        let mut out: Vec<String> = list.iter().map(|s| s.to_lowercase()).collect();
        out.sort();
        out
    }

    let mut frames = Vec::new();
    frames.push("orgs:".to_string());
    frames.extend(normalized(orgs));
    frames.push("user-repos:".to_string());
    frames.extend(normalized(user_repos));
    frames.push("individual-repos:".to_string());
    frames.extend(normalized(individual_repos));

    let mut hasher = Sha256::new();
    hasher.update(frames.join(" ").as_bytes());
    hex_encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn issue(repo: &str, number: i64) -> IssueRecord {
        IssueRecord {
            parent_repo: repo.to_string(),
            number,
            title: format!("issue {}", number),
            body: Some("Document it".into()),
            html_url: format!("https://github.com/eclipse/{}/issues/{}", repo, number),
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
    fn issue_roundtrip_and_layout() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        store.put_issue(&owner, &issue("che", 26)).unwrap();

        assert!(dir.path().join("eclipse/che/26.json").exists());
        let loaded = store.get_issue(&owner, "che", 26).unwrap().unwrap();
        assert_eq!(loaded.body.as_deref(), Some("Document it"));
    }

    #[test]
    fn absent_issue_is_none() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let owner = Owner::org("eclipse").unwrap();
        assert!(store.get_issue(&owner, "che", 1).unwrap().is_none());
    }

    #[test]
    fn repository_layout_and_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        let record = RepositoryRecord {
            name: "che".into(),
            org_name: Some("eclipse".into()),
            owner_user_name: None,
            repository_id: 99,
            first_issue: Some(1),
            last_issue: Some(10),
        };
        store.put_repository(&record).unwrap();

        assert!(dir.path().join("eclipse/che/che.json").exists());
        let loaded = store.get_repository(&owner, "che").unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn last_issue_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        let mut record = RepositoryRecord {
            name: "che".into(),
            org_name: Some("eclipse".into()),
            owner_user_name: None,
            repository_id: 99,
            first_issue: Some(1),
            last_issue: Some(50),
        };
        store.put_repository(&record).unwrap();

        // A regressed write keeps the stored high-water mark.
        record.last_issue = Some(10);
        let effective = store.put_repository(&record).unwrap();
        assert_eq!(effective.last_issue, Some(50));

        let loaded = store.get_repository(&owner, "che").unwrap().unwrap();
        assert_eq!(loaded.last_issue, Some(50));

        // A higher write advances it.
        record.last_issue = Some(60);
        store.put_repository(&record).unwrap();
        let loaded = store.get_repository(&owner, "che").unwrap().unwrap();
        assert_eq!(loaded.last_issue, Some(60));
    }

    #[test]
    fn user_and_org_documents() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        store
            .put_user(&UserRecord {
                login: "octocat".into(),
                name: Some("The Octocat".into()),
                email: None,
            })
            .unwrap();
        assert!(dir.path().join("users/octocat.json").exists());
        assert_eq!(
            store.get_user("octocat").unwrap().unwrap().name.as_deref(),
            Some("The Octocat")
        );

        store
            .put_organization(&OrganizationRecord {
                name: "eclipse".into(),
                repositories: vec!["che".into()],
            })
            .unwrap();
        assert!(dir.path().join("eclipse/eclipse.json").exists());

        store
            .put_user_repositories(&UserRepositoriesRecord {
                user_name: "jgwest".into(),
                repo_names: vec!["rogue-cloud".into()],
            })
            .unwrap();
        assert!(dir.path().join("jgwest/jgwest.json").exists());
    }

    #[test]
    fn scalars_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        assert!(store.get_long("lastFullScanStart").unwrap().is_none());
        store.put_long("lastFullScanStart", 12345).unwrap();
        assert_eq!(store.get_long("lastFullScanStart").unwrap(), Some(12345));

        store.put_string("note", "hello").unwrap();
        assert_eq!(store.get_string("note").unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn processed_events_union_and_bound() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        store
            .add_processed_events(&["a".to_string(), "b".to_string()])
            .unwrap();
        // Union: re-adding "b" does not duplicate it.
        store
            .add_processed_events(&["b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(store.get_processed_events().unwrap(), vec!["a", "b", "c"]);

        store.clear_processed_events().unwrap();
        assert!(store.get_processed_events().unwrap().is_empty());
    }

    #[test]
    fn processed_events_evict_oldest_first() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let batch: Vec<String> = (0..MAX_PROCESSED_EVENTS).map(|i| format!("h{}", i)).collect();
        store.add_processed_events(&batch).unwrap();
        assert_eq!(store.get_processed_events().unwrap().len(), MAX_PROCESSED_EVENTS);

        // The 1001st add evicts exactly one (the oldest).
        store.add_processed_events(&["overflow".to_string()]).unwrap();
        let events = store.get_processed_events().unwrap();
        assert_eq!(events.len(), MAX_PROCESSED_EVENTS);
        assert_eq!(events.first().map(String::as_str), Some("h1"));
        assert_eq!(events.last().map(String::as_str), Some("overflow"));
    }

    #[test]
    fn initialized_reflects_directory_contents() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("db"));
        assert!(!store.is_initialized());

        store.initialize();
        assert!(store.is_initialized());
    }

    #[test]
    fn reconcile_on_uninitialized_persists_hash_only() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("db"));

        store
            .reconcile_against_config(&["eclipse".to_string()], &[], &[])
            .unwrap();

        assert!(store.get_string(KEY_CONTENTS_HASH).unwrap().is_some());
        assert!(!dir.path().join("db/old").exists());
    }

    #[test]
    fn reconcile_moves_store_aside_on_mismatch() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        store
            .reconcile_against_config(&["eclipse".to_string()], &[], &[])
            .unwrap();
        store.put_issue(&owner, &issue("che", 1)).unwrap();
        store.initialize();

        // Changed target set: previous contents are quarantined.
        store
            .reconcile_against_config(&["microclimate-dev2ops".to_string()], &[], &[])
            .unwrap();

        assert!(!store.is_initialized());
        assert!(!dir.path().join("eclipse").exists());

        let old_entries: Vec<String> = fs::read_dir(dir.path().join("old"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(old_entries.iter().any(|n| n.starts_with("eclipse.old.")));

        // The new hash survives the move.
        assert!(store.get_string(KEY_CONTENTS_HASH).unwrap().is_some());
    }

    #[test]
    fn reconcile_is_idempotent_after_move() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let owner = Owner::org("eclipse").unwrap();

        store
            .reconcile_against_config(&["eclipse".to_string()], &[], &[])
            .unwrap();
        store.put_issue(&owner, &issue("che", 1)).unwrap();
        store.initialize();

        let new_orgs = vec!["other".to_string()];
        store.reconcile_against_config(&new_orgs, &[], &[]).unwrap();
        let entries_after_first: usize = fs::read_dir(dir.path().join("old")).unwrap().count();

        store.reconcile_against_config(&new_orgs, &[], &[]).unwrap();
        let entries_after_second: usize = fs::read_dir(dir.path().join("old")).unwrap().count();

        assert_eq!(entries_after_first, entries_after_second);
    }

    #[test]
    fn contents_hash_ignores_case_and_order() {
        let a = contents_hash(
            &["Eclipse".to_string(), "golang".to_string()],
            &[],
            &["a/b".to_string()],
        );
        let b = contents_hash(
            &["golang".to_string(), "eclipse".to_string()],
            &[],
            &["A/B".to_string()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn contents_hash_distinguishes_list_membership() {
        // The same name in a different list must hash differently.
        let a = contents_hash(&["eclipse".to_string()], &[], &[]);
        let b = contents_hash(&[], &["eclipse".to_string()], &[]);
        assert_ne!(a, b);
    }
}
