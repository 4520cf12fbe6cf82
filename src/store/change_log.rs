//! Change-event log storage.
//!
//! Each log file under `events/` holds a JSON array of resource-change
//! events and is named `issue-<ms>.json` after its first event's timestamp.
//! Most files hold a single event; the list-per-file format exists so that
//! millisecond collisions never overwrite an earlier file's events; a
//! colliding append bumps its timestamp until it finds an unused name.
//!
//! Entries expire: any file whose filename timestamp is more than eight days
//! old is deleted during the next read pass. Deletion failures are ignored;
//! the next read tries again.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::types::ResourceChangeEvent;

use super::Result;

/// Retention window for change events.
const RETENTION_DAYS: i64 = 8;

const FILE_PREFIX: &str = "issue-";
const FILE_SUFFIX: &str = ".json";

/// Appends a batch of events under the first event's timestamp.
///
/// The caller holds the store's write lock.
pub(crate) fn append(events_dir: &Path, events: &[ResourceChangeEvent]) -> Result<()> {
    let Some(first) = events.first() else {
        return Ok(());
    };

    fs::create_dir_all(events_dir)?;

    // Resolve a millisecond collision by bumping until the name is free.
    let mut timestamp = first.time;
    let mut path = file_for(events_dir, timestamp);
    while path.exists() {
        timestamp += 1;
        path = file_for(events_dir, timestamp);
    }

    let contents = serde_json::to_vec(events)?;
    fs::write(&path, contents)?;

    debug!(path = %path.display(), count = events.len(), "appended change events");
    Ok(())
}

/// Reads events with `time >= since_ms`, ascending by time.
///
/// Files past the retention window are deleted on the way through; a failed
/// deletion is logged and otherwise ignored. The caller holds the store's
/// write lock (the pass may delete).
pub(crate) fn read_recent(events_dir: &Path, since_ms: i64) -> Result<Vec<ResourceChangeEvent>> {
    let read_dir = match fs::read_dir(events_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let expiry_cutoff = Utc::now().timestamp_millis() - RETENTION_DAYS * 24 * 60 * 60 * 1000;

    let mut result = Vec::new();

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();

        let Some(file_timestamp) = parse_file_timestamp(&path) else {
            continue;
        };

        if file_timestamp < expiry_cutoff {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to GC expired change-event file");
            }
            continue;
        }

        let bytes = fs::read(&path)?;
        let events: Vec<ResourceChangeEvent> = serde_json::from_slice(&bytes)?;
        result.extend(events.into_iter().filter(|e| e.time >= since_ms));
    }

    result.sort_by_key(|e| e.time);
    Ok(result)
}

fn file_for(events_dir: &Path, timestamp: i64) -> PathBuf {
    events_dir.join(format!("{}{}{}", FILE_PREFIX, timestamp, FILE_SUFFIX))
}

/// Parses the timestamp out of an `issue-<ms>.json` filename.
fn parse_file_timestamp(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    let middle = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    middle.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(time: i64, issue: i64) -> ResourceChangeEvent {
        ResourceChangeEvent {
            time,
            uuid: format!("uuid-{}", issue),
            owner: "eclipse".into(),
            repo: "che".into(),
            issue_number: issue,
        }
    }

    #[test]
    fn append_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp_millis();

        append(dir.path(), &[event(now, 1)]).unwrap();
        let events = read_recent(dir.path(), 0).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].issue_number, 1);
    }

    #[test]
    fn since_filter_is_inclusive() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp_millis();

        append(dir.path(), &[event(now, 1)]).unwrap();
        append(dir.path(), &[event(now + 100, 2)]).unwrap();

        let events = read_recent(dir.path(), now + 100).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].issue_number, 2);
    }

    #[test]
    fn results_sorted_ascending_by_time() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp_millis();

        append(dir.path(), &[event(now + 200, 3)]).unwrap();
        append(dir.path(), &[event(now, 1)]).unwrap();
        append(dir.path(), &[event(now + 100, 2)]).unwrap();

        let events = read_recent(dir.path(), 0).unwrap();
        let times: Vec<i64> = events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![now, now + 100, now + 200]);
    }

    #[test]
    fn millisecond_collision_bumps_filename() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp_millis();

        append(dir.path(), &[event(now, 1)]).unwrap();
        append(dir.path(), &[event(now, 2)]).unwrap();

        // Both files exist under distinct names.
        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);

        let events = read_recent(dir.path(), 0).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn expired_files_are_deleted_on_read() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp_millis();
        let nine_days_ago = now - 9 * 24 * 60 * 60 * 1000;

        append(dir.path(), &[event(nine_days_ago, 1)]).unwrap();
        append(dir.path(), &[event(now, 2)]).unwrap();

        let events = read_recent(dir.path(), 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].issue_number, 2);

        // The expired file is physically gone.
        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let dir = tempdir().unwrap();
        append(dir.path(), &[]).unwrap();
        assert!(!dir.path().join("events").exists());
        assert!(read_recent(dir.path(), 0).unwrap().is_empty());
    }
}
