//! Append-only change journal.
//!
//! When configured with a directory, every emitted resource-change event is
//! journaled as one line containing the event metadata and the full new
//! issue JSON. The journal is advisory: it exists for offline inspection,
//! and write failures must never fail the write that triggered them.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

/// Journal file writer. Construct with [`FileLog::disabled`] when no journal
/// directory is configured; all writes become no-ops.
pub struct FileLog {
    inner: Option<Mutex<LogTarget>>,
}

struct LogTarget {
    dir: PathBuf,
}

impl FileLog {
    /// A journal rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLog {
            inner: Some(Mutex::new(LogTarget { dir: dir.into() })),
        }
    }

    /// A journal that drops everything.
    pub fn disabled() -> Self {
        FileLog { inner: None }
    }

    /// Appends one line, prefixed with the current UTC time. Errors are
    /// logged and swallowed.
    pub fn out(&self, line: &str) {
        let Some(inner) = &self.inner else {
            return;
        };

        let target = inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = Utc::now();
        let path = target.dir.join(format!("mirror-{}.log", now.format("%Y-%m-%d")));

        let result = fs::create_dir_all(&target.dir).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{} {}", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"), line)
        });

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "file log write failed");
        }
    }
}
