use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::debug;

/// The most recently modified transcript and its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestTranscript {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl LatestTranscript {
    /// Time since the last write, zero if the mtime is in the future.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug)]
struct Cached {
    path: PathBuf,
    located_at: Instant,
}

/// Finds the newest `.jsonl` transcript one level below a root directory.
///
/// The result is cached for a TTL; a watcher event naming a transcript
/// replaces the cached path immediately via [`prefer`](Self::prefer).
#[derive(Debug)]
pub struct TranscriptLocator {
    root: PathBuf,
    recency_window: Duration,
    ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl TranscriptLocator {
    pub fn new(root: impl Into<PathBuf>, recency_window: Duration, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            recency_window,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locate the latest transcript modified within the recency window.
    ///
    /// A missing root yields `Ok(None)`; other I/O errors on the root are
    /// returned. Unreadable project directories are skipped.
    pub async fn latest(&self) -> io::Result<Option<LatestTranscript>> {
        let now = SystemTime::now();

        if let Some(path) = self.cached_path() {
            match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => {
                    let latest = LatestTranscript { path, modified };
                    return Ok(self.within_window(latest, now));
                }
                Err(_) => {
                    debug!(path = %path.display(), "cached transcript vanished");
                    self.invalidate();
                }
            }
        }

        let found = self.scan().await?;
        if let Some(latest) = &found {
            self.remember(latest.path.clone());
        }
        Ok(found.and_then(|latest| self.within_window(latest, now)))
    }

    /// A watcher saw `path` being written; it is now the latest transcript.
    pub fn prefer(&self, path: &Path) {
        self.remember(path.to_path_buf());
    }

    /// Drop the cache if it points at `path`.
    pub fn forget(&self, path: &Path) {
        let mut cached = self.cached.lock().expect("locator lock poisoned");
        if cached.as_ref().is_some_and(|c| c.path == path) {
            *cached = None;
        }
    }

    pub fn invalidate(&self) {
        *self.cached.lock().expect("locator lock poisoned") = None;
    }

    fn remember(&self, path: PathBuf) {
        *self.cached.lock().expect("locator lock poisoned") = Some(Cached {
            path,
            located_at: Instant::now(),
        });
    }

    fn cached_path(&self) -> Option<PathBuf> {
        let cached = self.cached.lock().expect("locator lock poisoned");
        cached
            .as_ref()
            .filter(|c| c.located_at.elapsed() < self.ttl)
            .map(|c| c.path.clone())
    }

    fn within_window(&self, latest: LatestTranscript, now: SystemTime) -> Option<LatestTranscript> {
        (latest.age(now) <= self.recency_window).then_some(latest)
    }

    async fn scan(&self) -> io::Result<Option<LatestTranscript>> {
        let mut projects = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut best: Option<LatestTranscript> = None;
        while let Some(project) = projects.next_entry().await? {
            let is_dir = project.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Ok(mut files) = tokio::fs::read_dir(project.path()).await else {
                debug!(dir = %project.path().display(), "skipping unreadable project directory");
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Ok(modified) = file.metadata().await.and_then(|m| m.modified()) else {
                    continue;
                };
                if best.as_ref().is_none_or(|b| modified > b.modified) {
                    best = Some(LatestTranscript { path, modified });
                }
            }
        }
        Ok(best)
    }
}
