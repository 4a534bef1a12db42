use chrono::{DateTime, Utc};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file change event detected by the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// Configuration for the transcript watcher.
#[derive(Debug, Clone)]
pub struct FileWatcherConfig {
    /// Directory whose immediate subdirectories are watched.
    pub root_path: PathBuf,
    /// Only files with one of these extensions produce events.
    pub extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

impl FileWatcherConfig {
    pub fn transcripts(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Self::default()
        }
    }
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            extensions: vec!["jsonl".to_string()],
            ignore_patterns: vec![".git".to_string()],
        }
    }
}

/// Maps a `notify::EventKind` to our `FileChangeKind`, returning `None` for
/// event kinds we do not care about (e.g. access events).
fn map_event_kind(kind: &EventKind) -> Option<FileChangeKind> {
    match kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => Some(FileChangeKind::Created),
        EventKind::Create(_) => Some(FileChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both | RenameMode::From | RenameMode::To)) => {
            Some(FileChangeKind::Renamed)
        }
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any) => {
            Some(FileChangeKind::Modified)
        }
        EventKind::Modify(_) => Some(FileChangeKind::Modified),
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => Some(FileChangeKind::Deleted),
        EventKind::Remove(_) => Some(FileChangeKind::Deleted),
        _ => None,
    }
}

/// Watches a transcript root: the root itself non-recursively (to notice new
/// project directories) and every subdirectory recursively.
///
/// Each subdirectory gets its own watch so one unreadable directory only
/// costs that directory.
pub struct FileWatcher {
    config: FileWatcherConfig,
    watched_paths: HashSet<PathBuf>,
    watcher: RecommendedWatcher,
    rx: flume::Receiver<notify::Result<notify::Event>>,
}

impl FileWatcher {
    /// Create a watcher and register the root plus its subdirectories.
    ///
    /// Fails only when the root itself cannot be read or watched.
    pub fn start(config: FileWatcherConfig) -> Result<Self, notify::Error> {
        let entries = std::fs::read_dir(&config.root_path).map_err(notify::Error::io)?;

        let (tx, rx) = flume::unbounded();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let mut fw = Self {
            config,
            watched_paths: HashSet::new(),
            watcher,
            rx,
        };

        let root = fw.config.root_path.clone();
        fw.watcher.watch(&root, RecursiveMode::NonRecursive)?;
        fw.watched_paths.insert(root);

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                fw.try_add_watch(&path);
            }
        }

        debug!(
            root = %fw.config.root_path.display(),
            watched = fw.watched_paths.len(),
            "transcript watcher started"
        );
        Ok(fw)
    }

    /// Watch `path` recursively, logging and skipping on failure.
    pub fn try_add_watch(&mut self, path: &Path) -> bool {
        if self.is_ignored(path) || self.watched_paths.contains(path) {
            return false;
        }
        match self.watcher.watch(path, RecursiveMode::Recursive) {
            Ok(()) => {
                self.watched_paths.insert(path.to_path_buf());
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unwatchable directory");
                false
            }
        }
    }

    /// Return all currently watched paths.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_paths.iter().cloned().collect()
    }

    /// Wait for the next batch of relevant events.
    ///
    /// Returns `None` once the underlying notify channel is closed. New
    /// project directories appearing under the root are watched before their
    /// events are returned.
    pub async fn next_events(&mut self) -> Option<Vec<FileChangeEvent>> {
        loop {
            let first = self.rx.recv_async().await.ok()?;
            let mut raw = vec![first];
            raw.extend(self.rx.try_iter());

            let events = self.translate(raw);
            if !events.is_empty() {
                return Some(events);
            }
        }
    }

    fn translate(&mut self, raw: Vec<notify::Result<notify::Event>>) -> Vec<FileChangeEvent> {
        let now = Utc::now();
        let mut events = Vec::new();

        for result in raw {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "watcher error");
                    continue;
                }
            };
            let Some(kind) = map_event_kind(&event.kind) else {
                continue;
            };

            for path in event.paths {
                if self.is_ignored(&path) {
                    continue;
                }
                if kind == FileChangeKind::Created
                    && path.is_dir()
                    && path.parent() == Some(self.config.root_path.as_path())
                {
                    self.try_add_watch(&path);
                    continue;
                }
                if !self.has_wanted_extension(&path) {
                    continue;
                }
                events.push(FileChangeEvent {
                    path,
                    kind: kind.clone(),
                    timestamp: now,
                });
            }
        }

        events
    }

    /// A path is ignored when a component below the root is exactly one of
    /// the ignore names.
    fn is_ignored(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.config.root_path).unwrap_or(path);
        relative.components().any(|c| {
            self.config
                .ignore_patterns
                .iter()
                .any(|name| c.as_os_str() == name.as_str())
        })
    }

    fn has_wanted_extension(&self, path: &Path) -> bool {
        if self.config.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.config.extensions.iter().any(|want| want == ext))
    }
}
