use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{Config, ConfigError, QueueConfig};

/// Manages loading and saving settings to a TOML file on disk.
pub struct SettingsManager {
    path: PathBuf,
}

impl SettingsManager {
    /// Create a new `SettingsManager` that reads/writes the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a `SettingsManager` using the default config location
    /// (`~/.auto-claude/config.toml`).
    pub fn default_path() -> Self {
        Self {
            path: Config::default_path(),
        }
    }

    /// Load config from the TOML file on disk. A missing file yields the
    /// defaults; an unreadable or invalid one is an error.
    pub fn load(&self) -> Result<Config, ConfigError> {
        if !self.path.exists() {
            let cfg = Config::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        Config::load_from(&self.path)
    }

    /// Save config to the TOML file on disk, creating parent directories if
    /// they don't exist.
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let text = config.to_toml()?;
        std::fs::write(&self.path, text).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Return the file path this manager reads/writes.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// ProjectSettings
// ---------------------------------------------------------------------------

/// Live per-project settings shared by the scheduler and the recovery loop.
///
/// Reads are plain atomic loads so they can happen in the middle of a
/// promotion pass without yielding.
#[derive(Debug, Clone)]
pub struct ProjectSettings {
    inner: Arc<ProjectSettingsInner>,
}

#[derive(Debug)]
struct ProjectSettingsInner {
    failure_detection: AtomicBool,
    max_parallel_tasks: AtomicUsize,
}

impl ProjectSettings {
    pub fn new(failure_detection: bool, max_parallel_tasks: usize) -> Self {
        Self {
            inner: Arc::new(ProjectSettingsInner {
                failure_detection: AtomicBool::new(failure_detection),
                max_parallel_tasks: AtomicUsize::new(max_parallel_tasks.max(1)),
            }),
        }
    }

    pub fn from_config(queue: &QueueConfig) -> Self {
        Self::new(queue.failure_detection, queue.max_parallel_tasks)
    }

    pub fn failure_detection(&self) -> bool {
        self.inner.failure_detection.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_failure_detection(&self, enabled: bool) -> bool {
        self.inner.failure_detection.swap(enabled, Ordering::SeqCst)
    }

    pub fn max_parallel_tasks(&self) -> usize {
        self.inner.max_parallel_tasks.load(Ordering::SeqCst)
    }

    /// Returns the previous value. Zero is clamped to one.
    pub fn set_max_parallel_tasks(&self, max: usize) -> usize {
        self.inner.max_parallel_tasks.swap(max.max(1), Ordering::SeqCst)
    }
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SettingsManager::new(dir.path().join("nested").join("config.toml"));

        let mut cfg = Config::default();
        cfg.general.project_name = "roundtrip-test".into();
        cfg.queue.max_parallel_tasks = 5;
        cfg.recovery.destination = Some("auto-claude:0.1".into());

        mgr.save(&cfg).unwrap();
        let loaded = mgr.load().unwrap();

        assert_eq!(loaded.general.project_name, "roundtrip-test");
        assert_eq!(loaded.queue.max_parallel_tasks, 5);
        assert_eq!(loaded.recovery.destination.as_deref(), Some("auto-claude:0.1"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SettingsManager::new(dir.path().join("missing.toml"));

        let cfg = mgr.load().unwrap();
        assert_eq!(cfg.general.project_name, "auto-claude");
        assert_eq!(cfg.queue.max_parallel_tasks, 3);
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue\nmax_parallel_tasks = ").unwrap();
        assert!(matches!(
            SettingsManager::new(&path).load(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn save_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mgr = SettingsManager::new(&path);

        let mut cfg = Config::default();
        cfg.queue.max_parallel_tasks = 0;
        assert!(mgr.save(&cfg).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn project_settings_clamp_and_swap() {
        let settings = ProjectSettings::new(true, 0);
        assert_eq!(settings.max_parallel_tasks(), 1);

        let shared = settings.clone();
        assert_eq!(shared.set_max_parallel_tasks(4), 1);
        assert_eq!(settings.max_parallel_tasks(), 4);

        assert!(settings.set_failure_detection(false));
        assert!(!shared.failure_detection());
    }
}
