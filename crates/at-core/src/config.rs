use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.auto-claude/config.toml`.
///
/// Every section is defaulted, so a missing file or a partial file both
/// produce a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Config {
    /// Load config from `~/.auto-claude/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitor.validate()?;
        self.queue.validate()?;
        self.recovery.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        home_dir().join(".auto-claude").join("config.toml")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_project_name() -> String {
    "auto-claude".into()
}
fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Activity monitor
// ---------------------------------------------------------------------------

/// Thresholds used to infer agent activity from transcript files.
///
/// `fresh_write_secs` and `recheck_secs` work as a pair: a file younger than
/// the fresh-write threshold is never content-parsed, and the recheck timer is
/// what brings the monitor back once it is old enough. Tune them together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Directory holding one subdirectory per project, each full of `.jsonl`
    /// transcripts. Defaults to `~/.claude/projects`.
    #[serde(default = "default_transcripts_root")]
    pub transcripts_root: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Transcripts not modified within this window are ignored.
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,
    /// How long the located latest transcript is reused before rescanning.
    #[serde(default = "default_latest_file_ttl_secs")]
    pub latest_file_ttl_secs: u64,
    #[serde(default = "default_fresh_write_secs")]
    pub fresh_write_secs: u64,
    /// An assistant entry without `stop_reason` is still streaming for this long.
    #[serde(default = "default_grace_secs")]
    pub streaming_grace_secs: u64,
    /// A trailing question older than this is an abandoned session.
    #[serde(default = "default_question_max_age_secs")]
    pub question_max_age_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub end_turn_grace_secs: u64,
    /// A trailing user entry older than this is an abandoned session.
    #[serde(default = "default_recency_window_secs")]
    pub abandoned_user_secs: u64,
    #[serde(default = "default_recheck_secs")]
    pub recheck_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            transcripts_root: default_transcripts_root(),
            debounce_ms: default_debounce_ms(),
            recency_window_secs: default_recency_window_secs(),
            latest_file_ttl_secs: default_latest_file_ttl_secs(),
            fresh_write_secs: default_fresh_write_secs(),
            streaming_grace_secs: default_grace_secs(),
            question_max_age_secs: default_question_max_age_secs(),
            end_turn_grace_secs: default_grace_secs(),
            abandoned_user_secs: default_recency_window_secs(),
            recheck_secs: default_recheck_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recheck_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor.recheck_secs must be at least 1".to_string(),
            ));
        }
        if self.fresh_write_secs >= self.recheck_secs {
            return Err(ConfigError::Validation(format!(
                "monitor.fresh_write_secs ({}) must be below monitor.recheck_secs ({})",
                self.fresh_write_secs, self.recheck_secs
            )));
        }
        if self.recency_window_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor.recency_window_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }
    pub fn latest_file_ttl(&self) -> Duration {
        Duration::from_secs(self.latest_file_ttl_secs)
    }
    pub fn fresh_write(&self) -> Duration {
        Duration::from_secs(self.fresh_write_secs)
    }
    pub fn recheck(&self) -> Duration {
        Duration::from_secs(self.recheck_secs)
    }
}

fn default_transcripts_root() -> PathBuf {
    home_dir().join(".claude").join("projects")
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_recency_window_secs() -> u64 {
    300
}
fn default_latest_file_ttl_secs() -> u64 {
    60
}
fn default_fresh_write_secs() -> u64 {
    3
}
fn default_grace_secs() -> u64 {
    10
}
fn default_question_max_age_secs() -> u64 {
    30
}
fn default_recheck_secs() -> u64 {
    15
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Cap on concurrently `in_progress` tasks.
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// Block promotion when a task fails or regresses.
    #[serde(default = "default_true")]
    pub failure_detection: bool,
    /// A promotion pass aborts after this many failed promotions in a row.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Optional JSON task file backing the task store.
    #[serde(default)]
    pub tasks_file: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            failure_detection: true,
            max_consecutive_failures: default_max_consecutive_failures(),
            tasks_file: None,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_tasks == 0 {
            return Err(ConfigError::Validation(
                "queue.max_parallel_tasks must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Validation(
                "queue.max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_parallel_tasks() -> usize {
    3
}
fn default_max_consecutive_failures() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Recovery messaging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How long a sent message blocks the next one when no idle signal arrives.
    #[serde(default = "default_in_flight_timeout_secs")]
    pub in_flight_timeout_secs: u64,
    /// Recovery attempts per task before it is escalated to a human.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// An `in_progress` task untouched for this long counts as stalled.
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,
    /// Terminal target (tmux pane or session) that receives recovery messages.
    #[serde(default)]
    pub destination: Option<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            in_flight_timeout_secs: default_in_flight_timeout_secs(),
            max_attempts: default_max_attempts(),
            stall_after_secs: default_stall_after_secs(),
            destination: None,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "recovery.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.in_flight_timeout_secs < self.poll_interval_secs {
            return Err(ConfigError::Validation(format!(
                "recovery.in_flight_timeout_secs ({}) must not be shorter than recovery.poll_interval_secs ({})",
                self.in_flight_timeout_secs, self.poll_interval_secs
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "recovery.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.in_flight_timeout_secs)
    }
    pub fn stall_after(&self) -> Duration {
        Duration::from_secs(self.stall_after_secs)
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_in_flight_timeout_secs() -> u64 {
    90
}
fn default_max_attempts() -> u32 {
    3
}
fn default_stall_after_secs() -> u64 {
    600
}
