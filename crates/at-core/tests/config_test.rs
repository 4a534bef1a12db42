use at_core::config::Config;
use std::time::Duration;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.project_name, "auto-claude");
    assert_eq!(cfg.general.log_level, "info");
    assert!(!cfg.general.log_json);
    assert_eq!(cfg.monitor.debounce(), Duration::from_millis(500));
    assert_eq!(cfg.monitor.recency_window(), Duration::from_secs(300));
    assert_eq!(cfg.monitor.latest_file_ttl(), Duration::from_secs(60));
    assert_eq!(cfg.monitor.fresh_write(), Duration::from_secs(3));
    assert_eq!(cfg.monitor.recheck(), Duration::from_secs(15));
    assert_eq!(cfg.monitor.question_max_age_secs, 30);
    assert_eq!(cfg.queue.max_parallel_tasks, 3);
    assert!(cfg.queue.failure_detection);
    assert_eq!(cfg.queue.max_consecutive_failures, 10);
    assert_eq!(cfg.recovery.poll_interval(), Duration::from_secs(30));
    assert_eq!(cfg.recovery.in_flight_timeout(), Duration::from_secs(90));
    assert!(cfg.recovery.destination.is_none());
    assert!(cfg.monitor.transcripts_root.ends_with(".claude/projects"));
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("auto-claude"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.general.project_name, cfg.general.project_name);
    assert_eq!(parsed.queue.max_parallel_tasks, cfg.queue.max_parallel_tasks);
    assert_eq!(parsed.monitor.recheck_secs, cfg.monitor.recheck_secs);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[general]
project_name = "my-project"

[queue]
max_parallel_tasks = 2
failure_detection = false

[recovery]
destination = "claude:1.0"
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.general.project_name, "my-project");
    assert_eq!(cfg.queue.max_parallel_tasks, 2);
    assert!(!cfg.queue.failure_detection);
    assert_eq!(cfg.recovery.destination.as_deref(), Some("claude:1.0"));
    // defaults should fill in the rest
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.monitor.debounce_ms, 500);
    assert_eq!(cfg.recovery.max_attempts, 3);
    cfg.validate().expect("config validates");
}

#[test]
fn zero_parallelism_fails_validation() {
    let mut cfg = Config::default();
    cfg.queue.max_parallel_tasks = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_parallel_tasks"));
}

#[test]
fn fresh_write_must_stay_below_recheck() {
    let mut cfg = Config::default();
    cfg.monitor.fresh_write_secs = 20;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("fresh_write_secs"));
}

#[test]
fn in_flight_timeout_shorter_than_poll_fails() {
    let mut cfg = Config::default();
    cfg.recovery.in_flight_timeout_secs = 10;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("in_flight_timeout_secs"));
}

#[test]
fn load_from_reports_parse_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[queue\nmax_parallel_tasks = ").unwrap();
    let err = Config::load_from(&path).expect_err("broken toml");
    assert!(err.to_string().starts_with("parse:"));
}
