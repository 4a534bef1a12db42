use at_telemetry::logging;

#[test]
fn test_init_logging_human() {
    // Second call is a no-op.
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn test_init_logging_json() {
    // Whichever test runs first owns the global subscriber; this must not panic.
    logging::init_logging_json("test-service-json", "info");

    tracing::info!(key = "value", "json log line");
}

#[test]
fn test_init_dispatches_on_flag() {
    logging::init("flag-test", "warn", true);
    logging::init("flag-test", "warn", false);
}
