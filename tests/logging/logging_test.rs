//! Tests for `src/logging.rs`.

use kuberun::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir_and_installs_once() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    let first = kuberun::logging::init_production(&logs_dir);
    assert!(first.is_ok(), "first subscriber install should succeed");
    assert!(logs_dir.exists(), "logs directory should be created");

    assert!(kuberun::logging::init_cli().is_err());

    let span = kuberun::logging::connection_span("deadbeef", "10.0.0.7:52022".parse().expect("valid address"));
    let metadata = span.metadata().expect("connection spans are enabled at info");
    assert_eq!(metadata.name(), "connection");
    assert!(metadata.fields().field("connection_id").is_some());
    assert!(metadata.fields().field("remote").is_some());
}
