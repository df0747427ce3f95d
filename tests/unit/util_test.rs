//! Tests for utility functions

use sliver_agent::util::{init_tracing, init_tracing_with, log_filter, now_ms, now_secs};

#[test]
fn test_clock_is_consistent() {
    let secs = now_secs();
    let ms = now_ms();
    assert!(secs > 1_600_000_000.0);
    let ms_secs = u32::try_from(ms / 1000).map(f64::from).unwrap();
    assert!((ms_secs - secs).abs() <= 1.0);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!(test = "util", "tracing initialized twice");
}

#[test]
fn test_log_filter_directives() {
    let filter = log_filter(Some("sliver_agent=debug,warn")).unwrap();
    assert!(filter.to_string().contains("sliver_agent=debug"));
    assert!(log_filter(Some("sliver_agent=loud")).is_err());
}

#[test]
fn test_init_tracing_rejects_bad_filter() {
    assert!(init_tracing_with(Some("sliver_agent=loud")).is_err());
    init_tracing();
    assert_eq!(init_tracing_with(Some("sliver_agent=trace")), Ok(false));
}
