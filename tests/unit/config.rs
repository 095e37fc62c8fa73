//! Worker settings defaults and builders

use jobrelay::config::WorkerSettings;
use std::time::Duration;

#[test]
fn defaults_run_both_modules() {
    let settings = WorkerSettings::default();
    assert_eq!(settings.concurrency, 5);
    assert_eq!(settings.max_attempts, 3);
    assert_eq!(settings.drain_timeout, Duration::from_secs(30));
    assert_eq!(settings.queue_prefix, "jobrelay");
    assert_eq!(settings.modules, vec!["financial".to_string(), "trading".to_string()]);
    assert!(settings.port > 0);
}

#[test]
fn builders_override_and_clamp() {
    let settings = WorkerSettings::default()
        .with_concurrency(0)
        .with_drain_timeout(Duration::from_millis(250))
        .with_poll_interval(Duration::from_millis(5))
        .with_backoff(Duration::from_millis(40))
        .with_health_check_timeout(Duration::from_millis(100));

    assert_eq!(settings.concurrency, 1);
    assert_eq!(settings.drain_timeout, Duration::from_millis(250));
    assert_eq!(settings.poll_interval, Duration::from_millis(5));
    assert_eq!(settings.backoff, Duration::from_millis(40));
    assert_eq!(settings.health_check_timeout, Duration::from_millis(100));
}
