//! Cron translation and tick computation for recurring jobs

use chrono::{DateTime, TimeZone, Utc};
use jobrelay::core::scheduler::{parse_cron, recurring_job_id, to_cron_expression};
use jobrelay::domains::{financial, trading};
use jobrelay::error::QueueError;

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn next_after(pattern: &str, from: DateTime<Utc>) -> DateTime<Utc> {
    parse_cron(pattern).unwrap().after(&from).next().unwrap()
}

#[test]
fn weekday_ranges_skip_the_weekend() {
    // 2024-06-01 is a Saturday
    let saturday = at(2024, 6, 1, 12, 0);
    assert_eq!(next_after("0 21 * * 1-5", saturday), at(2024, 6, 3, 21, 0));

    let friday_evening = at(2024, 6, 7, 21, 30);
    assert_eq!(next_after("0 21 * * 1-5", friday_evening), at(2024, 6, 10, 21, 0));
}

#[test]
fn sunday_accepts_zero_and_seven() {
    let saturday = at(2024, 6, 1, 12, 0);
    assert_eq!(next_after("0 0 * * 0", saturday), at(2024, 6, 2, 0, 0));
    assert_eq!(next_after("0 0 * * 7", saturday), at(2024, 6, 2, 0, 0));
    assert_eq!(
        to_cron_expression("0 0 * * 0").unwrap(),
        to_cron_expression("0 0 * * 7").unwrap()
    );
}

#[test]
fn step_and_calendar_patterns() {
    assert_eq!(next_after("*/15 * * * *", at(2024, 6, 1, 10, 7)), at(2024, 6, 1, 10, 15));
    assert_eq!(next_after("*/5 * * * *", at(2024, 6, 1, 10, 55)), at(2024, 6, 1, 11, 0));
    assert_eq!(next_after("0 2 * * *", at(2024, 6, 1, 2, 0)), at(2024, 6, 2, 2, 0));
    assert_eq!(next_after("0 6 1 * *", at(2024, 1, 15, 0, 0)), at(2024, 2, 1, 6, 0));
}

#[test]
fn malformed_patterns_are_invalid_cron() {
    for pattern in ["61 * * * *", "* * * *", "0 0 * * 8", "0 0 * * 5-1", "every minute"] {
        match parse_cron(pattern) {
            Err(QueueError::InvalidCron { pattern: p, .. }) => assert_eq!(p, pattern),
            other => panic!("{} should be rejected, got {:?}", pattern, other.map(|_| ())),
        }
    }
}

#[test]
fn every_built_in_template_parses() {
    for definition in financial::recurring_jobs()
        .into_iter()
        .chain(trading::recurring_jobs())
    {
        assert!(
            parse_cron(&definition.cron_pattern).is_ok(),
            "{} has an invalid pattern",
            definition.key()
        );
    }
}

#[test]
fn recurring_ids_differ_per_tick_and_key() {
    let tick = at(2024, 6, 1, 10, 15);
    let a = recurring_job_id("q:job:*/15 * * * *", tick);
    assert_eq!(a, recurring_job_id("q:job:*/15 * * * *", tick));
    assert_ne!(a, recurring_job_id("q:job:*/15 * * * *", at(2024, 6, 1, 10, 30)));
    assert_ne!(a, recurring_job_id("q:other:*/15 * * * *", tick));
    assert!(a.starts_with("repeat:"));
}
