//! Prometheus counters emitted by the job layer.
//!
//! The registry is scraped by an external collector through `export()`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub jobs_enqueued_total: IntCounterVec,
    pub jobs_completed_total: IntCounterVec,
    pub jobs_failed_total: IntCounterVec,
    pub jobs_retried_total: IntCounterVec,
    pub jobs_dead_lettered_total: IntCounterVec,
    pub jobs_active: IntGaugeVec,
    pub job_duration_seconds: HistogramVec,
    pub events_published_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_enqueued_total = IntCounterVec::new(
            Opts::new("jobs_enqueued_total", "Jobs added to a queue"),
            &["queue"],
        )?;
        let jobs_completed_total = IntCounterVec::new(
            Opts::new("jobs_completed_total", "Jobs completed successfully"),
            &["queue"],
        )?;
        let jobs_failed_total = IntCounterVec::new(
            Opts::new("jobs_failed_total", "Job attempts that ended in failure"),
            &["queue"],
        )?;
        let jobs_retried_total = IntCounterVec::new(
            Opts::new("jobs_retried_total", "Failed jobs scheduled for another attempt"),
            &["queue"],
        )?;
        let jobs_dead_lettered_total = IntCounterVec::new(
            Opts::new("jobs_dead_lettered_total", "Jobs moved to the failed set for good"),
            &["queue"],
        )?;
        let jobs_active = IntGaugeVec::new(
            Opts::new("jobs_active", "Jobs currently being processed in this process"),
            &["queue"],
        )?;
        let job_duration_seconds = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Handler execution time")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["queue"],
        )?;
        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Events published on pub/sub channels"),
            &["channel"],
        )?;

        registry.register(Box::new(jobs_enqueued_total.clone()))?;
        registry.register(Box::new(jobs_completed_total.clone()))?;
        registry.register(Box::new(jobs_failed_total.clone()))?;
        registry.register(Box::new(jobs_retried_total.clone()))?;
        registry.register(Box::new(jobs_dead_lettered_total.clone()))?;
        registry.register(Box::new(jobs_active.clone()))?;
        registry.register(Box::new(job_duration_seconds.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;

        Ok(Self {
            registry,
            jobs_enqueued_total,
            jobs_completed_total,
            jobs_failed_total,
            jobs_retried_total,
            jobs_dead_lettered_total,
            jobs_active,
            job_duration_seconds,
            events_published_total,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
