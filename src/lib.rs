//! jobrelay: broker-backed job queues, workers, recurring schedules and
//! fleet coordination for background domain work.

pub mod broker;
pub mod config;
pub mod core;
pub mod domains;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod metrics;
