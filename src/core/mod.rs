//! Queue orchestration: manager, workers, recurring scheduler, module
//! runtime and the ops HTTP surface

pub mod http;
pub mod manager;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod worker;

pub use manager::QueueManager;
pub use queue::{Enqueued, Queue};
pub use runtime::{ModuleRuntime, ModuleStatus, QueueBinding};
pub use scheduler::{parse_cron, recurring_job_id, to_cron_expression, RecurringScheduler};
pub use worker::{
    failure_disposition, spawn_worker, JobOutcome, JobPhase, WorkerConfig, WorkerHandle,
    WorkerReport,
};
