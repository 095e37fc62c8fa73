//! Runtime shared by the domain worker modules
//!
//! A module declares queues, a handler per queue and its recurring
//! templates; the runtime wires them into the queue manager, answers
//! coordination commands for its own queues and tracks the module
//! lifecycle.

use crate::core::manager::QueueManager;
use crate::core::worker::WorkerReport;
use crate::error::{QueueError, QueueResult};
use crate::events::{CoordinationEvent, Event, EventSubscription, WORKER_COORDINATION};
use crate::jobs::{JobHandler, QueueDefinition, QueueStats, RecurringJobDefinition};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a worker module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl ModuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleStatus::Created => "created",
            ModuleStatus::Initializing => "initializing",
            ModuleStatus::Running => "running",
            ModuleStatus::ShuttingDown => "shutting_down",
            ModuleStatus::Stopped => "stopped",
        }
    }

    pub fn is_running(self) -> bool {
        self == ModuleStatus::Running
    }
}

/// One queue of a module and the handler that consumes it
#[derive(Clone)]
pub struct QueueBinding {
    pub definition: QueueDefinition,
    pub handler: Arc<dyn JobHandler>,
}

impl QueueBinding {
    pub fn new(definition: QueueDefinition, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            definition,
            handler,
        }
    }
}

struct RuntimeInner {
    service: String,
    instance_id: String,
    manager: Arc<QueueManager>,
    bindings: Vec<QueueBinding>,
    recurring: Vec<RecurringJobDefinition>,
    status: RwLock<ModuleStatus>,
    coordination: Mutex<Option<EventSubscription>>,
}

#[derive(Clone)]
pub struct ModuleRuntime {
    inner: Arc<RuntimeInner>,
}

impl ModuleRuntime {
    pub fn new(
        manager: Arc<QueueManager>,
        service: impl Into<String>,
        bindings: Vec<QueueBinding>,
        recurring: Vec<RecurringJobDefinition>,
    ) -> Self {
        let service = service.into();
        let instance_id = format!("{}-{}", service, uuid::Uuid::new_v4().simple());
        Self {
            inner: Arc::new(RuntimeInner {
                service,
                instance_id,
                manager,
                bindings,
                recurring,
                status: RwLock::new(ModuleStatus::Created),
                coordination: Mutex::new(None),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn status(&self) -> ModuleStatus {
        *self.inner.status.read()
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.inner.manager
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.queue_names()
    }

    pub fn recurring(&self) -> &[RecurringJobDefinition] {
        &self.inner.recurring
    }

    /// Start workers, register recurring templates and join the
    /// coordination channel. Calling it on a running module is a no-op.
    pub async fn initialize(&self) -> QueueResult<()> {
        {
            let mut status = self.inner.status.write();
            match *status {
                ModuleStatus::Running => return Ok(()),
                ModuleStatus::Created => *status = ModuleStatus::Initializing,
                other => {
                    return Err(QueueError::InvalidState(format!(
                        "{} cannot initialize while {}",
                        self.inner.service,
                        other.as_str()
                    )))
                }
            }
        }

        match self.start().await {
            Ok(()) => {
                *self.inner.status.write() = ModuleStatus::Running;
                info!(
                    service = %self.inner.service,
                    instance_id = %self.inner.instance_id,
                    queues = self.inner.bindings.len(),
                    recurring = self.inner.recurring.len(),
                    "{}: initialized",
                    self.inner.service
                );
                Ok(())
            }
            Err(e) => {
                error!(service = %self.inner.service, error = %e, "{}: initialization failed", self.inner.service);
                self.inner.coordination.lock().take();
                self.inner.manager.stop_recurring(&self.inner.recurring_keys());
                self.inner
                    .manager
                    .close_workers(&self.inner.queue_names(), Instant::now())
                    .await;
                *self.inner.status.write() = ModuleStatus::Created;
                Err(e)
            }
        }
    }

    async fn start(&self) -> QueueResult<()> {
        let manager = &self.inner.manager;
        manager.initialize().await?;

        for binding in &self.inner.bindings {
            manager.register_queue(binding.definition.clone());
            manager.create_worker(&binding.definition.name, binding.handler.clone())?;
        }

        for definition in &self.inner.recurring {
            let created = manager.register_recurring(definition.clone()).await?;
            debug!(
                service = %self.inner.service,
                key = %definition.key(),
                created,
                "{}: recurring job ready",
                self.inner.service
            );
        }

        let weak: Weak<RuntimeInner> = Arc::downgrade(&self.inner);
        let subscription = manager
            .subscribe_to_events(WORKER_COORDINATION, move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_coordination(event).await;
                    }
                }
            })
            .await?;
        *self.inner.coordination.lock() = Some(subscription);
        Ok(())
    }

    pub async fn queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        let mut stats = Vec::with_capacity(self.inner.bindings.len());
        for name in self.inner.queue_names() {
            stats.push(self.inner.manager.get_queue_stats(&name).await?);
        }
        Ok(stats)
    }

    pub async fn pause_all(&self) -> QueueResult<()> {
        self.inner.pause_all().await
    }

    pub async fn resume_all(&self) -> QueueResult<()> {
        self.inner.resume_all().await
    }

    pub async fn shutdown(&self) -> WorkerReport {
        self.shutdown_with_timeout(self.inner.manager.settings().drain_timeout)
            .await
    }

    /// Leave the coordination channel, stop this module's recurring tick
    /// loops and drain its workers for at most `drain_timeout`.
    pub async fn shutdown_with_timeout(&self, drain_timeout: Duration) -> WorkerReport {
        {
            let mut status = self.inner.status.write();
            match *status {
                ModuleStatus::ShuttingDown | ModuleStatus::Stopped => return WorkerReport::default(),
                ModuleStatus::Created => {
                    *status = ModuleStatus::Stopped;
                    return WorkerReport::default();
                }
                ModuleStatus::Initializing | ModuleStatus::Running => {
                    *status = ModuleStatus::ShuttingDown
                }
            }
        }
        info!(service = %self.inner.service, "{}: shutting down", self.inner.service);

        self.inner.coordination.lock().take();
        self.inner.manager.stop_recurring(&self.inner.recurring_keys());
        let report = self
            .inner
            .manager
            .close_workers(&self.inner.queue_names(), Instant::now() + drain_timeout)
            .await;

        *self.inner.status.write() = ModuleStatus::Stopped;
        info!(service = %self.inner.service, report = ?report, "{}: stopped", self.inner.service);
        report
    }
}

impl RuntimeInner {
    fn queue_names(&self) -> Vec<String> {
        self.bindings
            .iter()
            .map(|b| b.definition.name.clone())
            .collect()
    }

    fn recurring_keys(&self) -> Vec<String> {
        self.recurring.iter().map(|d| d.key()).collect()
    }

    async fn pause_all(&self) -> QueueResult<()> {
        for name in self.queue_names() {
            self.manager.pause_queue(&name).await?;
        }
        info!(service = %self.service, "{}: all queues paused", self.service);
        Ok(())
    }

    async fn resume_all(&self) -> QueueResult<()> {
        for name in self.queue_names() {
            self.manager.resume_queue(&name).await?;
        }
        info!(service = %self.service, "{}: all queues resumed", self.service);
        Ok(())
    }

    async fn on_coordination(&self, event: Event) {
        let Some(message) = CoordinationEvent::from_event(&event) else {
            debug!(event = %event.event, "{}: ignoring coordination event", self.service);
            return;
        };
        if !message.targets(&self.service) {
            return;
        }

        let reply = match &message {
            CoordinationEvent::PauseWorkers { .. } | CoordinationEvent::ResumeWorkers { .. } => {
                let pausing = matches!(message, CoordinationEvent::PauseWorkers { .. });
                let outcome = if pausing {
                    self.pause_all().await
                } else {
                    self.resume_all().await
                };
                if let Err(e) = &outcome {
                    warn!(service = %self.service, command = message.name(), error = %e, "{}: command failed", self.service);
                }
                CoordinationEvent::CommandAck {
                    command: message.name().to_string(),
                    instance_id: self.instance_id.clone(),
                    applied: outcome.is_ok(),
                }
            }
            CoordinationEvent::HealthCheck => {
                let status = *self.status.read();
                CoordinationEvent::HealthCheckResponse {
                    is_running: status.is_running(),
                    status: status.as_str().to_string(),
                    instance_id: self.instance_id.clone(),
                }
            }
            _ => return,
        };

        let reply = reply.into_event(&self.service, event.correlation_id.clone());
        if let Err(e) = self.manager.publish_event(WORKER_COORDINATION, &reply).await {
            warn!(service = %self.service, error = %e, "{}: failed to answer {}", self.service, event.event);
        }
    }
}
