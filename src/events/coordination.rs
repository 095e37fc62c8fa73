//! Fleet control over `WORKER_COORDINATION`
//!
//! Commands (`pause_workers`, `resume_workers`) are acknowledged with
//! `command_ack` so the sender knows who applied them; `health_check` gets
//! exactly one `health_check_response` per live module instance. Services
//! that stay silent are reported as unknown, never as unhealthy.

use super::{Event, EventStream, WORKER_COORDINATION};
use crate::core::manager::QueueManager;
use crate::error::QueueResult;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const PAUSE_WORKERS: &str = "pause_workers";
pub const RESUME_WORKERS: &str = "resume_workers";
pub const HEALTH_CHECK: &str = "health_check";
pub const HEALTH_CHECK_RESPONSE: &str = "health_check_response";
pub const COMMAND_ACK: &str = "command_ack";

/// How often an unacknowledged command is sent in total
const MAX_COMMAND_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// `target` restricts the command to one service; `None` means everyone
    PauseWorkers { target: Option<String> },
    ResumeWorkers { target: Option<String> },
    HealthCheck,
    HealthCheckResponse {
        is_running: bool,
        status: String,
        instance_id: String,
    },
    CommandAck {
        command: String,
        instance_id: String,
        applied: bool,
    },
}

impl CoordinationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinationEvent::PauseWorkers { .. } => PAUSE_WORKERS,
            CoordinationEvent::ResumeWorkers { .. } => RESUME_WORKERS,
            CoordinationEvent::HealthCheck => HEALTH_CHECK,
            CoordinationEvent::HealthCheckResponse { .. } => HEALTH_CHECK_RESPONSE,
            CoordinationEvent::CommandAck { .. } => COMMAND_ACK,
        }
    }

    /// Whether a command addressed this way applies to `service`
    pub fn targets(&self, service: &str) -> bool {
        match self {
            CoordinationEvent::PauseWorkers { target }
            | CoordinationEvent::ResumeWorkers { target } => {
                target.as_deref().map_or(true, |t| t == service)
            }
            CoordinationEvent::HealthCheck => true,
            _ => false,
        }
    }

    fn data(&self) -> Value {
        match self {
            CoordinationEvent::PauseWorkers { target }
            | CoordinationEvent::ResumeWorkers { target } => match target {
                Some(target) => json!({ "target": target }),
                None => json!({}),
            },
            CoordinationEvent::HealthCheck => json!({}),
            CoordinationEvent::HealthCheckResponse {
                is_running,
                status,
                instance_id,
            } => json!({
                "isRunning": is_running,
                "status": status,
                "instanceId": instance_id,
            }),
            CoordinationEvent::CommandAck {
                command,
                instance_id,
                applied,
            } => json!({
                "command": command,
                "instanceId": instance_id,
                "applied": applied,
            }),
        }
    }

    pub fn into_event(self, service: &str, correlation_id: Option<String>) -> Event {
        let mut event = Event::new(service, self.name(), self.data());
        event.correlation_id = correlation_id;
        event
    }

    /// Decode a coordination message; `None` for unknown event names
    pub fn from_event(event: &Event) -> Option<Self> {
        let target = event.data_str("target").map(str::to_string);
        let instance_id = || event.data_str("instanceId").unwrap_or_default().to_string();
        match event.event.as_str() {
            PAUSE_WORKERS => Some(CoordinationEvent::PauseWorkers { target }),
            RESUME_WORKERS => Some(CoordinationEvent::ResumeWorkers { target }),
            HEALTH_CHECK => Some(CoordinationEvent::HealthCheck),
            HEALTH_CHECK_RESPONSE => Some(CoordinationEvent::HealthCheckResponse {
                is_running: event
                    .data
                    .get("isRunning")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                status: event.data_str("status").unwrap_or("unknown").to_string(),
                instance_id: instance_id(),
            }),
            COMMAND_ACK => Some(CoordinationEvent::CommandAck {
                command: event.data_str("command").unwrap_or_default().to_string(),
                instance_id: instance_id(),
                applied: event
                    .data
                    .get("applied")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthResponse {
    pub service: String,
    pub instance_id: String,
    pub is_running: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub correlation_id: String,
    pub responses: Vec<HealthResponse>,
    /// Expected services that did not answer in time
    pub unknown: Vec<String>,
}

impl HealthReport {
    pub fn responded(&self, service: &str) -> bool {
        self.responses.iter().any(|r| r.service == service)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub service: String,
    pub instance_id: String,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub command: String,
    pub correlation_id: String,
    /// Times the command was published
    pub attempts: u32,
    pub acknowledged: Vec<CommandAck>,
    /// Expected services that never acknowledged
    pub unacknowledged: Vec<String>,
}

/// Control-plane client for the coordination channel
pub struct Coordinator {
    manager: Arc<QueueManager>,
    service: String,
}

impl Coordinator {
    pub fn new(manager: Arc<QueueManager>, service: impl Into<String>) -> Self {
        Self {
            manager,
            service: service.into(),
        }
    }

    /// Broadcast a health check and gather responses until every expected
    /// service answered or `timeout` elapses.
    pub async fn health_check(
        &self,
        expected: &[String],
        timeout: Duration,
    ) -> QueueResult<HealthReport> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut stream = self.manager.subscribe_channel(WORKER_COORDINATION).await?;
        let request = CoordinationEvent::HealthCheck
            .into_event(&self.service, Some(correlation_id.clone()));
        self.manager
            .publish_event(WORKER_COORDINATION, &request)
            .await?;

        let mut responses: Vec<HealthResponse> = Vec::new();
        let deadline = Instant::now() + timeout;
        while let Some(event) = next_before(&mut stream, deadline).await {
            if event.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                continue;
            }
            if let Some(CoordinationEvent::HealthCheckResponse {
                is_running,
                status,
                instance_id,
            }) = CoordinationEvent::from_event(&event)
            {
                debug!(service = %event.service, instance_id = %instance_id, "Coordinator: health response");
                responses.push(HealthResponse {
                    service: event.service,
                    instance_id,
                    is_running,
                    status,
                });
                if !expected.is_empty() && missing(expected, &responses, |r| &r.service).is_empty() {
                    break;
                }
            }
        }

        let unknown = missing(expected, &responses, |r| &r.service);
        if !unknown.is_empty() {
            warn!(unknown = ?unknown, "Coordinator: no health response from {}", unknown.join(", "));
        }
        Ok(HealthReport {
            correlation_id,
            responses,
            unknown,
        })
    }

    pub async fn pause_workers(
        &self,
        target: Option<&str>,
        expected: &[String],
        timeout: Duration,
    ) -> QueueResult<CommandReport> {
        let command = CoordinationEvent::PauseWorkers {
            target: target.map(str::to_string),
        };
        self.send_command(command, expected, timeout).await
    }

    pub async fn resume_workers(
        &self,
        target: Option<&str>,
        expected: &[String],
        timeout: Duration,
    ) -> QueueResult<CommandReport> {
        let command = CoordinationEvent::ResumeWorkers {
            target: target.map(str::to_string),
        };
        self.send_command(command, expected, timeout).await
    }

    /// Publish `command` and collect acks. While expected services are
    /// missing the command is re-sent, up to a fixed number of attempts,
    /// each waiting `timeout`. Applying a command twice is harmless.
    async fn send_command(
        &self,
        command: CoordinationEvent,
        expected: &[String],
        timeout: Duration,
    ) -> QueueResult<CommandReport> {
        let name = command.name().to_string();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut stream = self.manager.subscribe_channel(WORKER_COORDINATION).await?;
        let mut acknowledged: Vec<CommandAck> = Vec::new();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let event = command
                .clone()
                .into_event(&self.service, Some(correlation_id.clone()));
            self.manager.publish_event(WORKER_COORDINATION, &event).await?;
            info!(command = %name, attempt = attempts, "Coordinator: sent {}", name);

            let deadline = Instant::now() + timeout;
            while let Some(event) = next_before(&mut stream, deadline).await {
                if event.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                    continue;
                }
                if let Some(CoordinationEvent::CommandAck {
                    instance_id,
                    applied,
                    ..
                }) = CoordinationEvent::from_event(&event)
                {
                    if acknowledged.iter().all(|a| a.instance_id != instance_id) {
                        acknowledged.push(CommandAck {
                            service: event.service,
                            instance_id,
                            applied,
                        });
                    }
                    if !expected.is_empty() && missing(expected, &acknowledged, |a| &a.service).is_empty() {
                        break;
                    }
                }
            }

            let unacknowledged = missing(expected, &acknowledged, |a| &a.service);
            if expected.is_empty() || unacknowledged.is_empty() || attempts >= MAX_COMMAND_ATTEMPTS {
                if !unacknowledged.is_empty() {
                    warn!(
                        command = %name,
                        unacknowledged = ?unacknowledged,
                        "Coordinator: {} not acknowledged by {}",
                        name,
                        unacknowledged.join(", ")
                    );
                }
                return Ok(CommandReport {
                    command: name,
                    correlation_id,
                    attempts,
                    acknowledged,
                    unacknowledged,
                });
            }
        }
    }
}

async fn next_before(stream: &mut EventStream, deadline: Instant) -> Option<Event> {
    tokio::time::timeout_at(deadline, stream.next())
        .await
        .ok()
        .flatten()
}

fn missing<T>(expected: &[String], seen: &[T], service: impl Fn(&T) -> &String) -> Vec<String> {
    let seen: BTreeSet<&String> = seen.iter().map(service).collect();
    expected
        .iter()
        .filter(|s| !seen.contains(s))
        .cloned()
        .collect()
}
