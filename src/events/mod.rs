//! Pub/sub events shared across services
//!
//! The channel names and the [`Event`] wire shape are the interoperability
//! contract: any service that agrees on them can take part, whatever it is
//! written in. Delivery is best-effort; the job queue stays the source of
//! truth for job state.

pub mod coordination;

pub use coordination::{
    CommandAck, CommandReport, CoordinationEvent, Coordinator, HealthReport, HealthResponse,
};

use crate::broker::Subscription;
use crate::core::manager::QueueManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Control messages: pause, resume, health checks
pub const WORKER_COORDINATION: &str = "WORKER_COORDINATION";
pub const FINANCIAL_EVENTS: &str = "FINANCIAL_EVENTS";
pub const TRADING_EVENTS: &str = "TRADING_EVENTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub service: String,
    pub event: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Event {
    pub fn new(service: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            service: service.into(),
            event: event.into(),
            data,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// String field of `data`, if present
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Decoded events from one channel. Messages that are not valid events are
/// logged and skipped.
pub struct EventStream {
    channel: String,
    subscription: Subscription,
}

impl EventStream {
    pub(crate) fn new(channel: impl Into<String>, subscription: Subscription) -> Self {
        Self {
            channel: channel.into(),
            subscription,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn next(&mut self) -> Option<Event> {
        loop {
            let raw = self.subscription.recv().await?;
            match serde_json::from_str::<Event>(&raw) {
                Ok(event) => return Some(event),
                Err(e) => warn!(
                    channel = %self.channel,
                    error = %e,
                    "EventStream: dropping malformed message"
                ),
            }
        }
    }
}

/// Callback subscription; the listener stops when this is dropped or
/// [`EventSubscription::unsubscribe`] is called.
pub struct EventSubscription {
    channel: String,
    task: JoinHandle<()>,
}

impl EventSubscription {
    pub(crate) fn new(channel: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            channel: channel.into(),
            task,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Fire-and-forget publisher bound to one service and one domain channel
#[derive(Clone)]
pub struct EventPublisher {
    manager: Arc<QueueManager>,
    service: String,
    channel: String,
}

impl EventPublisher {
    pub fn new(
        manager: Arc<QueueManager>,
        service: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            service: service.into(),
            channel: channel.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish `event` with `data`. Failures are logged, never returned:
    /// losing a notification must not fail the job that produced it.
    pub async fn publish(&self, event: &str, data: Value) {
        let event = Event::new(&self.service, event, data);
        match self.manager.publish_event(&self.channel, &event).await {
            Ok(()) => debug!(channel = %self.channel, event = %event.event, "EventPublisher: published"),
            Err(e) => warn!(
                channel = %self.channel,
                event = %event.event,
                error = %e,
                "EventPublisher: failed to publish {}",
                event.event
            ),
        }
    }
}
