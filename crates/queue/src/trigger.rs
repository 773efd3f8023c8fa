//! Handler capability invoked when an event fires.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::event::{Event, EventStatus};

/// What a handler decided about an event.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerResult {
    pub status: EventStatus,
    /// Explicit time of the next attempt when `status` is `Retry`.
    pub trigger_time: Option<DateTime<Utc>>,
    /// Replacement payload persisted with a retry.
    pub data: Option<Value>,
}

impl TriggerResult {
    #[must_use]
    pub const fn new(status: EventStatus) -> Self {
        Self {
            status,
            trigger_time: None,
            data: None,
        }
    }

    #[must_use]
    pub const fn ok() -> Self {
        Self::new(EventStatus::Ok)
    }

    #[must_use]
    pub const fn error() -> Self {
        Self::new(EventStatus::Error)
    }

    #[must_use]
    pub const fn cancel() -> Self {
        Self::new(EventStatus::Cancel)
    }

    /// Retry after the backoff delay for the current attempt count.
    #[must_use]
    pub const fn retry() -> Self {
        Self::new(EventStatus::Retry)
    }

    /// Retry at an explicit time.
    #[must_use]
    pub const fn retry_at(trigger_time: DateTime<Utc>) -> Self {
        Self {
            status: EventStatus::Retry,
            trigger_time: Some(trigger_time),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// User code run when an event of a registered trigger type fires.
///
/// Handlers run outside every scheduler lock and may be slow. A panic is
/// caught by the scheduler and recorded as `ERROR`.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn trigger(&self, event: &Event) -> TriggerResult;
}

/// Fallback for trigger types with no registered handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrigger;

#[async_trait]
impl Trigger for NoTrigger {
    async fn trigger(&self, event: &Event) -> TriggerResult {
        warn!(
            event_id = %event.id,
            trigger_type = %event.trigger_type,
            "No handler registered for trigger type"
        );
        TriggerResult::error()
    }
}

/// Trigger-type to handler map.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    handlers: HashMap<String, Arc<dyn Trigger>>,
}

impl TriggerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `trigger_type`, replacing any previous one.
    pub fn register(&mut self, trigger_type: impl Into<String>, handler: Arc<dyn Trigger>) {
        self.handlers.insert(trigger_type.into(), handler);
    }

    /// Handler for `trigger_type`, or [`NoTrigger`] when none is registered.
    #[must_use]
    pub fn resolve(&self, trigger_type: &str) -> Arc<dyn Trigger> {
        self.handlers
            .get(trigger_type)
            .map_or_else(|| Arc::new(NoTrigger) as Arc<dyn Trigger>, Arc::clone)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("trigger_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Closures work as handlers.
#[async_trait]
impl<F> Trigger for F
where
    F: Fn(&Event) -> TriggerResult + Send + Sync,
{
    async fn trigger(&self, event: &Event) -> TriggerResult {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unregistered_type_resolves_to_error() {
        let registry = TriggerRegistry::new();
        let event = Event::new("unknown", Utc::now(), Value::Null);

        let result = registry.resolve("unknown").trigger(&event).await;
        assert_eq!(result.status, EventStatus::Error);
    }

    #[tokio::test]
    async fn test_registered_closure_is_resolved() {
        let mut registry = TriggerRegistry::new();
        registry.register("ping", Arc::new(|_: &Event| TriggerResult::ok()));
        assert_eq!(registry.len(), 1);

        let event = Event::new("ping", Utc::now(), Value::Null);
        let result = registry.resolve("ping").trigger(&event).await;
        assert_eq!(result, TriggerResult::ok());
    }

    #[test]
    fn test_result_builders() {
        let at = Utc::now();
        let retry = TriggerResult::retry_at(at).with_data(json!({ "step": 2 }));
        assert_eq!(retry.status, EventStatus::Retry);
        assert_eq!(retry.trigger_time, Some(at));
        assert_eq!(retry.data, Some(json!({ "step": 2 })));

        assert_eq!(TriggerResult::retry().trigger_time, None);
        assert_eq!(TriggerResult::cancel().status, EventStatus::Cancel);
    }
}
