//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Receives orchestration events.
///
/// Sinks observe the run; they never influence scheduling. `try_emit` must
/// not block and must never fail.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without blocking.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::DEBUG }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level (`INFO` or `DEBUG`).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        let data = data.map(Value::to_string).unwrap_or_default();
        if self.level == Level::INFO {
            info!(event_type = %event_type, event_data = %data, "Event: {}", event_type);
        } else {
            debug!(event_type = %event_type, event_data = %data, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Records events in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Returns the index of the first event matching `event_type` whose data
    /// has every `(key, value)` pair given.
    #[must_use]
    pub fn position(&self, event_type: &str, fields: &[(&str, &str)]) -> Option<usize> {
        self.events.read().iter().position(|(t, data)| {
            t == event_type
                && fields.iter().all(|(key, expected)| {
                    data.as_ref()
                        .and_then(|d| d.get(*key))
                        .and_then(Value::as_str)
                        == Some(*expected)
                })
        })
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit("run.started", None).await;
        let sink = LoggingEventSink::info();
        sink.emit("stage.completed", Some(json!({"stage": "alignment"}))).await;
        sink.try_emit("run.completed", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("stage.started", Some(json!({"sample": "S1", "stage": "alignment"})))
            .await;
        sink.try_emit("stage.completed", Some(json!({"sample": "S1", "stage": "alignment"})));
        sink.try_emit("run.barrier", None);

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.events()[2].0, "run.barrier");
    }

    #[test]
    fn test_position_matches_fields() {
        let sink = CollectingEventSink::new();
        sink.try_emit("stage.completed", Some(json!({"sample": "S1", "stage": "coverage"})));
        sink.try_emit("stage.completed", Some(json!({"sample": "S2", "stage": "coverage"})));

        assert_eq!(
            sink.position("stage.completed", &[("sample", "S2"), ("stage", "coverage")]),
            Some(1)
        );
        assert_eq!(sink.position("stage.completed", &[("sample", "S3")]), None);
        assert_eq!(sink.position("run.barrier", &[]), None);
    }
}
