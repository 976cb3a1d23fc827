//! Payload validation and enqueueing.

use crate::ProjectAuth;
use data_types::FieldError;
use event_bus::{queues, Message, MessageBus};
use observability_deps::tracing::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use snafu::Snafu;
use std::sync::Arc;

/// Largest accepted batch.
pub const MAX_BATCH_EVENTS: usize = 100;

/// Errors surfaced at the ingest boundary.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Request body must be a JSON object or array of events"))]
    InvalidBody,

    #[snafu(display("Event failed validation"))]
    Validation { errors: Vec<FieldError> },

    #[snafu(display("Batch of {} exceeds the maximum of {}", count, MAX_BATCH_EVENTS))]
    BatchTooLarge { count: usize },

    #[snafu(display("Batch contains no events"))]
    EmptyBatch,

    #[snafu(display("Failed to enqueue event: {}", source))]
    Enqueue { source: event_bus::Error },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Per-index validation failure inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemError {
    /// Index of the offending event in the submitted batch.
    pub index: usize,
    /// Its validation failures.
    pub errors: Vec<FieldError>,
}

/// Outcome of a batch submission: valid events were enqueued, invalid ones
/// are reported per index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// Events enqueued.
    pub accepted: usize,
    /// Events submitted.
    pub total: usize,
    /// Per-index failures; empty when everything was accepted.
    pub errors: Vec<BatchItemError>,
}

/// Validates ingest payloads and enqueues `ProcessEvent` messages.
#[derive(Debug)]
pub struct Intake {
    bus: Arc<dyn MessageBus>,
}

impl Intake {
    /// New intake over the given bus.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Accepts the single-event endpoint's body: one event object, or an
    /// `{"events": [...]}` wrapper. Every event must validate.
    pub async fn ingest(&self, auth: &ProjectAuth, body: Value) -> Result<usize> {
        let events = match body {
            Value::Object(map) if map.contains_key("events") => match map.get("events") {
                Some(Value::Array(events)) => events.clone(),
                _ => return Err(Error::InvalidBody),
            },
            Value::Object(map) => vec![Value::Object(map)],
            _ => return Err(Error::InvalidBody),
        };
        if events.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let mut payloads = Vec::with_capacity(events.len());
        for event in &events {
            let payload = as_event_object(event)?;
            let errors = event_schema::validate(&payload);
            if !errors.is_empty() {
                return Err(Error::Validation { errors });
            }
            payloads.push(payload);
        }

        let accepted = payloads.len();
        for payload in payloads {
            self.enqueue(auth, payload).await?;
        }
        debug!(accepted, project_id = %auth.project_id, "events accepted");
        Ok(accepted)
    }

    /// Accepts the batch endpoint's body: `{"events": [...]}` or a bare
    /// array of at most [`MAX_BATCH_EVENTS`]. Valid events are enqueued;
    /// invalid ones are reported per index.
    pub async fn ingest_batch(&self, auth: &ProjectAuth, body: Value) -> Result<BatchOutcome> {
        let events = match body {
            Value::Array(events) => events,
            Value::Object(mut map) => match map.remove("events") {
                Some(Value::Array(events)) => events,
                _ => return Err(Error::InvalidBody),
            },
            _ => return Err(Error::InvalidBody),
        };

        if events.is_empty() {
            return Err(Error::EmptyBatch);
        }
        if events.len() > MAX_BATCH_EVENTS {
            return Err(Error::BatchTooLarge {
                count: events.len(),
            });
        }

        let total = events.len();
        let mut accepted = 0;
        let mut item_errors = vec![];
        for (index, event) in events.into_iter().enumerate() {
            let payload = match as_event_object(&event) {
                Ok(payload) => payload,
                Err(_) => {
                    item_errors.push(BatchItemError {
                        index,
                        errors: vec![FieldError::invalid_type("$", "an object")],
                    });
                    continue;
                }
            };
            let errors = event_schema::validate(&payload);
            if !errors.is_empty() {
                item_errors.push(BatchItemError { index, errors });
                continue;
            }
            self.enqueue(auth, payload).await?;
            accepted += 1;
        }

        debug!(
            accepted,
            total,
            rejected = item_errors.len(),
            project_id = %auth.project_id,
            "batch processed",
        );
        Ok(BatchOutcome {
            accepted,
            total,
            errors: item_errors,
        })
    }

    async fn enqueue(&self, auth: &ProjectAuth, payload: Map<String, Value>) -> Result<()> {
        self.bus
            .publish(
                queues::PROCESS_EVENTS,
                Message::ProcessEvent {
                    event_data: payload,
                    project_id: auth.project_id.clone(),
                    organization_id: auth.organization_id.clone(),
                    environment: auth.environment.clone(),
                },
            )
            .await
            .map_err(|source| Error::Enqueue { source })
    }
}

fn as_event_object(value: &Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(Error::InvalidBody),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::MemoryBus;
    use serde_json::json;

    fn auth() -> ProjectAuth {
        ProjectAuth {
            organization_id: "org-a".into(),
            project_id: "proj-a".into(),
            environment: "production".into(),
        }
    }

    fn valid_event(id: &str) -> Value {
        json!({
            "event_id": id,
            "timestamp": 1_700_000_000_000i64,
            "project_id": "proj-a",
            "event_type": "error",
            "message": "boom",
        })
    }

    fn intake() -> (Arc<MemoryBus>, Intake) {
        let bus = Arc::new(MemoryBus::new());
        (Arc::clone(&bus), Intake::new(bus))
    }

    #[tokio::test]
    async fn accepts_a_single_event() {
        let (bus, intake) = intake();
        let accepted = intake.ingest(&auth(), valid_event("e1")).await.unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(bus.depth(queues::PROCESS_EVENTS), 1);

        let message = bus.consumer(queues::PROCESS_EVENTS).try_recv().unwrap();
        match message {
            Message::ProcessEvent {
                project_id,
                organization_id,
                environment,
                ..
            } => {
                assert_eq!(project_id, "proj-a");
                assert_eq!(organization_id, "org-a");
                assert_eq!(environment, "production");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepts_the_events_wrapper() {
        let (bus, intake) = intake();
        let body = json!({ "events": [valid_event("e1"), valid_event("e2")] });
        assert_eq!(intake.ingest(&auth(), body).await.unwrap(), 2);
        assert_eq!(bus.depth(queues::PROCESS_EVENTS), 2);
    }

    #[tokio::test]
    async fn rejects_invalid_single_event() {
        let (bus, intake) = intake();
        let result = intake
            .ingest(&auth(), json!({ "message": "no identity" }))
            .await;
        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(bus.depth(queues::PROCESS_EVENTS), 0);
    }

    #[tokio::test]
    async fn batch_reports_partial_failures_per_index() {
        let (bus, intake) = intake();
        let body = json!([
            valid_event("e1"),
            { "event_type": "gauge" },
            valid_event("e2"),
            "not an object",
        ]);
        let outcome = intake.ingest_batch(&auth(), body).await.unwrap();
        assert_eq!(outcome.total, 4);
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].index, 1);
        assert_eq!(outcome.errors[1].index, 3);
        assert_eq!(bus.depth(queues::PROCESS_EVENTS), 2);
    }

    #[tokio::test]
    async fn batch_boundaries() {
        let (_, intake) = intake();

        // exactly the cap passes
        let events: Vec<Value> = (0..MAX_BATCH_EVENTS)
            .map(|n| valid_event(&format!("e{n}")))
            .collect();
        let outcome = intake
            .ingest_batch(&auth(), Value::Array(events.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.accepted, MAX_BATCH_EVENTS);

        // one past the cap is rejected outright
        let mut over = events;
        over.push(valid_event("extra"));
        assert!(matches!(
            intake.ingest_batch(&auth(), Value::Array(over)).await,
            Err(Error::BatchTooLarge { count: 101 })
        ));

        // the empty batch is rejected
        assert!(matches!(
            intake.ingest_batch(&auth(), json!([])).await,
            Err(Error::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn wrapper_and_bare_array_are_equivalent() {
        let (bus, intake) = intake();
        let wrapped = json!({ "events": [valid_event("e1")] });
        let bare = json!([valid_event("e1")]);
        intake.ingest_batch(&auth(), wrapped).await.unwrap();
        intake.ingest_batch(&auth(), bare).await.unwrap();
        assert_eq!(bus.depth(queues::PROCESS_EVENTS), 2);
    }
}
