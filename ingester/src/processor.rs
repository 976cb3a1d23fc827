//! The event processor: consumes `ProcessEvent` messages, maintains the
//! issue aggregate and hands events to the writer.

use crate::{IssueRepository, PartitionedWriter};
use event_bus::Message;
use observability_deps::tracing::{debug, warn};
use snafu::{ResultExt, Snafu};
use std::sync::Arc;

/// Errors surfaced while processing one message.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to update issue aggregate: {}", source))]
    Issue { source: crate::issues::Error },

    #[snafu(display("Failed to hand event to the writer: {}", source))]
    Write { source: crate::writer::Error },

    #[snafu(display("Unexpected message on the process-events queue"))]
    UnexpectedMessage,
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the queue should redeliver the message.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Write { source } if source.is_transient())
    }
}

/// Consumes validated ingest payloads and drives them into storage.
#[derive(Debug)]
pub struct EventProcessor {
    issues: Arc<dyn IssueRepository>,
    writer: Arc<PartitionedWriter>,
}

impl EventProcessor {
    /// New processor over the given collaborators.
    pub fn new(issues: Arc<dyn IssueRepository>, writer: Arc<PartitionedWriter>) -> Self {
        Self { issues, writer }
    }

    /// Handles one message from the process-events queue.
    pub async fn handle(&self, message: Message) -> Result<()> {
        let Message::ProcessEvent {
            event_data,
            project_id,
            organization_id,
            environment,
        } = message
        else {
            return Err(Error::UnexpectedMessage);
        };

        let mut event = event_schema::normalize(&event_data);
        // the authenticated tuple wins over anything in the payload
        event.project_id = project_id;
        event.organization_id = Some(organization_id);
        if event.environment.is_none() {
            event.environment = Some(environment);
        }
        if event.fingerprint.is_none() {
            event.fingerprint = Some(event_schema::fingerprint(&event));
        }

        let issue = self
            .issues
            .upsert_from_event(&event)
            .await
            .context(IssueSnafu)?;
        debug!(
            project_id = %event.project_id,
            fingerprint = %issue.fingerprint,
            event_count = issue.event_count,
            "issue upserted",
        );

        self.writer
            .add_event(event)
            .await
            .context(WriteSnafu)
    }

    /// Runs the consume loop until the queue closes or `shutdown` fires.
    ///
    /// Transient failures are left to the queue's redelivery; fatal ones are
    /// logged and dropped so one poisoned payload cannot wedge the queue.
    pub async fn run(
        &self,
        consumer: event_bus::QueueConsumer,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                message = consumer.recv() => message,
                _ = shutdown.cancelled() => None,
            };
            let Some(message) = message else {
                break;
            };
            if let Err(error) = self.handle(message).await {
                warn!(%error, transient = error.is_transient(), "event processing failed");
            }
        }

        // drain buffers so no accepted event is lost on shutdown
        if let Err(error) = self.writer.flush().await {
            warn!(%error, "final flush failed; buffered events dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemIssueRepository;
    use data_types::EventType;
    use serde_json::json;
    use storage::ObjectBackend;

    fn payload(event_id: &str) -> serde_json::Map<String, serde_json::Value> {
        json!({
            "event_id": event_id,
            "timestamp": 1_700_000_000_000i64,
            "project_id": "ignored-by-auth",
            "event_type": "error",
            "exception_type": "Boom",
            "message": "it broke",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn process(event_id: &str) -> Message {
        Message::ProcessEvent {
            event_data: payload(event_id),
            project_id: "proj-1".into(),
            organization_id: "org-1".into(),
            environment: "production".into(),
        }
    }

    fn processor() -> (Arc<MemIssueRepository>, Arc<PartitionedWriter>, EventProcessor) {
        let issues = Arc::new(MemIssueRepository::new());
        let writer = Arc::new(PartitionedWriter::new(ObjectBackend::new_in_memory(), 1000));
        let processor = EventProcessor::new(
            Arc::clone(&issues) as _,
            Arc::clone(&writer),
        );
        (issues, writer, processor)
    }

    #[tokio::test]
    async fn processes_an_event_end_to_end() {
        let (issues, writer, processor) = processor();
        processor.handle(process("e1")).await.unwrap();

        // the authenticated tuple overrode the payload's project
        assert_eq!(writer.buffered_events(), 1);
        let listed = issues.list_for_project("proj-1", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event_type, EventType::Error);
        assert_eq!(listed[0].title, "Boom");
    }

    #[tokio::test]
    async fn same_fingerprint_folds_into_one_issue() {
        let (issues, writer, processor) = processor();
        processor.handle(process("e1")).await.unwrap();
        processor.handle(process("e2")).await.unwrap();

        // two rows, one issue
        assert_eq!(writer.buffered_events(), 2);
        let listed = issues.list_for_project("proj-1", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event_count, 2);
    }

    #[tokio::test]
    async fn rejects_foreign_messages() {
        let (_, _, processor) = processor();
        let message = Message::ExecuteQuery {
            query_id: "q1".into(),
            request: Default::default(),
            context: data_types::RequestContext {
                user_id: "u".into(),
                organization_id: "o".into(),
            },
        };
        assert!(matches!(
            processor.handle(message).await,
            Err(Error::UnexpectedMessage)
        ));
    }
}
