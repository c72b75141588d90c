//! # Event Sinks
//!
//! Concrete [`TransferEventSink`]s. Workflows call them only after commit.
//!
//! ```text
//!   TransferWorkflow ──commit──► publish_after_commit ──► sink.publish
//!                                        │                    │
//!                                        │              Err(EventError)
//!                                        ▼                    │
//!                                  warn!, carry on ◄──────────┘
//! ```

use tokio::sync::broadcast;
use tracing::{info, warn};

use supplyline_core::{EventError, TransferEvent, TransferEventSink};

/// Fans events out to in-process subscribers.
///
/// Subscribers that fall more than `capacity` events behind lose the
/// oldest ones.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<TransferEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastEventSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TransferEventSink for BroadcastEventSink {
    fn publish(&self, event: &TransferEvent) -> Result<(), EventError> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| EventError::NoSubscribers)
    }
}

/// Writes each event as a structured log line carrying its JSON payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl TransferEventSink for TracingEventSink {
    fn publish(&self, event: &TransferEvent) -> Result<(), EventError> {
        let payload =
            serde_json::to_string(event).map_err(|e| EventError::Delivery(e.to_string()))?;
        info!(
            kind = ?event.kind,
            request_id = %event.request_id,
            status = %event.status,
            payload = %payload,
            "Transfer event"
        );
        Ok(())
    }
}

/// Delivers `event`, logging instead of failing.
pub(crate) fn publish_after_commit(sink: &dyn TransferEventSink, event: TransferEvent) {
    if let Err(e) = sink.publish(&event) {
        warn!(
            request_id = %event.request_id,
            kind = ?event.kind,
            error = %e,
            "Transfer event not delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use supplyline_core::{TransferEventKind, TransferStatus};

    fn event(kind: TransferEventKind) -> TransferEvent {
        TransferEvent::new(kind, "req-1", TransferStatus::Pending, None, Utc::now())
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);

        sink.publish(&event(TransferEventKind::Created)).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, TransferEventKind::Created);
        assert_eq!(received.request_id, "req-1");
    }

    #[test]
    fn test_broadcast_without_subscribers_errors() {
        let sink = BroadcastEventSink::default();
        assert!(matches!(
            sink.publish(&event(TransferEventKind::Released)),
            Err(EventError::NoSubscribers)
        ));
        // Best-effort delivery swallows it
        publish_after_commit(&sink, event(TransferEventKind::Released));
    }

    #[test]
    fn test_tracing_sink_never_fails() {
        assert!(TracingEventSink.publish(&event(TransferEventKind::Locked)).is_ok());
    }
}
