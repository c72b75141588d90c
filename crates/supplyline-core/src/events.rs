//! Transfer notifications.
//!
//! Workflows publish a [`TransferEvent`] after their transaction commits.
//! Delivery is best-effort: a failing sink is logged by the caller and
//! never undoes the committed change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::transfer::TransferStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TransferEventKind {
    Created,
    Locked,
    Updated,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub request_id: String,
    pub status: TransferStatus,
    pub holder: Option<String>,
    #[ts(as = "String")]
    pub occurred_at: DateTime<Utc>,
}

impl TransferEvent {
    pub fn new(
        kind: TransferEventKind,
        request_id: impl Into<String>,
        status: TransferStatus,
        holder: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            request_id: request_id.into(),
            status,
            holder,
            occurred_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("No subscribers for transfer events")]
    NoSubscribers,

    #[error("Event delivery failed: {0}")]
    Delivery(String),
}

/// Where transfer events go. Must not block.
pub trait TransferEventSink: Send + Sync {
    fn publish(&self, event: &TransferEvent) -> Result<(), EventError>;
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl TransferEventSink for NoopEventSink {
    fn publish(&self, _event: &TransferEvent) -> Result<(), EventError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_shape() {
        let event = TransferEvent::new(
            TransferEventKind::Locked,
            "req-1",
            TransferStatus::Locked,
            Some("alice".to_string()),
            Utc::now(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "locked");
        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["status"], "locked");
        assert_eq!(json["holder"], "alice");
    }

    #[test]
    fn test_noop_sink_accepts_everything() {
        let event = TransferEvent::new(
            TransferEventKind::Created,
            "req-1",
            TransferStatus::Pending,
            None,
            Utc::now(),
        );
        assert!(NoopEventSink.publish(&event).is_ok());
    }
}
