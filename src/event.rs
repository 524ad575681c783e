//! Integration event data model.
//!
//! `IntegrationEvent` is the immutable unit that crosses service boundaries.
//! `OutboxRecord` and `InboxRecord` are the durable bookkeeping on the
//! producing and consuming side respectively.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::TypeTag;

/// Globally unique event identifier, assigned once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A fact about a committed state change, broadcast to other services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationEvent {
    /// Unique id; the basis for consumer-side deduplication.
    pub id: EventId,
    /// Logical event type, stable across services.
    pub name: String,
    /// Serializer tag identifying the payload schema.
    pub type_tag: TypeTag,
    pub occurred_at: DateTime<Utc>,
    /// Opaque serialized body.
    pub payload: Vec<u8>,
    /// Optional causal tracing id.
    pub correlation_id: Option<String>,
    /// Aggregate/partition key scoping relative ordering.
    pub partition_key: Option<String>,
}

impl IntegrationEvent {
    /// Build a new event with a fresh id and the current timestamp.
    pub fn new(name: impl Into<String>, type_tag: TypeTag, payload: Vec<u8>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            type_tag,
            occurred_at: Utc::now(),
            payload,
            correlation_id: None,
            partition_key: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxState {
    /// Committed, not yet confirmed by the broker.
    Pending,
    /// Broker acknowledged the publish.
    Sent,
    /// Gave up after the configured number of attempts.
    Failed,
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxState::Pending => "pending",
            OutboxState::Sent => "sent",
            OutboxState::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxState::Pending),
            "sent" => Ok(OutboxState::Sent),
            "failed" => Ok(OutboxState::Failed),
            other => Err(format!("unknown outbox state '{}'", other)),
        }
    }
}

/// An event queued for publication, plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub event: IntegrationEvent,
    pub state: OutboxState,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the relay may try again.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Monotonic insertion order assigned by the store.
    pub sequence: i64,
}

impl OutboxRecord {
    /// Whether the relay may attempt this record at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == OutboxState::Pending && self.next_attempt_at <= now
    }
}

/// Progress of one event through a consumer's handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboxState {
    /// Claimed by a consumer; handlers are running.
    Processing,
    /// Every handler completed.
    Processed,
}

impl InboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxState::Processing => "processing",
            InboxState::Processed => "processed",
        }
    }
}

impl FromStr for InboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(InboxState::Processing),
            "processed" => Ok(InboxState::Processed),
            other => Err(format!("unknown inbox state '{}'", other)),
        }
    }
}

/// Consumer-side proof that an event's handlers all completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxRecord {
    pub event_id: EventId,
    pub event_name: String,
    pub processed_at: DateTime<Utc>,
}

impl InboxRecord {
    pub fn processed_now(event: &IntegrationEvent) -> Self {
        Self {
            event_id: event.id,
            event_name: event.name.clone(),
            processed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_unique() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_id_parse_display() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!("pending".parse::<OutboxState>(), Ok(OutboxState::Pending));
        assert_eq!("sent".parse::<OutboxState>(), Ok(OutboxState::Sent));
        assert_eq!("failed".parse::<OutboxState>(), Ok(OutboxState::Failed));
        assert!("bogus".parse::<OutboxState>().is_err());

        assert_eq!("processing".parse::<InboxState>(), Ok(InboxState::Processing));
        assert_eq!(InboxState::Processed.as_str().parse::<InboxState>(), Ok(InboxState::Processed));
        assert!("done".parse::<InboxState>().is_err());
    }

    #[test]
    fn test_record_due_only_when_pending() {
        let now = Utc::now();
        let mut record = OutboxRecord {
            event: IntegrationEvent::new("CategoryCreated", TypeTag::new("CategoryCreated/v1"), vec![]),
            state: OutboxState::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_attempt_at: now,
            last_error: None,
            sequence: 1,
        };
        assert!(record.is_due(now));

        record.next_attempt_at = now + chrono::Duration::seconds(5);
        assert!(!record.is_due(now));

        record.next_attempt_at = now;
        record.state = OutboxState::Sent;
        assert!(!record.is_due(now));
    }
}
