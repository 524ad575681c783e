//! Dead letter records.
//!
//! A dead letter is the operator-visible record of an event the bus gave up
//! on: a consumed message that exhausted its deliveries or can never be
//! decoded, or an outbox record that exhausted its publish attempts. The
//! broker moves the message itself to its dead-letter destination; the
//! `DeadLetterPublisher` surfaces the record to monitoring.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::event::IntegrationEvent;

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to publish dead letter: {0}")]
    PublishFailed(String),
}

/// Handler failure details for DLQ entries.
#[derive(Debug, Clone)]
pub struct HandlerFailedDetails {
    /// `handler: error` for every handler that failed on the last delivery.
    pub errors: Vec<String>,
    /// Deliveries made before giving up.
    pub delivery_count: u32,
    /// Whether the failure could have succeeded on retry.
    pub is_retryable: bool,
}

/// Rejection details for dead letter entries.
#[derive(Debug, Clone)]
pub enum RejectionDetails {
    /// Handlers kept failing until the delivery limit.
    HandlerFailed(HandlerFailedDetails),
    /// No schema registered for the message's type tag.
    UnknownEventType { type_tag: String },
    /// Body could not be decoded.
    Serialization { error: String },
    /// The relay could not get the broker to accept the event.
    PublishExhausted { attempts: u32, last_error: String },
}

/// Dead letter queue entry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The event that could not be processed.
    pub event: IntegrationEvent,
    /// Human-readable reason for rejection.
    pub reason: String,
    /// Structured rejection details.
    pub details: RejectionDetails,
    /// Which component gave up ("dispatcher" or "relay").
    pub source_component: String,
    /// When the rejection occurred.
    pub occurred_at: DateTime<Utc>,
    /// Additional context.
    pub metadata: HashMap<String, String>,
}

impl DeadLetter {
    fn new(
        event: &IntegrationEvent,
        reason: String,
        details: RejectionDetails,
        source_component: &str,
    ) -> Self {
        Self {
            event: event.clone(),
            reason,
            details,
            source_component: source_component.to_string(),
            occurred_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Create a dead letter from handlers that failed on the final delivery.
    pub fn from_handler_failure(
        event: &IntegrationEvent,
        errors: Vec<String>,
        delivery_count: u32,
        is_retryable: bool,
    ) -> Self {
        let reason = format!(
            "Handlers failed after {} deliveries: {}",
            delivery_count,
            errors.join("; ")
        );

        Self::new(
            event,
            reason,
            RejectionDetails::HandlerFailed(HandlerFailedDetails {
                errors,
                delivery_count,
                is_retryable,
            }),
            "dispatcher",
        )
    }

    /// Create a dead letter for a message whose type tag is not registered.
    pub fn from_unknown_type(event: &IntegrationEvent) -> Self {
        Self::new(
            event,
            format!("Unknown event type: {}", event.type_tag),
            RejectionDetails::UnknownEventType {
                type_tag: event.type_tag.to_string(),
            },
            "dispatcher",
        )
    }

    /// Create a dead letter for a body that failed to decode.
    pub fn from_serialization(event: &IntegrationEvent, error: &str) -> Self {
        Self::new(
            event,
            format!("Payload could not be decoded: {}", error),
            RejectionDetails::Serialization {
                error: error.to_string(),
            },
            "dispatcher",
        )
    }

    /// Create a dead letter for an outbox record that ran out of attempts.
    pub fn from_publish_exhausted(event: &IntegrationEvent, attempts: u32, last_error: &str) -> Self {
        Self::new(
            event,
            format!(
                "Publish failed after {} attempts: {}",
                attempts, last_error
            ),
            RejectionDetails::PublishExhausted {
                attempts,
                last_error: last_error.to_string(),
            },
            "relay",
        )
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Trait for surfacing dead letters to operators.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;
}

/// Logs dead letters at error level.
///
/// The default operator-visible record when no monitoring sink is wired.
pub struct TracingDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for TracingDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        error!(
            event_id = %dead_letter.event.id,
            event_name = %dead_letter.event.name,
            reason = %dead_letter.reason,
            source = %dead_letter.source_component,
            "Dead letter"
        );
        Ok(())
    }
}

/// In-memory DLQ publisher using a channel.
///
/// Used for standalone mode and testing.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Create a new channel-based DLQ publisher.
    ///
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            event_id = %dead_letter.event.id,
            reason = %dead_letter.reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}
