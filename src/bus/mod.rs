//! Broker client abstraction and inbound dispatch.
//!
//! This module contains:
//! - `BrokerTransport` trait: publish with broker acknowledgement, topology
//!   bindings, consumption channels
//! - `InboundDelivery` / `Acknowledger`: one consumed message and its
//!   ack / requeue / dead-letter decision
//! - `DeliverySink`: where consumption channels hand messages (the dispatcher)
//! - Implementations: in-process channel broker, AMQP (RabbitMQ)

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::codec::{CodecError, TypeTag};
use crate::config::{ConfigError, MessagingConfig, MessagingType};
use crate::event::IntegrationEvent;
use crate::handler::HandlerError;
use crate::storage::StoreError;
use crate::subscription::RegistrationError;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
pub mod dispatch;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
#[cfg(feature = "channel")]
pub use channel::{ChannelTransport, DeadLetteredMessage, InMemoryBroker};
pub use dispatch::{DispatchOutcome, Dispatcher};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Connection lost, timeout, nack. Retried with backoff.
    #[error("Transient broker failure: {0}")]
    TransientBroker(String),

    /// Payload could not be encoded or decoded. Never retried.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Unknown event type: {0}")]
    UnknownEventType(TypeTag),

    /// The local transactional write failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BusError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::TransientBroker(_) | BusError::Store(_) => true,
            BusError::Handler(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<CodecError> for BusError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::UnknownEventType(tag) => BusError::UnknownEventType(tag),
            CodecError::Serialization(e) => BusError::Serialization(e.to_string()),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Shutdown notification shared by background tasks. `true` means stop.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Whether `signal` has been raised or its sender dropped.
pub fn is_shutdown(signal: &ShutdownSignal) -> bool {
    *signal.borrow() || signal.has_changed().is_err()
}

/// Settles one consumed message with the broker.
#[async_trait]
pub trait Acknowledger: Send {
    /// Processing finished; remove the message.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Return the message for redelivery.
    async fn requeue(self: Box<Self>) -> Result<()>;

    /// Route the message to the dead-letter destination.
    async fn dead_letter(self: Box<Self>, reason: &str) -> Result<()>;
}

/// A message consumed from the broker, not yet settled.
///
/// Dropping it unsettled leaves the message with the broker for redelivery.
pub struct InboundDelivery {
    pub event: IntegrationEvent,
    /// 1 on first delivery.
    pub delivery_count: u32,
    acker: Box<dyn Acknowledger>,
}

impl InboundDelivery {
    pub fn new(event: IntegrationEvent, delivery_count: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            event,
            delivery_count,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn requeue(self) -> Result<()> {
        self.acker.requeue().await
    }

    pub async fn dead_letter(self, reason: &str) -> Result<()> {
        self.acker.dead_letter(reason).await
    }
}

/// Receives deliveries from consumption channels, one at a time per channel.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, delivery: InboundDelivery) -> DispatchOutcome;
}

/// Connection to the message broker.
///
/// Implementations:
/// - `ChannelTransport`: in-process broker for standalone mode and tests
/// - `AmqpTransport`: RabbitMQ via AMQP
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Publish an event, routed by its name.
    ///
    /// Returns only once the broker has acknowledged the message.
    async fn publish(&self, event: &IntegrationEvent) -> Result<()>;

    /// Route messages for `event_name` to this service's queue.
    ///
    /// Bindings are remembered and re-declared after reconnects.
    async fn bind(&self, event_name: &str) -> Result<()>;

    /// Stop routing `event_name` to this service's queue. Messages already
    /// queued are unaffected.
    async fn unbind(&self, event_name: &str) -> Result<()>;

    /// Spawn consumption channels feeding `sink` until `shutdown` is raised.
    async fn start_consuming(
        &self,
        sink: Arc<dyn DeliverySink>,
        shutdown: ShutdownSignal,
    ) -> Result<Vec<JoinHandle<()>>>;
}

// ============================================================================
// Factory
// ============================================================================

/// Create the transport selected by configuration.
///
/// `queue_name` is the service-level queue all bindings route to.
pub async fn init_transport(
    config: &MessagingConfig,
    queue_name: &str,
) -> Result<Arc<dyn BrokerTransport>> {
    match config.messaging_type {
        #[cfg(feature = "channel")]
        MessagingType::Channel => {
            info!(queue = %queue_name, "Messaging: in-process channel broker");
            Ok(Arc::new(ChannelTransport::new(
                InMemoryBroker::new(),
                queue_name,
            )))
        }
        #[cfg(feature = "amqp")]
        MessagingType::Amqp => {
            info!(url = %config.amqp.url, queue = %queue_name, "Messaging: AMQP");
            let transport = AmqpTransport::new(config.amqp.clone(), queue_name);
            if let Err(e) = transport.connect().await {
                warn!(error = %e, "Broker unavailable at startup, will keep retrying");
            }
            Ok(Arc::new(transport))
        }
        #[allow(unreachable_patterns)]
        ref other => Err(BusError::Config(ConfigError::Invalid(format!(
            "messaging type {:?} is not enabled in this build",
            other
        )))),
    }
}
