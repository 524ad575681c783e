//! Handler contract implemented by application code.
//!
//! A handler declares the payload schema it accepts and processes decoded
//! events. The dispatcher invokes it once per delivery; returning an error
//! requests redelivery (`Failed`) or dead-letters the message outright
//! (`Payload`).

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::codec::{EventSchema, TypeTag};
use crate::event::{EventId, IntegrationEvent};

/// Errors returned by integration event handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Business-logic failure; the message is redelivered up to the limit.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// Payload does not match the handler's shape; retrying cannot help.
    #[error("Payload mismatch: {0}")]
    Payload(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether redelivery could change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}

/// A delivered event with its payload decoded.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub id: EventId,
    pub name: String,
    pub type_tag: TypeTag,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub partition_key: Option<String>,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub payload: serde_json::Value,
}

impl ReceivedEvent {
    pub fn new(event: &IntegrationEvent, delivery_count: u32, payload: serde_json::Value) -> Self {
        Self {
            id: event.id,
            name: event.name.clone(),
            type_tag: event.type_tag.clone(),
            occurred_at: event.occurred_at,
            correlation_id: event.correlation_id.clone(),
            partition_key: event.partition_key.clone(),
            delivery_count,
            payload,
        }
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// Processes integration events for one event name.
pub trait IntegrationEventHandler: Send + Sync {
    /// Payload schema this handler is able to accept.
    fn schema(&self) -> EventSchema;

    /// Handle one delivery.
    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Typed payload bound to a logical event name.
pub trait IntegrationPayload: DeserializeOwned + Send + 'static {
    const EVENT_NAME: &'static str;
    const SCHEMA_VERSION: u32 = 1;

    fn schema() -> EventSchema {
        EventSchema::new(Self::EVENT_NAME).with_version(Self::SCHEMA_VERSION)
    }
}

/// Adapts an async function over a typed payload into a handler.
pub struct FnHandler<T, F> {
    func: Arc<F>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F, Fut> FnHandler<T, F>
where
    T: IntegrationPayload,
    F: Fn(T, Arc<ReceivedEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
            _payload: PhantomData,
        }
    }
}

impl<T, F, Fut> IntegrationEventHandler for FnHandler<T, F>
where
    T: IntegrationPayload,
    F: Fn(T, Arc<ReceivedEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn schema(&self) -> EventSchema {
        T::schema()
    }

    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let func = self.func.clone();
        Box::pin(async move {
            let payload = event.payload_as::<T>()?;
            func(payload, event).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct CategoryCreated {
        name: String,
    }

    impl IntegrationPayload for CategoryCreated {
        const EVENT_NAME: &'static str = "CategoryCreated";
    }

    fn received(payload: serde_json::Value) -> Arc<ReceivedEvent> {
        let event = IntegrationEvent::new(
            "CategoryCreated",
            TypeTag::new("CategoryCreated/v1"),
            serde_json::to_vec(&payload).unwrap(),
        );
        Arc::new(ReceivedEvent::new(&event, 1, payload))
    }

    #[test]
    fn test_payload_schema() {
        assert_eq!(
            CategoryCreated::schema().type_tag().as_str(),
            "CategoryCreated/v1"
        );
    }

    #[tokio::test]
    async fn test_fn_handler_decodes_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = FnHandler::new(move |payload: CategoryCreated, _event: Arc<ReceivedEvent>| {
            let counter = counter.clone();
            async move {
                assert_eq!(payload.name, "Podcasts");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(handler.schema().event_name, "CategoryCreated");
        handler
            .handle(received(serde_json::json!({ "name": "Podcasts" })))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fn_handler_payload_mismatch() {
        let handler = FnHandler::new(|_payload: CategoryCreated, _event: Arc<ReceivedEvent>| async { Ok(()) });

        let result = handler
            .handle(received(serde_json::json!({ "title": 42 })))
            .await;

        match result {
            Err(e) => assert!(!e.is_retryable()),
            Ok(()) => panic!("expected payload error"),
        }
    }
}
