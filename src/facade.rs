//! Event bus facade.
//!
//! The application-facing API: publish integration events inside a unit of
//! work, and subscribe handlers to event names.
//!
//! # Example
//!
//! ```ignore
//! use relaybus::facade::EventBus;
//! use relaybus::storage::sql::sqlite::Sqlite;
//!
//! let bus = EventBus::new(transport, config.dispatch.clone());
//! bus.register_handler("catalog-projection".into(), Arc::new(handler))?;
//! bus.subscribe("CategoryCreated", &"catalog-projection".into()).await?;
//!
//! let mut uow = bus.begin::<Sqlite>(&pool).await?;
//! // ... domain writes through uow.transaction() ...
//! bus.publish(&mut uow, "CategoryCreated", &category)?;
//! uow.commit().await?;
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bus::{BrokerTransport, Dispatcher, Result};
use crate::codec::{EventCodec, EventSchema};
use crate::config::{DispatchConfig, OutboxConfig};
use crate::dlq::DeadLetterPublisher;
use crate::event::{EventId, IntegrationEvent};
use crate::handler::IntegrationEventHandler;
use crate::outbox::{OutboxRelay, RelayWaker};
use crate::storage::sql::{OutboxWriter, PoolOf};
use crate::storage::{InboxStore, OutboxStore, UnitOfWork};
use crate::subscription::{
    AddOutcome, HandlerCatalog, HandlerId, RegistrationError, RemoveOutcome, SubscriptionRegistry,
};

/// Publish / Subscribe / Unsubscribe over a broker transport.
pub struct EventBus {
    codec: Arc<EventCodec>,
    catalog: Arc<HandlerCatalog>,
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn BrokerTransport>,
    /// Held across each registry change and the bind or unbind it implies,
    /// so the broker binding always matches the registry.
    subscription_lock: Mutex<()>,
    waker: RelayWaker,
    dispatch_config: DispatchConfig,
}

impl EventBus {
    pub fn new(transport: Arc<dyn BrokerTransport>, dispatch_config: DispatchConfig) -> Self {
        Self {
            codec: Arc::new(EventCodec::new()),
            catalog: Arc::new(HandlerCatalog::new()),
            registry: Arc::new(SubscriptionRegistry::new()),
            transport,
            subscription_lock: Mutex::new(()),
            waker: RelayWaker::new(),
            dispatch_config,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Make a handler resolvable by `id`. Subscriptions refer to it by id.
    pub fn register_handler(
        &self,
        id: HandlerId,
        handler: Arc<dyn IntegrationEventHandler>,
    ) -> std::result::Result<(), RegistrationError> {
        self.catalog.register(id, handler)
    }

    /// Declare the payload schema for an event name, for publishers that do
    /// not subscribe to it themselves.
    pub fn register_schema(&self, schema: EventSchema) -> std::result::Result<(), RegistrationError> {
        self.codec.register(schema)
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Serialize `data` into a new event. No I/O.
    pub fn prepare<T: Serialize + ?Sized>(&self, event_name: &str, data: &T) -> Result<IntegrationEvent> {
        let (payload, type_tag) = self.codec.encode(event_name, data)?;
        Ok(IntegrationEvent::new(event_name, type_tag, payload))
    }

    /// Queue an event in the caller's unit of work.
    ///
    /// Nothing reaches the broker here: the outbox record is written when
    /// the unit of work commits and the relay publishes it afterwards. A
    /// rollback discards it.
    pub fn publish<DB: OutboxWriter, T: Serialize + ?Sized>(
        &self,
        uow: &mut UnitOfWork<DB>,
        event_name: &str,
        data: &T,
    ) -> Result<EventId> {
        let event = self.prepare(event_name, data)?;
        Ok(self.publish_event(uow, event))
    }

    /// `publish` with a partition key; events sharing a key are relayed in
    /// commit order.
    pub fn publish_keyed<DB: OutboxWriter, T: Serialize + ?Sized>(
        &self,
        uow: &mut UnitOfWork<DB>,
        event_name: &str,
        partition_key: &str,
        data: &T,
    ) -> Result<EventId> {
        let event = self
            .prepare(event_name, data)?
            .with_partition_key(partition_key);
        Ok(self.publish_event(uow, event))
    }

    /// Queue an already-built event.
    pub fn publish_event<DB: OutboxWriter>(&self, uow: &mut UnitOfWork<DB>, event: IntegrationEvent) -> EventId {
        let id = event.id;
        debug!(event_id = %id, event_name = %event.name, "Staged integration event");
        uow.stage(event);
        id
    }

    /// Begin a unit of work that wakes this bus's relay on commit.
    pub async fn begin<DB: OutboxWriter>(&self, pool: &PoolOf<DB>) -> Result<UnitOfWork<DB>> {
        Ok(UnitOfWork::begin(pool).await?.with_waker(self.waker.clone()))
    }

    // ========================================================================
    // Subscribe / Unsubscribe
    // ========================================================================

    /// Route `event_name` to the handler registered as `handler`.
    ///
    /// Idempotent. The first subscription for an event name binds it at the
    /// broker; if that fails the subscription is rolled back. Concurrent
    /// subscribes and unsubscribes are applied one at a time.
    pub async fn subscribe(&self, event_name: &str, handler: &HandlerId) -> Result<()> {
        let implementation = self
            .catalog
            .resolve(handler)
            .ok_or_else(|| RegistrationError::UnknownHandler(handler.clone()))?;

        let schema = implementation.schema();
        if schema.event_name != event_name {
            return Err(RegistrationError::CapabilityMismatch {
                handler: handler.clone(),
                event_name: event_name.to_string(),
                accepts: schema.type_tag().to_string(),
            }
            .into());
        }
        self.codec.register(schema)?;

        let _guard = self.subscription_lock.lock().await;
        match self.registry.add(event_name, handler) {
            AddOutcome::AlreadyPresent => {
                debug!(event_name = %event_name, handler = %handler, "Already subscribed");
                Ok(())
            }
            AddOutcome::Added { first } => {
                if first {
                    if let Err(e) = self.transport.bind(event_name).await {
                        self.registry.remove(event_name, handler);
                        return Err(e);
                    }
                }
                info!(event_name = %event_name, handler = %handler, "Subscribed");
                Ok(())
            }
        }
    }

    /// Remove exactly the (`event_name`, `handler`) subscription.
    ///
    /// Messages already delivered to this process still complete. The broker
    /// binding is removed with the last subscription only when
    /// `teardown_unused_bindings` is set.
    pub async fn unsubscribe(&self, event_name: &str, handler: &HandlerId) -> Result<()> {
        if self.catalog.resolve(handler).is_none() {
            return Err(RegistrationError::UnknownHandler(handler.clone()).into());
        }

        let _guard = self.subscription_lock.lock().await;
        match self.registry.remove(event_name, handler) {
            RemoveOutcome::NotFound => Ok(()),
            RemoveOutcome::Removed { last } => {
                info!(event_name = %event_name, handler = %handler, "Unsubscribed");
                if last && self.dispatch_config.teardown_unused_bindings {
                    self.transport.unbind(event_name).await?;
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    /// Dispatcher routing consumed messages through this bus's subscriptions.
    pub fn dispatcher(
        &self,
        inbox: Arc<dyn InboxStore>,
        dead_letters: Arc<dyn DeadLetterPublisher>,
    ) -> Dispatcher {
        Dispatcher::new(
            self.registry.clone(),
            self.catalog.clone(),
            self.codec.clone(),
            inbox,
            dead_letters,
            self.dispatch_config.clone(),
        )
    }

    /// Relay draining `store` into this bus's transport, woken by units of
    /// work from `begin`.
    pub fn relay(
        &self,
        store: Arc<dyn OutboxStore>,
        dead_letters: Arc<dyn DeadLetterPublisher>,
        config: OutboxConfig,
    ) -> OutboxRelay {
        OutboxRelay::new(
            store,
            self.transport.clone(),
            dead_letters,
            config,
            self.waker.clone(),
        )
    }

    pub fn waker(&self) -> &RelayWaker {
        &self.waker
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> &Arc<EventCodec> {
        &self.codec
    }

    pub fn transport(&self) -> &Arc<dyn BrokerTransport> {
        &self.transport
    }
}

#[cfg(all(test, feature = "channel"))]
mod tests {
    use super::*;
    use crate::bus::{BusError, ChannelTransport, InMemoryBroker};
    use crate::test_utils::{CategoryCreated, RecordingHandler};

    fn bus_with(config: DispatchConfig) -> (EventBus, Arc<InMemoryBroker>) {
        let broker = InMemoryBroker::new();
        let transport = Arc::new(ChannelTransport::new(broker.clone(), "catalog"));
        (EventBus::new(transport, config), broker)
    }

    fn bus() -> (EventBus, Arc<InMemoryBroker>) {
        bus_with(DispatchConfig::default())
    }

    #[test]
    fn test_prepare_encodes_payload() {
        let (bus, _) = bus();
        let event = bus
            .prepare("CategoryCreated", &CategoryCreated::new("c-1", "Podcasts"))
            .unwrap();

        assert_eq!(event.name, "CategoryCreated");
        assert_eq!(event.type_tag.as_str(), "CategoryCreated/v1");
        let decoded: CategoryCreated = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(decoded.name, "Podcasts");
    }

    #[tokio::test]
    async fn test_subscribe_binds_once() {
        let (bus, broker) = bus();
        let id = HandlerId::new("projection");
        bus.register_handler(id.clone(), Arc::new(RecordingHandler::new("CategoryCreated")))
            .unwrap();

        bus.subscribe("CategoryCreated", &id).await.unwrap();
        bus.subscribe("CategoryCreated", &id).await.unwrap();

        assert_eq!(bus.registry().snapshot().handlers_for("CategoryCreated").len(), 1);

        let event = bus.prepare("CategoryCreated", &serde_json::json!({})).unwrap();
        bus.transport().publish(&event).await.unwrap();
        assert_eq!(broker.queue_depth("catalog"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_handler() {
        let (bus, _) = bus();
        let result = bus.subscribe("CategoryCreated", &HandlerId::new("missing")).await;
        assert!(matches!(
            result,
            Err(BusError::Registration(RegistrationError::UnknownHandler(_)))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_capability_mismatch() {
        let (bus, _) = bus();
        let id = HandlerId::new("episodes");
        bus.register_handler(id.clone(), Arc::new(RecordingHandler::new("EpisodeAdded")))
            .unwrap();

        let result = bus.subscribe("CategoryCreated", &id).await;
        assert!(matches!(
            result,
            Err(BusError::Registration(RegistrationError::CapabilityMismatch { .. }))
        ));
        assert!(bus.registry().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_schema_conflict() {
        let (bus, _) = bus();
        bus.register_schema(EventSchema::new("CategoryCreated").with_version(2))
            .unwrap();
        let id = HandlerId::new("projection");
        bus.register_handler(id.clone(), Arc::new(RecordingHandler::new("CategoryCreated")))
            .unwrap();

        let result = bus.subscribe("CategoryCreated", &id).await;
        assert!(matches!(
            result,
            Err(BusError::Registration(RegistrationError::SchemaConflict { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_binding_by_default() {
        let (bus, broker) = bus();
        let id = HandlerId::new("projection");
        bus.register_handler(id.clone(), Arc::new(RecordingHandler::new("CategoryCreated")))
            .unwrap();
        bus.subscribe("CategoryCreated", &id).await.unwrap();

        bus.unsubscribe("CategoryCreated", &id).await.unwrap();
        bus.unsubscribe("CategoryCreated", &id).await.unwrap();
        assert!(bus.registry().snapshot().is_empty());

        let event = bus.prepare("CategoryCreated", &serde_json::json!({})).unwrap();
        bus.transport().publish(&event).await.unwrap();
        assert_eq!(broker.queue_depth("catalog"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_tears_down_when_configured() {
        let (bus, broker) = bus_with(DispatchConfig {
            teardown_unused_bindings: true,
            ..DispatchConfig::default()
        });
        let id = HandlerId::new("projection");
        bus.register_handler(id.clone(), Arc::new(RecordingHandler::new("CategoryCreated")))
            .unwrap();
        bus.subscribe("CategoryCreated", &id).await.unwrap();
        bus.unsubscribe("CategoryCreated", &id).await.unwrap();

        let event = bus.prepare("CategoryCreated", &serde_json::json!({})).unwrap();
        bus.transport().publish(&event).await.unwrap();
        assert_eq!(broker.queue_depth("catalog"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_handler() {
        let (bus, _) = bus();
        let result = bus.unsubscribe("CategoryCreated", &HandlerId::new("missing")).await;
        assert!(result.is_err());
    }

    /// Channel transport whose bind and unbind can be held at a gate, and
    /// whose next bind can be made to fail.
    struct GatedTransport {
        inner: ChannelTransport,
        gate: tokio::sync::Notify,
        hold_bind: std::sync::atomic::AtomicBool,
        hold_unbind: std::sync::atomic::AtomicBool,
        fail_next_bind: std::sync::atomic::AtomicBool,
    }

    impl GatedTransport {
        fn new(broker: Arc<InMemoryBroker>) -> Self {
            Self {
                inner: ChannelTransport::new(broker, "catalog"),
                gate: tokio::sync::Notify::new(),
                hold_bind: Default::default(),
                hold_unbind: Default::default(),
                fail_next_bind: Default::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl BrokerTransport for GatedTransport {
        async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
            self.inner.publish(event).await
        }

        async fn bind(&self, event_name: &str) -> Result<()> {
            use std::sync::atomic::Ordering;
            if self.hold_bind.swap(false, Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if self.fail_next_bind.swap(false, Ordering::SeqCst) {
                return Err(BusError::TransientBroker("connection lost".to_string()));
            }
            self.inner.bind(event_name).await
        }

        async fn unbind(&self, event_name: &str) -> Result<()> {
            use std::sync::atomic::Ordering;
            if self.hold_unbind.swap(false, Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.inner.unbind(event_name).await
        }

        async fn start_consuming(
            &self,
            sink: Arc<dyn crate::bus::DeliverySink>,
            shutdown: crate::bus::ShutdownSignal,
        ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
            self.inner.start_consuming(sink, shutdown).await
        }
    }

    fn gated_bus(config: DispatchConfig) -> (EventBus, Arc<GatedTransport>, Arc<InMemoryBroker>) {
        let broker = InMemoryBroker::new();
        let transport = Arc::new(GatedTransport::new(broker.clone()));
        let bus = EventBus::new(transport.clone(), config);
        for name in ["projection", "audit"] {
            bus.register_handler(
                HandlerId::new(name),
                Arc::new(RecordingHandler::new("CategoryCreated")),
            )
            .unwrap();
        }
        (bus, transport, broker)
    }

    /// Whether a published `CategoryCreated` reaches the queue.
    async fn is_bound(bus: &EventBus, broker: &InMemoryBroker) -> bool {
        let before = broker.queue_depth("catalog");
        let event = bus.prepare("CategoryCreated", &serde_json::json!({})).unwrap();
        bus.transport().publish(&event).await.unwrap();
        broker.queue_depth("catalog") > before
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_waiting_on_failed_bind_binds_itself() {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let (bus, transport, broker) = gated_bus(DispatchConfig::default());
        let (projection, audit) = (HandlerId::new("projection"), HandlerId::new("audit"));
        transport.hold_bind.store(true, Ordering::SeqCst);
        transport.fail_next_bind.store(true, Ordering::SeqCst);

        let (first, second, _) = tokio::join!(
            bus.subscribe("CategoryCreated", &projection),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                bus.subscribe("CategoryCreated", &audit).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                transport.gate.notify_one();
            }
        );

        assert!(matches!(first, Err(BusError::TransientBroker(_))));
        second.unwrap();
        assert_eq!(
            bus.registry().snapshot().handlers_for("CategoryCreated"),
            &[audit]
        );
        assert!(is_bound(&bus, &broker).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_during_teardown_keeps_binding() {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let (bus, transport, broker) = gated_bus(DispatchConfig {
            teardown_unused_bindings: true,
            ..DispatchConfig::default()
        });
        let (projection, audit) = (HandlerId::new("projection"), HandlerId::new("audit"));
        bus.subscribe("CategoryCreated", &projection).await.unwrap();
        transport.hold_unbind.store(true, Ordering::SeqCst);

        let (removed, added, _) = tokio::join!(
            bus.unsubscribe("CategoryCreated", &projection),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                bus.subscribe("CategoryCreated", &audit).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                transport.gate.notify_one();
            }
        );

        removed.unwrap();
        added.unwrap();
        assert_eq!(
            bus.registry().snapshot().handlers_for("CategoryCreated"),
            &[audit]
        );
        assert!(is_bound(&bus, &broker).await);
    }

    #[tokio::test]
    async fn test_subscribe_fails_while_bind_fails() {
        struct RefusingTransport;

        #[async_trait::async_trait]
        impl BrokerTransport for RefusingTransport {
            async fn publish(&self, _event: &IntegrationEvent) -> Result<()> {
                Ok(())
            }

            async fn bind(&self, _event_name: &str) -> Result<()> {
                Err(BusError::TransientBroker("refused".to_string()))
            }

            async fn unbind(&self, _event_name: &str) -> Result<()> {
                Ok(())
            }

            async fn start_consuming(
                &self,
                _sink: Arc<dyn crate::bus::DeliverySink>,
                _shutdown: crate::bus::ShutdownSignal,
            ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
                Ok(Vec::new())
            }
        }

        let bus = EventBus::new(Arc::new(RefusingTransport), DispatchConfig::default());
        let id = HandlerId::new("projection");
        bus.register_handler(id.clone(), Arc::new(RecordingHandler::new("CategoryCreated")))
            .unwrap();

        let result = bus.subscribe("CategoryCreated", &id).await;
        assert!(matches!(result, Err(BusError::TransientBroker(_))));
        assert!(bus.registry().snapshot().is_empty());
    }
}
