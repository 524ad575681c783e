//! AMQP (RabbitMQ) broker transport.
//!
//! Topology, declared idempotently on every (re)connect:
//! - `{exchange}`: durable topic exchange; routing key = event name
//! - `{queue}`: durable quorum queue for this service, dead-lettering into
//!   `{exchange}.dlx`
//! - `{exchange}.dlx` (fanout) -> `{queue}.dead-letter`
//! - one `{queue}` <- `{exchange}` binding per subscribed event name
//!
//! A single connection is shared by the publisher channel (in confirm mode)
//! and the consumer channels. The link is rebuilt lazily under a mutex when
//! it drops, re-declaring the topology and every remembered binding.

mod consumer;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerTransport, BusError, DeliverySink, Result, ShutdownSignal};
use crate::config::AmqpConfig;
use crate::event::IntegrationEvent;

/// Header carrying the logical event name.
const HEADER_EVENT_NAME: &str = "event-name";
/// Header carrying `occurred_at` as epoch microseconds.
const HEADER_OCCURRED_AT: &str = "occurred-at";
const HEADER_PARTITION_KEY: &str = "partition-key";
/// Set by quorum queues on redelivery: deliveries made before this one.
const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";

const CONTENT_TYPE_JSON: &str = "application/json";
/// AMQP persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Live connection plus the confirm-mode publisher channel.
struct AmqpLink {
    connection: Connection,
    publisher: Channel,
}

impl AmqpLink {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.publisher.status().connected()
    }
}

/// State shared by the transport handle and its consumer tasks.
struct Shared {
    config: AmqpConfig,
    queue: String,
    dead_letter_exchange: String,
    dead_letter_queue: String,
    link: Mutex<Option<AmqpLink>>,
    bindings: Mutex<BTreeSet<String>>,
}

impl Shared {
    /// Publisher channel, reconnecting first if the link is down.
    ///
    /// Callers hold `link` so reconnects and publishes never interleave.
    async fn ensure_link<'a>(&self, link: &'a mut Option<AmqpLink>) -> Result<&'a AmqpLink> {
        if !link.as_ref().is_some_and(AmqpLink::is_connected) {
            if link.take().is_some() {
                warn!(url = %self.config.url, "AMQP link lost, reconnecting");
            }
            *link = Some(self.open_link().await?);
        }

        link.as_ref()
            .ok_or_else(|| BusError::TransientBroker("AMQP link unavailable".to_string()))
    }

    async fn open_link(&self) -> Result<AmqpLink> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to connect: {}", e)))?;
        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to create channel: {}", e)))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to enable confirms: {}", e)))?;

        let bindings: Vec<String> = self.bindings.lock().await.iter().cloned().collect();
        self.declare_topology(&publisher, &bindings).await?;

        info!(
            exchange = %self.config.exchange,
            queue = %self.queue,
            bindings = bindings.len(),
            "Connected to AMQP"
        );

        Ok(AmqpLink {
            connection,
            publisher,
        })
    }

    async fn declare_topology(&self, channel: &Channel, bindings: &[String]) -> Result<()> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to declare exchange: {}", e)))?;

        channel
            .exchange_declare(
                &self.dead_letter_exchange,
                ExchangeKind::Fanout,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::TransientBroker(format!("Failed to declare dead-letter exchange: {}", e))
            })?;

        let queue_options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .queue_declare(&self.dead_letter_queue, queue_options, FieldTable::default())
            .await
            .map_err(|e| {
                BusError::TransientBroker(format!("Failed to declare dead-letter queue: {}", e))
            })?;
        channel
            .queue_bind(
                &self.dead_letter_queue,
                &self.dead_letter_exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::TransientBroker(format!("Failed to bind dead-letter queue: {}", e))
            })?;

        let mut arguments = FieldTable::default();
        arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.dead_letter_exchange.as_str().into()),
        );

        channel
            .queue_declare(&self.queue, queue_options, arguments)
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to declare queue: {}", e)))?;

        for event_name in bindings {
            self.bind_on(channel, event_name).await?;
        }

        Ok(())
    }

    async fn bind_on(&self, channel: &Channel, event_name: &str) -> Result<()> {
        channel
            .queue_bind(
                &self.queue,
                &self.config.exchange,
                event_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::TransientBroker(format!("Failed to bind '{}': {}", event_name, e))
            })?;

        debug!(queue = %self.queue, event_name = %event_name, "Bound queue to exchange");
        Ok(())
    }

    /// Open a new channel on the shared connection for a consumer.
    async fn consumer_channel(&self) -> Result<Channel> {
        let mut link = self.link.lock().await;
        let current = self.ensure_link(&mut link).await?;
        current
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to create channel: {}", e)))
    }
}

/// `BrokerTransport` over RabbitMQ.
pub struct AmqpTransport {
    shared: Arc<Shared>,
}

impl AmqpTransport {
    /// Create a transport for `queue`. No connection is made until first use
    /// or `connect()`.
    pub fn new(config: AmqpConfig, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            shared: Arc::new(Shared {
                dead_letter_exchange: format!("{}.dlx", config.exchange),
                dead_letter_queue: format!("{}.dead-letter", queue),
                config,
                queue,
                link: Mutex::new(None),
                bindings: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Connect now and declare the topology.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.shared.link.lock().await;
        self.shared.ensure_link(&mut link).await?;
        Ok(())
    }

    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.shared.dead_letter_queue
    }

    /// Event names currently bound to this service's queue.
    pub async fn bindings(&self) -> Vec<String> {
        self.shared.bindings.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_name = %event.name))]
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        let confirm = {
            let mut link = self.shared.link.lock().await;
            let current = self.shared.ensure_link(&mut link).await?;

            let result = current
                .publisher
                .basic_publish(
                    &self.shared.config.exchange,
                    &event.name,
                    BasicPublishOptions::default(),
                    &event.payload,
                    properties_for(event),
                )
                .await;

            match result {
                Ok(confirm) => confirm,
                Err(e) => {
                    // Force a reconnect on the next attempt.
                    link.take();
                    return Err(BusError::TransientBroker(format!("Failed to publish: {}", e)));
                }
            }
        };

        let timeout = self.shared.config.publish_timeout();
        match tokio::time::timeout(timeout, confirm).await {
            Ok(Ok(Confirmation::Nack(_))) => Err(BusError::TransientBroker(
                "Broker rejected publish (nack)".to_string(),
            )),
            Ok(Ok(_)) => {
                debug!(
                    event_id = %event.id,
                    exchange = %self.shared.config.exchange,
                    "Publish confirmed"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(BusError::TransientBroker(format!(
                "Publish confirmation failed: {}",
                e
            ))),
            Err(_) => Err(BusError::TransientBroker(format!(
                "No publisher confirm within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn bind(&self, event_name: &str) -> Result<()> {
        if !self.shared.bindings.lock().await.insert(event_name.to_string()) {
            return Ok(());
        }

        let mut link = self.shared.link.lock().await;
        let current = match self.shared.ensure_link(&mut link).await {
            // Binding again after a fresh link declared it is harmless.
            Ok(current) => current,
            Err(e) => {
                warn!(
                    event_name = %event_name,
                    error = %e,
                    "Broker unavailable, binding deferred to reconnect"
                );
                return Ok(());
            }
        };

        if let Err(e) = self.shared.bind_on(&current.publisher, event_name).await {
            self.shared.bindings.lock().await.remove(event_name);
            return Err(e);
        }
        Ok(())
    }

    async fn unbind(&self, event_name: &str) -> Result<()> {
        self.shared.bindings.lock().await.remove(event_name);

        let link = self.shared.link.lock().await;
        let Some(current) = link.as_ref().filter(|l| l.is_connected()) else {
            // Not declared on the next reconnect.
            return Ok(());
        };

        current
            .publisher
            .queue_unbind(
                &self.shared.queue,
                &self.shared.config.exchange,
                event_name,
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::TransientBroker(format!("Failed to unbind '{}': {}", event_name, e))
            })?;

        debug!(queue = %self.shared.queue, event_name = %event_name, "Unbound queue");
        Ok(())
    }

    async fn start_consuming(
        &self,
        sink: Arc<dyn DeliverySink>,
        shutdown: ShutdownSignal,
    ) -> Result<Vec<JoinHandle<()>>> {
        let channels = self.shared.config.consumer_channels.max(1);
        info!(queue = %self.shared.queue, channels, "Starting AMQP consumers");

        let handles = (0..channels)
            .map(|index| {
                tokio::spawn(consumer::consume_with_reconnect(
                    self.shared.clone(),
                    index,
                    sink.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Ok(handles)
    }
}

/// Message properties carrying everything but the payload.
fn properties_for(event: &IntegrationEvent) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        HEADER_EVENT_NAME.into(),
        AMQPValue::LongString(event.name.as_str().into()),
    );
    headers.insert(
        HEADER_OCCURRED_AT.into(),
        AMQPValue::LongLongInt(event.occurred_at.timestamp_micros()),
    );
    if let Some(key) = &event.partition_key {
        headers.insert(
            HEADER_PARTITION_KEY.into(),
            AMQPValue::LongString(key.as_str().into()),
        );
    }

    let properties = BasicProperties::default()
        .with_message_id(ShortString::from(event.id.to_string()))
        .with_kind(ShortString::from(event.type_tag.as_str()))
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_delivery_mode(PERSISTENT)
        .with_timestamp(event.occurred_at.timestamp().max(0) as u64)
        .with_headers(headers);

    match &event.correlation_id {
        Some(correlation_id) => properties.with_correlation_id(correlation_id.as_str().into()),
        None => properties,
    }
}
