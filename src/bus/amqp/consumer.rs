//! AMQP consumption channels.

use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, BasicRejectOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use tracing::{debug, error, info, warn, Instrument};

use super::{
    Shared, HEADER_DELIVERY_COUNT, HEADER_EVENT_NAME, HEADER_OCCURRED_AT, HEADER_PARTITION_KEY,
};
use crate::bus::{
    is_shutdown, Acknowledger, BusError, DeliverySink, InboundDelivery, Result, ShutdownSignal,
};
use crate::codec::TypeTag;
use crate::event::{EventId, IntegrationEvent};
use crate::utils::retry::reconnect_backoff;

/// Settles one AMQP delivery.
///
/// Requeue is a nack with requeue, which bumps the quorum queue's delivery
/// count; dead-letter is a reject without requeue, which routes through the
/// queue's dead-letter exchange.
struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to ack: {}", e)))
    }

    async fn requeue(self: Box<Self>) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to nack: {}", e)))
    }

    async fn dead_letter(self: Box<Self>, reason: &str) -> Result<()> {
        debug!(reason = %reason, "Rejecting to dead-letter exchange");
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| BusError::TransientBroker(format!("Failed to reject: {}", e)))
    }
}

/// Consumer loop for one channel, reconnecting with backoff until shutdown.
pub(super) async fn consume_with_reconnect(
    shared: Arc<Shared>,
    index: usize,
    sink: Arc<dyn DeliverySink>,
    mut shutdown: ShutdownSignal,
) {
    let backoff_builder =
        reconnect_backoff(shared.config.reconnect_base(), shared.config.reconnect_max());
    let mut backoff = backoff_builder.build();
    let consumer_tag = format!("{}-{}", shared.queue, index);

    while !is_shutdown(&shutdown) {
        match consume_once(&shared, &consumer_tag, &sink, &mut shutdown).await {
            Ok(()) => {
                if is_shutdown(&shutdown) {
                    break;
                }
                // The stream ended cleanly but unexpectedly; start over.
                backoff = backoff_builder.build();
                info!(consumer = %consumer_tag, "Consumer stream ended, reconnecting");
            }
            Err(e) => {
                error!(consumer = %consumer_tag, error = %e, "Consumer failed");
            }
        }

        let delay = backoff
            .next()
            .unwrap_or_else(|| shared.config.reconnect_max());
        warn!(
            consumer = %consumer_tag,
            backoff_ms = delay.as_millis() as u64,
            "Retrying consumer after backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(consumer = %consumer_tag, "Consumer stopped");
}

/// Run one consumer session. Returns `Ok` on shutdown or stream end.
async fn consume_once(
    shared: &Shared,
    consumer_tag: &str,
    sink: &Arc<dyn DeliverySink>,
    shutdown: &mut ShutdownSignal,
) -> Result<()> {
    let channel = shared.consumer_channel().await?;
    channel
        .basic_qos(shared.config.prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| BusError::TransientBroker(format!("Failed to set prefetch: {}", e)))?;

    let mut consumer = channel
        .basic_consume(
            &shared.queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::TransientBroker(format!("Failed to start consumer: {}", e)))?;

    info!(consumer = %consumer_tag, queue = %shared.queue, "Consumer connected");

    loop {
        let next = tokio::select! {
            next = consumer.next() => next,
            changed = shutdown.changed() => {
                if changed.is_err() || is_shutdown(shutdown) {
                    break;
                }
                continue;
            }
        };

        match next {
            Some(Ok(delivery)) => handle_delivery(delivery, sink).await,
            Some(Err(e)) => {
                return Err(BusError::TransientBroker(format!(
                    "Consumer delivery error: {}",
                    e
                )))
            }
            None => return Ok(()),
        }
    }

    // Unacked deliveries return to the queue once the channel closes.
    if let Err(e) = channel
        .basic_cancel(consumer_tag, BasicCancelOptions::default())
        .await
    {
        debug!(consumer = %consumer_tag, error = %e, "Consumer cancel failed");
    }
    Ok(())
}

async fn handle_delivery(delivery: Delivery, sink: &Arc<dyn DeliverySink>) {
    let consume_span = tracing::info_span!("bus.consume", routing_key = %delivery.routing_key);

    let event = match event_from_message(
        delivery.routing_key.as_str(),
        &delivery.properties,
        delivery.data,
    ) {
        Ok(event) => event,
        Err(reason) => {
            error!(routing_key = %delivery.routing_key, reason = %reason, "Malformed message");
            if let Err(e) = delivery
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
            {
                error!(error = %e, "Failed to reject malformed message");
            }
            return;
        }
    };

    let delivery_count = delivery_count(&delivery.properties, delivery.redelivered);
    let inbound = InboundDelivery::new(
        event,
        delivery_count,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    );

    sink.deliver(inbound).instrument(consume_span).await;
}

fn header<'a>(properties: &'a BasicProperties, name: &str) -> Option<&'a AMQPValue> {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == name)
                .map(|(_, value)| value)
        })
}

fn header_string(properties: &BasicProperties, name: &str) -> Option<String> {
    match header(properties, name)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

fn header_i64(properties: &BasicProperties, name: &str) -> Option<i64> {
    match header(properties, name)? {
        AMQPValue::LongLongInt(n) => Some(*n),
        AMQPValue::LongInt(n) => Some(i64::from(*n)),
        AMQPValue::LongUInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortUInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortShortInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => Some(i64::from(*n)),
        _ => None,
    }
}

/// 1-based delivery count. Quorum queues report prior deliveries in
/// `x-delivery-count`; without it only the redelivered flag is known.
pub(super) fn delivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    match header_i64(properties, HEADER_DELIVERY_COUNT) {
        Some(previous) => u32::try_from(previous.max(0)).unwrap_or(u32::MAX - 1) + 1,
        None if redelivered => 2,
        None => 1,
    }
}

/// Rebuild the event from message properties and body.
pub(super) fn event_from_message(
    routing_key: &str,
    properties: &BasicProperties,
    payload: Vec<u8>,
) -> std::result::Result<IntegrationEvent, String> {
    let id: EventId = properties
        .message_id()
        .as_ref()
        .ok_or("missing message_id")?
        .as_str()
        .parse()
        .map_err(|e| format!("invalid message_id: {}", e))?;

    let type_tag = properties
        .kind()
        .as_ref()
        .map(|kind| TypeTag::new(kind.as_str()))
        .ok_or("missing type")?;

    let name = header_string(properties, HEADER_EVENT_NAME).unwrap_or_else(|| routing_key.to_string());

    let occurred_at = header_i64(properties, HEADER_OCCURRED_AT)
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .or_else(|| {
            properties
                .timestamp()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
        })
        .unwrap_or_else(Utc::now);

    Ok(IntegrationEvent {
        id,
        name,
        type_tag,
        occurred_at,
        payload,
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|c| c.as_str().to_string()),
        partition_key: header_string(properties, HEADER_PARTITION_KEY),
    })
}
