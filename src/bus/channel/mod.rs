//! In-process broker for standalone mode and tests.
//!
//! `InMemoryBroker` models the parts of a topic/queue broker the bus relies
//! on: bindings from event name to queue, per-queue FIFO delivery, explicit
//! ack / requeue / dead-letter, redelivery counting, and an availability
//! switch for simulating outages. `ChannelTransport` adapts one queue of it
//! to `BrokerTransport`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use super::{
    is_shutdown, Acknowledger, BrokerTransport, BusError, DeliverySink, InboundDelivery, Result,
    ShutdownSignal,
};
use crate::event::IntegrationEvent;

/// A message sitting in a queue.
#[derive(Debug, Clone)]
struct QueuedMessage {
    event: IntegrationEvent,
    /// Deliveries made so far.
    deliveries: u32,
}

/// A message routed to the dead-letter destination.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub queue: String,
    pub event: IntegrationEvent,
    pub reason: String,
    pub delivery_count: u32,
}

#[derive(Default)]
struct BrokerState {
    available: bool,
    bindings: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    dead_letters: Vec<DeadLetteredMessage>,
    published: u64,
}

/// In-memory topic broker.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                available: true,
                ..Default::default()
            }),
            notify: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
        info!(available, "In-memory broker availability changed");
        if available {
            self.notify.notify_waiters();
        }
    }

    pub fn is_available(&self) -> bool {
        self.state().available
    }

    /// Route `event` to every queue bound to its name.
    pub fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        let mut state = self.state();
        if !state.available {
            return Err(BusError::TransientBroker("broker unavailable".to_string()));
        }

        state.published += 1;
        let queues: Vec<String> = state
            .bindings
            .get(&event.name)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();

        for queue in &queues {
            state
                .queues
                .entry(queue.clone())
                .or_default()
                .push_back(QueuedMessage {
                    event: event.clone(),
                    deliveries: 0,
                });
        }
        drop(state);

        debug!(event_name = %event.name, queues = queues.len(), "Routed event");
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn bind(&self, queue: &str, event_name: &str) {
        self.state()
            .bindings
            .entry(event_name.to_string())
            .or_default()
            .insert(queue.to_string());
    }

    pub fn unbind(&self, queue: &str, event_name: &str) {
        let mut state = self.state();
        if let Some(queues) = state.bindings.get_mut(event_name) {
            queues.remove(queue);
            if queues.is_empty() {
                state.bindings.remove(event_name);
            }
        }
    }

    /// Messages waiting in `queue`, excluding unsettled deliveries.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Total messages accepted by `publish`.
    pub fn published_count(&self) -> u64 {
        self.state().published
    }

    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.state().dead_letters.clone()
    }

    fn try_pop(&self, queue: &str) -> Option<QueuedMessage> {
        let mut state = self.state();
        if !state.available {
            return None;
        }
        let mut message = state.queues.get_mut(queue)?.pop_front()?;
        message.deliveries += 1;
        Some(message)
    }

    /// Wait for the next message on `queue`; `None` once shutdown is raised.
    async fn next_delivery(&self, queue: &str, shutdown: &mut ShutdownSignal) -> Option<QueuedMessage> {
        loop {
            if is_shutdown(shutdown) {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pop(queue) {
                return Some(message);
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Put a delivered message back at the head of its queue.
    fn requeue(&self, queue: &str, message: QueuedMessage) {
        self.state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_front(message);
        self.notify.notify_waiters();
    }

    fn dead_letter(&self, queue: &str, message: QueuedMessage, reason: &str) {
        self.state().dead_letters.push(DeadLetteredMessage {
            queue: queue.to_string(),
            event: message.event,
            reason: reason.to_string(),
            delivery_count: message.deliveries,
        });
    }
}

/// Settles one in-memory delivery. Unsettled on drop means requeue.
struct ChannelAcker {
    broker: Arc<InMemoryBroker>,
    queue: String,
    message: Option<QueuedMessage>,
}

#[async_trait]
impl Acknowledger for ChannelAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.message.take();
        Ok(())
    }

    async fn requeue(self: Box<Self>) -> Result<()> {
        let mut this = self;
        if let Some(message) = this.message.take() {
            this.broker.requeue(&this.queue, message);
        }
        Ok(())
    }

    async fn dead_letter(self: Box<Self>, reason: &str) -> Result<()> {
        let mut this = self;
        if let Some(message) = this.message.take() {
            this.broker.dead_letter(&this.queue, message, reason);
        }
        Ok(())
    }
}

impl Drop for ChannelAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.broker.requeue(&self.queue, message);
        }
    }
}

/// `BrokerTransport` over one queue of an `InMemoryBroker`.
pub struct ChannelTransport {
    broker: Arc<InMemoryBroker>,
    queue: String,
    consumer_channels: usize,
}

impl ChannelTransport {
    pub fn new(broker: Arc<InMemoryBroker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            consumer_channels: 1,
        }
    }

    /// Run `channels` consumption loops in parallel.
    pub fn with_consumer_channels(mut self, channels: usize) -> Self {
        self.consumer_channels = channels.max(1);
        self
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn consume(
        broker: Arc<InMemoryBroker>,
        queue: String,
        sink: Arc<dyn DeliverySink>,
        mut shutdown: ShutdownSignal,
    ) {
        while let Some(message) = broker.next_delivery(&queue, &mut shutdown).await {
            let consume_span = tracing::info_span!(
                "bus.consume",
                queue = %queue,
                event_name = %message.event.name
            );

            let delivery = InboundDelivery::new(
                message.event.clone(),
                message.deliveries,
                Box::new(ChannelAcker {
                    broker: broker.clone(),
                    queue: queue.clone(),
                    message: Some(message),
                }),
            );

            sink.deliver(delivery).instrument(consume_span).await;
        }

        debug!(queue = %queue, "Consumer stopped");
    }
}

#[async_trait]
impl BrokerTransport for ChannelTransport {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_name = %event.name))]
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        self.broker.publish(event)
    }

    async fn bind(&self, event_name: &str) -> Result<()> {
        self.broker.bind(&self.queue, event_name);
        debug!(queue = %self.queue, event_name = %event_name, "Bound queue");
        Ok(())
    }

    async fn unbind(&self, event_name: &str) -> Result<()> {
        self.broker.unbind(&self.queue, event_name);
        debug!(queue = %self.queue, event_name = %event_name, "Unbound queue");
        Ok(())
    }

    async fn start_consuming(
        &self,
        sink: Arc<dyn DeliverySink>,
        shutdown: ShutdownSignal,
    ) -> Result<Vec<JoinHandle<()>>> {
        info!(
            queue = %self.queue,
            channels = self.consumer_channels,
            "Starting in-memory consumers"
        );

        let handles = (0..self.consumer_channels)
            .map(|_| {
                tokio::spawn(Self::consume(
                    self.broker.clone(),
                    self.queue.clone(),
                    sink.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Ok(handles)
    }
}
