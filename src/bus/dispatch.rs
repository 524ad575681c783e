//! Inbound dispatch.
//!
//! The `Dispatcher` turns one consumed message into an ack, a requeue or a
//! dead-letter decision:
//!
//! 1. Claim the event in the inbox; a duplicate is acked, a delivery still
//!    running on another channel is requeued
//! 2. Resolve the current subscriptions for the event name
//! 3. Decode the payload; undecodable messages are dead-lettered at once
//! 4. Run every subscribed handler, each bounded by the handler timeout
//! 5. All succeeded: mark the inbox entry processed, then ack
//! 6. Any failed: release the claim, requeue until the delivery limit, then
//!    dead-letter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::{DeliverySink, InboundDelivery};
use crate::codec::{CodecError, EventCodec};
use crate::config::DispatchConfig;
use crate::dlq::{DeadLetter, DeadLetterPublisher};
use crate::event::{EventId, InboxRecord};
use crate::handler::{HandlerError, ReceivedEvent};
use crate::storage::{InboxClaim, InboxStore};
use crate::subscription::{HandlerCatalog, HandlerId, SubscriptionRegistry};

/// Pause before requeueing when local storage is failing, so a broken
/// database does not turn into a hot redelivery loop.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Pause before handing back a delivery whose event another channel is
/// processing; the redelivery usually finds it processed.
const IN_PROGRESS_RETRY_DELAY: Duration = Duration::from_millis(200);

/// What the dispatcher did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Already processed; acked without invoking handlers.
    Deduplicated,
    /// No handler subscribed at dispatch time; acked.
    NoSubscribers,
    /// Every handler succeeded; inbox recorded and acked.
    Acknowledged,
    /// Returned to the broker for redelivery.
    Retrying,
    /// Routed to the dead-letter destination.
    DeadLettered,
}

impl DispatchOutcome {
    /// Whether the message left the queue for good.
    pub fn is_settled(&self) -> bool {
        !matches!(self, DispatchOutcome::Retrying)
    }
}

/// Routes consumed messages to subscribed handlers.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<HandlerCatalog>,
    codec: Arc<EventCodec>,
    inbox: Arc<dyn InboxStore>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        catalog: Arc<HandlerCatalog>,
        codec: Arc<EventCodec>,
        inbox: Arc<dyn InboxStore>,
        dead_letters: Arc<dyn DeadLetterPublisher>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            codec,
            inbox,
            dead_letters,
            config,
        }
    }

    /// Process one delivery and settle it with the broker.
    pub async fn dispatch(&self, delivery: InboundDelivery) -> DispatchOutcome {
        let event_id = delivery.event.id;

        let stale_before = chrono::Duration::from_std(self.config.claim_lease())
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self
            .inbox
            .claim(event_id, &delivery.event.name, stale_before)
            .await
        {
            Ok(InboxClaim::Claimed) => {}
            Ok(InboxClaim::Processed) => {
                debug!(event_id = %event_id, "Duplicate delivery, skipping handlers");
                settle_ack(delivery).await;
                return DispatchOutcome::Deduplicated;
            }
            Ok(InboxClaim::InProgress) => {
                debug!(event_id = %event_id, "Event in progress on another channel, requeueing");
                tokio::time::sleep(IN_PROGRESS_RETRY_DELAY).await;
                settle_requeue(delivery).await;
                return DispatchOutcome::Retrying;
            }
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Inbox claim failed");
                return self.requeue_after_store_error(delivery).await;
            }
        }

        let claim = ClaimGuard {
            inbox: self.inbox.clone(),
            event_id,
            held: true,
        };

        // One snapshot for the whole dispatch; concurrent subscription
        // changes apply to the next delivery.
        let snapshot = self.registry.snapshot();
        let handlers = snapshot.handlers_for(&delivery.event.name);
        if handlers.is_empty() {
            debug!(
                event_id = %event_id,
                event_name = %delivery.event.name,
                "No subscribers, acknowledging"
            );
            claim.release().await;
            settle_ack(delivery).await;
            return DispatchOutcome::NoSubscribers;
        }

        let payload = match self
            .codec
            .decode(&delivery.event.type_tag, &delivery.event.payload)
        {
            Ok(payload) => payload,
            Err(e) => {
                let dead_letter = match &e {
                    CodecError::UnknownEventType(_) => DeadLetter::from_unknown_type(&delivery.event),
                    CodecError::Serialization(inner) => {
                        DeadLetter::from_serialization(&delivery.event, &inner.to_string())
                    }
                };
                warn!(event_id = %event_id, error = %e, "Undecodable message");
                claim.release().await;
                return self.dead_letter(delivery, dead_letter).await;
            }
        };

        let received = Arc::new(ReceivedEvent::new(
            &delivery.event,
            delivery.delivery_count,
            payload,
        ));
        let failures = self.run_handlers(handlers, received).await;

        if failures.is_empty() {
            return self.complete(delivery, claim).await;
        }

        let retryable = failures.iter().all(|(_, e)| e.is_retryable());
        let errors: Vec<String> = failures
            .iter()
            .map(|(handler, e)| format!("{}: {}", handler, e))
            .collect();
        claim.release().await;

        if retryable && delivery.delivery_count < self.config.max_deliveries {
            warn!(
                event_id = %event_id,
                delivery_count = delivery.delivery_count,
                max_deliveries = self.config.max_deliveries,
                errors = ?errors,
                "Handlers failed, requeueing"
            );
            settle_requeue(delivery).await;
            return DispatchOutcome::Retrying;
        }

        let dead_letter = DeadLetter::from_handler_failure(
            &delivery.event,
            errors,
            delivery.delivery_count,
            retryable,
        );
        self.dead_letter(delivery, dead_letter).await
    }

    /// Invoke every handler concurrently; returns the failures.
    async fn run_handlers(
        &self,
        handlers: &[HandlerId],
        event: Arc<ReceivedEvent>,
    ) -> Vec<(HandlerId, HandlerError)> {
        let timeout = self.config.handler_timeout();

        let runs = handlers.iter().map(|id| {
            let handler = self.catalog.resolve(id);
            let event = event.clone();
            async move {
                let result = match handler {
                    Some(handler) => match tokio::time::timeout(timeout, handler.handle(event)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(HandlerError::failed(format!(
                            "timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    },
                    None => Err(HandlerError::failed("handler not registered")),
                };
                (id.clone(), result)
            }
        });

        join_all(runs)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }

    async fn complete(&self, delivery: InboundDelivery, mut claim: ClaimGuard) -> DispatchOutcome {
        let record = InboxRecord::processed_now(&delivery.event);
        match self.inbox.record(&record).await {
            Ok(inserted) => {
                claim.held = false;
                if !inserted {
                    debug!(event_id = %record.event_id, "Inbox already held event");
                }
                settle_ack(delivery).await;
                DispatchOutcome::Acknowledged
            }
            Err(e) => {
                // Handlers ran but the proof did not persist; the claim is
                // dropped and the redelivery re-runs them.
                error!(event_id = %record.event_id, error = %e, "Inbox write failed");
                drop(claim);
                self.requeue_after_store_error(delivery).await
            }
        }
    }

    async fn dead_letter(&self, delivery: InboundDelivery, dead_letter: DeadLetter) -> DispatchOutcome {
        info!(
            event_id = %delivery.event.id,
            reason = %dead_letter.reason,
            "Dead-lettering message"
        );

        if let Err(e) = self.dead_letters.publish(dead_letter.clone()).await {
            error!(event_id = %delivery.event.id, error = %e, "Dead letter publisher failed");
        }
        if let Err(e) = delivery.dead_letter(&dead_letter.reason).await {
            error!(event_id = %dead_letter.event.id, error = %e, "Broker dead-letter failed");
        }
        DispatchOutcome::DeadLettered
    }

    async fn requeue_after_store_error(&self, delivery: InboundDelivery) -> DispatchOutcome {
        tokio::time::sleep(STORE_RETRY_DELAY).await;
        settle_requeue(delivery).await;
        DispatchOutcome::Retrying
    }
}

/// Inbox claim held for the length of one dispatch.
///
/// Dropped while still held (the consumer task was aborted mid-handler, or
/// the inbox write failed), it releases the claim in the background so the
/// redelivery does not wait for the lease to run out.
struct ClaimGuard {
    inbox: Arc<dyn InboxStore>,
    event_id: EventId,
    held: bool,
}

impl ClaimGuard {
    /// A failed release only delays redelivery until the claim goes stale.
    async fn release(mut self) {
        self.held = false;
        if let Err(e) = self.inbox.release(self.event_id).await {
            warn!(event_id = %self.event_id, error = %e, "Inbox release failed");
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inbox = self.inbox.clone();
        let event_id = self.event_id;
        runtime.spawn(async move {
            if let Err(e) = inbox.release(event_id).await {
                warn!(event_id = %event_id, error = %e, "Inbox release failed");
            }
        });
    }
}

#[async_trait]
impl DeliverySink for Dispatcher {
    async fn deliver(&self, delivery: InboundDelivery) -> DispatchOutcome {
        self.dispatch(delivery).await
    }
}

async fn settle_ack(delivery: InboundDelivery) {
    let event_id = delivery.event.id;
    if let Err(e) = delivery.ack().await {
        warn!(event_id = %event_id, error = %e, "Ack failed, broker will redeliver");
    }
}

async fn settle_requeue(delivery: InboundDelivery) {
    let event_id = delivery.event.id;
    if let Err(e) = delivery.requeue().await {
        warn!(event_id = %event_id, error = %e, "Requeue failed, broker will redeliver");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Acknowledger, Result as BusResult};
    use crate::codec::{EventSchema, TypeTag};
    use crate::dlq::ChannelDeadLetterPublisher;
    use crate::event::{InboxState, IntegrationEvent};
    use crate::handler::IntegrationEventHandler;
    use crate::storage::{Result as StoreResult, StoreError};
    use chrono::{DateTime, Utc};
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Settlement {
        Ack,
        Requeue,
        DeadLetter(String),
    }

    struct RecordingAcker {
        settled: Arc<Mutex<Vec<Settlement>>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(self: Box<Self>) -> BusResult<()> {
            self.settled.lock().unwrap().push(Settlement::Ack);
            Ok(())
        }

        async fn requeue(self: Box<Self>) -> BusResult<()> {
            self.settled.lock().unwrap().push(Settlement::Requeue);
            Ok(())
        }

        async fn dead_letter(self: Box<Self>, reason: &str) -> BusResult<()> {
            self.settled
                .lock()
                .unwrap()
                .push(Settlement::DeadLetter(reason.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryInbox {
        entries: Mutex<HashMap<EventId, InboxState>>,
        broken: AtomicBool,
    }

    impl MemoryInbox {
        fn check(&self) -> StoreResult<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Corrupt("inbox offline".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl InboxStore for MemoryInbox {
        async fn init_schema(&self) -> StoreResult<()> {
            Ok(())
        }

        async fn contains(&self, id: EventId) -> StoreResult<bool> {
            self.check()?;
            Ok(self.entries.lock().unwrap().get(&id) == Some(&InboxState::Processed))
        }

        async fn claim(
            &self,
            id: EventId,
            _event_name: &str,
            _stale_before: DateTime<Utc>,
        ) -> StoreResult<InboxClaim> {
            self.check()?;
            let mut entries = self.entries.lock().unwrap();
            Ok(match entries.get(&id) {
                None => {
                    entries.insert(id, InboxState::Processing);
                    InboxClaim::Claimed
                }
                Some(InboxState::Processing) => InboxClaim::InProgress,
                Some(InboxState::Processed) => InboxClaim::Processed,
            })
        }

        async fn record(&self, record: &InboxRecord) -> StoreResult<bool> {
            self.check()?;
            let previous = self
                .entries
                .lock()
                .unwrap()
                .insert(record.event_id, InboxState::Processed);
            Ok(previous != Some(InboxState::Processed))
        }

        async fn release(&self, id: EventId) -> StoreResult<()> {
            let mut entries = self.entries.lock().unwrap();
            if entries.get(&id) == Some(&InboxState::Processing) {
                entries.remove(&id);
            }
            Ok(())
        }

        async fn purge_before(&self, _cutoff: DateTime<Utc>) -> StoreResult<u64> {
            Ok(0)
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl IntegrationEventHandler for CountingHandler {
        fn schema(&self) -> EventSchema {
            EventSchema::new("CategoryCreated")
        }

        fn handle(&self, _event: Arc<ReceivedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(HandlerError::failed("database down"))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct SlowHandler {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl SlowHandler {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: Arc::default(),
            }
        }
    }

    impl IntegrationEventHandler for SlowHandler {
        fn schema(&self) -> EventSchema {
            EventSchema::new("CategoryCreated")
        }

        fn handle(&self, _event: Arc<ReceivedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<SubscriptionRegistry>,
        catalog: Arc<HandlerCatalog>,
        inbox: Arc<MemoryInbox>,
        dead_letters: tokio::sync::mpsc::UnboundedReceiver<DeadLetter>,
    }

    fn fixture(config: DispatchConfig) -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new());
        let catalog = Arc::new(HandlerCatalog::new());
        let codec = Arc::new(EventCodec::new());
        codec.register(EventSchema::new("CategoryCreated")).unwrap();
        let inbox = Arc::new(MemoryInbox::default());
        let (publisher, dead_letters) = ChannelDeadLetterPublisher::new();

        let dispatcher = Dispatcher::new(
            registry.clone(),
            catalog.clone(),
            codec,
            inbox.clone(),
            Arc::new(publisher),
            config,
        );

        Fixture {
            dispatcher,
            registry,
            catalog,
            inbox,
            dead_letters,
        }
    }

    fn subscribe(fixture: &Fixture, id: &str, handler: impl IntegrationEventHandler + 'static) {
        let id = HandlerId::new(id);
        fixture.catalog.register(id.clone(), Arc::new(handler)).unwrap();
        fixture.registry.add("CategoryCreated", &id);
    }

    fn make_event() -> IntegrationEvent {
        IntegrationEvent::new(
            "CategoryCreated",
            TypeTag::new("CategoryCreated/v1"),
            br#"{"name":"Podcasts"}"#.to_vec(),
        )
    }

    fn delivery(event: &IntegrationEvent, count: u32) -> (InboundDelivery, Arc<Mutex<Vec<Settlement>>>) {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let acker = RecordingAcker {
            settled: settled.clone(),
        };
        (
            InboundDelivery::new(event.clone(), count, Box::new(acker)),
            settled,
        )
    }

    #[tokio::test]
    async fn test_success_records_inbox_and_acks() {
        let fixture = fixture(DispatchConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        subscribe(&fixture, "a", CountingHandler { calls: calls.clone(), fail: false });
        subscribe(&fixture, "b", CountingHandler { calls: calls.clone(), fail: false });

        let event = make_event();
        let (d, settled) = delivery(&event, 1);

        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::Acknowledged);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*settled.lock().unwrap(), vec![Settlement::Ack]);
        assert!(fixture.inbox.contains(event.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_skips_handlers() {
        let fixture = fixture(DispatchConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        subscribe(&fixture, "a", CountingHandler { calls: calls.clone(), fail: false });

        let event = make_event();
        let (first, _) = delivery(&event, 1);
        fixture.dispatcher.dispatch(first).await;

        let (second, settled) = delivery(&event, 1);
        assert_eq!(fixture.dispatcher.dispatch(second).await, DispatchOutcome::Deduplicated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*settled.lock().unwrap(), vec![Settlement::Ack]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_duplicate_runs_handlers_once() {
        let fixture = fixture(DispatchConfig::default());
        let handler = SlowHandler::new(Duration::from_millis(200));
        let calls = handler.calls.clone();
        subscribe(&fixture, "slow", handler);

        let event = make_event();
        let (first, first_settled) = delivery(&event, 1);
        let (second, second_settled) = delivery(&event, 1);

        let (a, b) = tokio::join!(
            fixture.dispatcher.dispatch(first),
            fixture.dispatcher.dispatch(second)
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, DispatchOutcome::Acknowledged);
        assert_eq!(b, DispatchOutcome::Retrying);
        assert_eq!(*first_settled.lock().unwrap(), vec![Settlement::Ack]);
        assert_eq!(*second_settled.lock().unwrap(), vec![Settlement::Requeue]);

        // The requeued copy comes back and finds the event processed.
        let (redelivered, _) = delivery(&event, 2);
        assert_eq!(
            fixture.dispatcher.dispatch(redelivered).await,
            DispatchOutcome::Deduplicated
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_dispatch_releases_claim() {
        let fixture = fixture(DispatchConfig::default());
        subscribe(&fixture, "slow", SlowHandler::new(Duration::from_secs(60)));

        let event = make_event();
        let (d, settled) = delivery(&event, 1);

        // Dropping the future mid-handler is what an aborted consumer does.
        let cut_short =
            tokio::time::timeout(Duration::from_millis(100), fixture.dispatcher.dispatch(d)).await;
        assert!(cut_short.is_err());
        assert!(settled.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let claim = fixture
            .inbox
            .claim(event.id, &event.name, Utc::now())
            .await
            .unwrap();
        assert_eq!(claim, InboxClaim::Claimed);
    }

    #[tokio::test]
    async fn test_no_subscribers_acks_without_inbox() {
        let fixture = fixture(DispatchConfig::default());
        let event = make_event();
        let (d, settled) = delivery(&event, 1);

        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::NoSubscribers);
        assert_eq!(*settled.lock().unwrap(), vec![Settlement::Ack]);
        assert!(!fixture.inbox.contains(event.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_requeues_below_limit() {
        let fixture = fixture(DispatchConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        subscribe(&fixture, "ok", CountingHandler { calls: calls.clone(), fail: false });
        subscribe(&fixture, "bad", CountingHandler { calls: calls.clone(), fail: true });

        let event = make_event();
        let (d, settled) = delivery(&event, 1);

        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::Retrying);
        assert_eq!(*settled.lock().unwrap(), vec![Settlement::Requeue]);
        assert!(!fixture.inbox.contains(event.id).await.unwrap());

        // The claim was released, so the redelivery runs both handlers again.
        let (redelivered, _) = delivery(&event, 2);
        assert_eq!(fixture.dispatcher.dispatch(redelivered).await, DispatchOutcome::Retrying);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failure_at_limit_dead_letters() {
        let mut fixture = fixture(DispatchConfig {
            max_deliveries: 3,
            ..DispatchConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        subscribe(&fixture, "bad", CountingHandler { calls, fail: true });

        let event = make_event();
        let (d, settled) = delivery(&event, 3);

        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::DeadLettered);
        assert!(matches!(
            settled.lock().unwrap().as_slice(),
            [Settlement::DeadLetter(reason)] if reason.contains("bad: Handler failed")
        ));

        let dead = fixture.dead_letters.try_recv().unwrap();
        assert_eq!(dead.event.id, event.id);
        assert_eq!(dead.source_component, "dispatcher");
    }

    #[tokio::test]
    async fn test_unknown_type_dead_letters_immediately() {
        let mut fixture = fixture(DispatchConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        subscribe(&fixture, "a", CountingHandler { calls: calls.clone(), fail: false });

        let event = IntegrationEvent::new(
            "CategoryCreated",
            TypeTag::new("CategoryCreated/v9"),
            b"{}".to_vec(),
        );
        let (d, settled) = delivery(&event, 1);

        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(settled.lock().unwrap().len(), 1);
        assert!(fixture.dead_letters.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_body_dead_letters_immediately() {
        let fixture = fixture(DispatchConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        subscribe(&fixture, "a", CountingHandler { calls: calls.clone(), fail: false });

        let event = IntegrationEvent::new(
            "CategoryCreated",
            TypeTag::new("CategoryCreated/v1"),
            b"not json".to_vec(),
        );
        let (d, _) = delivery(&event, 1);

        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_counts_as_failure() {
        let fixture = fixture(DispatchConfig {
            handler_timeout_ms: 100,
            ..DispatchConfig::default()
        });
        subscribe(&fixture, "slow", SlowHandler::new(Duration::from_secs(60)));

        let (d, settled) = delivery(&make_event(), 1);
        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::Retrying);
        assert_eq!(*settled.lock().unwrap(), vec![Settlement::Requeue]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbox_failure_requeues() {
        let fixture = fixture(DispatchConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        subscribe(&fixture, "a", CountingHandler { calls: calls.clone(), fail: false });
        fixture.inbox.broken.store(true, Ordering::SeqCst);

        let (d, settled) = delivery(&make_event(), 1);
        assert_eq!(fixture.dispatcher.dispatch(d).await, DispatchOutcome::Retrying);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*settled.lock().unwrap(), vec![Settlement::Requeue]);
    }
}
