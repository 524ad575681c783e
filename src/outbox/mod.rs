//! Outbox relay.
//!
//! Background loop that drains Pending outbox records and hands them to the
//! broker. A record becomes Sent only after the broker acknowledged it, in
//! its own small update, so a crash between the two causes at worst one
//! duplicate publish. Failures are counted and deferred with exponential
//! backoff; once `max_attempts` is reached the record moves to Failed and a
//! dead letter is raised.
//!
//! Records are attempted in insertion (`sequence`) order. Within one
//! cycle, once a partition key has a record that cannot go out (not yet due,
//! or its publish just failed), later records with that key wait for a
//! later cycle, so per-key order survives retries and relay restarts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{is_shutdown, BrokerTransport, BusError, ShutdownSignal};
use crate::config::OutboxConfig;
use crate::dlq::{DeadLetter, DeadLetterPublisher};
use crate::event::OutboxRecord;
use crate::storage::{OutboxStore, Result};
use crate::utils::retry::{delay_for_attempt, relay_backoff};

/// Wakes the relay ahead of its next poll.
///
/// Cloned into every unit of work; `UnitOfWork::commit` calls `wake()` after
/// writing events.
#[derive(Clone, Default)]
pub struct RelayWaker(Arc<Notify>);

impl RelayWaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an immediate drain. Wakes coalesce while the relay is busy.
    pub fn wake(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// Statistics from one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCycle {
    /// Pending records read from the store.
    pub fetched: usize,
    /// Acknowledged by the broker and marked Sent.
    pub published: usize,
    /// Not yet due for another attempt.
    pub deferred: usize,
    /// Held back behind an earlier record with the same partition key.
    pub skipped: usize,
    /// Failed and rescheduled.
    pub retried: usize,
    /// Failed for the last time and marked Failed.
    pub failed: usize,
}

impl RelayCycle {
    pub fn attempted(&self) -> usize {
        self.published + self.retried + self.failed
    }
}

/// Drains the outbox into the broker.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn BrokerTransport>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    config: OutboxConfig,
    waker: RelayWaker,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn BrokerTransport>,
        dead_letters: Arc<dyn DeadLetterPublisher>,
        config: OutboxConfig,
        waker: RelayWaker,
    ) -> Self {
        Self {
            store,
            transport,
            dead_letters,
            config,
            waker,
        }
    }

    pub fn waker(&self) -> &RelayWaker {
        &self.waker
    }

    /// Attempt every eligible record in one batch.
    pub async fn run_once(&self) -> Result<RelayCycle> {
        let records = self.store.fetch_pending(self.config.batch_size).await?;
        let now = Utc::now();
        let mut cycle = RelayCycle {
            fetched: records.len(),
            ..RelayCycle::default()
        };
        let mut blocked: HashSet<String> = HashSet::new();

        for record in records {
            let key = record.event.partition_key.clone();

            if key.as_ref().is_some_and(|k| blocked.contains(k)) {
                cycle.skipped += 1;
                continue;
            }

            if !record.is_due(now) {
                cycle.deferred += 1;
                if let Some(key) = key {
                    blocked.insert(key);
                }
                continue;
            }

            match self.publish(&record).await {
                Ok(()) => {
                    self.store.mark_sent(record.event.id).await?;
                    cycle.published += 1;
                    debug!(
                        event_id = %record.event.id,
                        event_name = %record.event.name,
                        "Outbox record sent"
                    );
                }
                Err(e) => {
                    if let Some(key) = key {
                        blocked.insert(key);
                    }
                    if self.record_failure(&record, &e).await? {
                        cycle.failed += 1;
                    } else {
                        cycle.retried += 1;
                    }
                }
            }
        }

        if cycle.fetched > 0 {
            debug!(?cycle, "Relay cycle finished");
        }
        Ok(cycle)
    }

    async fn publish(&self, record: &OutboxRecord) -> std::result::Result<(), BusError> {
        let timeout = self.config.publish_timeout();
        match tokio::time::timeout(timeout, self.transport.publish(&record.event)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::TransientBroker(format!(
                "publish timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Count a failed attempt. Returns true when the record was given up on.
    async fn record_failure(&self, record: &OutboxRecord, error: &BusError) -> Result<bool> {
        let attempts = record.attempt_count + 1;
        let message = error.to_string();

        if attempts >= self.config.max_attempts {
            self.store.mark_failed(record.event.id, &message).await?;
            error!(
                event_id = %record.event.id,
                event_name = %record.event.name,
                attempts,
                error = %message,
                "Outbox record failed permanently"
            );

            let dead_letter = DeadLetter::from_publish_exhausted(&record.event, attempts, &message);
            if let Err(e) = self.dead_letters.publish(dead_letter).await {
                error!(event_id = %record.event.id, error = %e, "Dead letter publisher failed");
            }
            return Ok(true);
        }

        let delay = delay_for_attempt(
            relay_backoff(&self.config),
            attempts,
            self.config.backoff_max(),
        );
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));

        self.store
            .record_failed_attempt(record.event.id, &message, next_attempt_at)
            .await?;
        warn!(
            event_id = %record.event.id,
            event_name = %record.event.name,
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "Publish failed, will retry"
        );
        Ok(false)
    }

    /// Run the relay until `shutdown` is raised.
    pub fn spawn(self: Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.poll_interval();
            info!(
                poll_interval_ms = interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "Outbox relay started"
            );

            loop {
                if is_shutdown(&shutdown) {
                    break;
                }

                match self.run_once().await {
                    // A full batch that made progress likely has more behind it.
                    Ok(cycle)
                        if cycle.fetched >= self.config.batch_size as usize
                            && cycle.attempted() > 0 =>
                    {
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Outbox relay cycle failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.waker.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            info!("Outbox relay stopped");
        })
    }
}
