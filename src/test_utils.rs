//! Test utilities and mock implementations.
//!
//! Handlers that record, stall, fail or fail a fixed number of times, an in-memory
//! SQLite pool, and a polling helper for asserting on background tasks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::codec::EventSchema;
use crate::event::EventId;
use crate::handler::{HandlerError, IntegrationEventHandler, IntegrationPayload, ReceivedEvent};

/// Sample payload used across tests and the demo binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCreated {
    pub id: String,
    pub name: String,
}

impl CategoryCreated {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl IntegrationPayload for CategoryCreated {
    const EVENT_NAME: &'static str = "CategoryCreated";
}

/// Records every event it handles. Always succeeds.
pub struct RecordingHandler {
    schema: EventSchema,
    received: Arc<Mutex<Vec<Arc<ReceivedEvent>>>>,
}

impl RecordingHandler {
    pub fn new(event_name: &str) -> Self {
        Self {
            schema: EventSchema::new(event_name),
            received: Arc::default(),
        }
    }

    /// Shared view of what the handler has seen, usable after the handler
    /// moves into the bus.
    pub fn log(&self) -> HandlerLog {
        HandlerLog(self.received.clone())
    }
}

impl IntegrationEventHandler for RecordingHandler {
    fn schema(&self) -> EventSchema {
        self.schema.clone()
    }

    fn handle(&self, event: Arc<ReceivedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Box::pin(async { Ok(()) })
    }
}

/// Read side of a `RecordingHandler`.
#[derive(Clone)]
pub struct HandlerLog(Arc<Mutex<Vec<Arc<ReceivedEvent>>>>);

impl HandlerLog {
    pub fn events(&self) -> Vec<Arc<ReceivedEvent>> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.events().len()
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.events().iter().map(|e| e.id).collect()
    }
}

/// Fails the first `failures` invocations, then succeeds. `u32::MAX` means
/// it never succeeds.
pub struct FlakyHandler {
    schema: EventSchema,
    remaining: AtomicU32,
    calls: Arc<AtomicU32>,
}

impl FlakyHandler {
    pub fn new(event_name: &str, failures: u32) -> Self {
        Self {
            schema: EventSchema::new(event_name),
            remaining: AtomicU32::new(failures),
            calls: Arc::default(),
        }
    }

    /// Handler that fails on every delivery.
    pub fn always_failing(event_name: &str) -> Self {
        Self::new(event_name, u32::MAX)
    }

    /// Shared invocation counter.
    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl IntegrationEventHandler for FlakyHandler {
    fn schema(&self) -> EventSchema {
        self.schema.clone()
    }

    fn handle(&self, _event: Arc<ReceivedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();

        Box::pin(async move {
            if failed {
                Err(HandlerError::failed("simulated failure"))
            } else {
                Ok(())
            }
        })
    }
}

/// Sleeps for a fixed delay per event, then succeeds. `started` and
/// `finished` tell a completed invocation from one cut off mid-flight.
pub struct SlowHandler {
    schema: EventSchema,
    delay: Duration,
    started: Arc<AtomicU32>,
    finished: Arc<AtomicU32>,
}

impl SlowHandler {
    pub fn new(event_name: &str, delay: Duration) -> Self {
        Self {
            schema: EventSchema::new(event_name),
            delay,
            started: Arc::default(),
            finished: Arc::default(),
        }
    }

    pub fn started(&self) -> Arc<AtomicU32> {
        self.started.clone()
    }

    pub fn finished(&self) -> Arc<AtomicU32> {
        self.finished.clone()
    }
}

impl IntegrationEventHandler for SlowHandler {
    fn schema(&self) -> EventSchema {
        self.schema.clone()
    }

    fn handle(&self, _event: Arc<ReceivedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let finished = self.finished.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Single-connection in-memory SQLite pool. The database lives as long as
/// the pool.
#[cfg(feature = "sqlite")]
pub async fn sqlite_memory_pool() -> sqlx::SqlitePool {
    let config = crate::config::StorageConfig {
        url: ":memory:".to_string(),
        ..Default::default()
    };
    match crate::storage::connect_sqlite(&config).await {
        Ok(pool) => pool,
        Err(e) => panic!("in-memory sqlite unavailable: {}", e),
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
