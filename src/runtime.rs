//! Process-scoped bus runtime.
//!
//! Owns everything one service instance needs: the facade, the outbox and
//! inbox stores, the relay task and the consumer tasks. Built once at
//! startup, passed explicitly, and drained at shutdown.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{BrokerTransport, Result};
use crate::config::Config;
use crate::dlq::{DeadLetterPublisher, TracingDeadLetterPublisher};
use crate::facade::EventBus;
use crate::storage::sql::{OutboxWriter, PoolOf, SqlInboxStore, SqlOutboxStore};
use crate::storage::{InboxStore, OutboxStore, UnitOfWork};

/// Bus, stores and background tasks of one service instance.
pub struct BusRuntime<DB: OutboxWriter> {
    config: Config,
    pool: PoolOf<DB>,
    bus: Arc<EventBus>,
    outbox: Arc<SqlOutboxStore<DB>>,
    inbox: Arc<SqlInboxStore<DB>>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<DB> BusRuntime<DB>
where
    DB: OutboxWriter,
    SqlOutboxStore<DB>: OutboxStore,
    SqlInboxStore<DB>: InboxStore,
{
    /// Validate `config` and create the outbox and inbox tables if missing.
    ///
    /// Nothing runs until `start()`.
    pub async fn new(
        config: Config,
        pool: PoolOf<DB>,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let outbox = Arc::new(SqlOutboxStore::<DB>::new(pool.clone()));
        let inbox = Arc::new(SqlInboxStore::<DB>::new(pool.clone()));
        outbox.init_schema().await?;
        inbox.init_schema().await?;

        let bus = Arc::new(EventBus::new(transport, config.dispatch.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            pool,
            bus,
            outbox,
            inbox,
            dead_letters: Arc::new(TracingDeadLetterPublisher),
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Send dead letters to `publisher` instead of the log.
    pub fn with_dead_letter_publisher(mut self, publisher: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dead_letters = publisher;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn pool(&self) -> &PoolOf<DB> {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn outbox_store(&self) -> &Arc<SqlOutboxStore<DB>> {
        &self.outbox
    }

    pub fn inbox_store(&self) -> &Arc<SqlInboxStore<DB>> {
        &self.inbox
    }

    /// Begin a unit of work whose commit wakes the relay.
    pub async fn begin(&self) -> Result<UnitOfWork<DB>> {
        self.bus.begin::<DB>(&self.pool).await
    }

    pub fn is_started(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn the outbox relay and the consumption channels.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        let relay = Arc::new(self.bus.relay(
            self.outbox.clone(),
            self.dead_letters.clone(),
            self.config.outbox.clone(),
        ));
        self.tasks.push(relay.spawn(self.shutdown.subscribe()));

        let dispatcher = Arc::new(
            self.bus
                .dispatcher(self.inbox.clone(), self.dead_letters.clone()),
        );
        let consumers = self
            .bus
            .transport()
            .start_consuming(dispatcher, self.shutdown.subscribe())
            .await?;
        self.tasks.extend(consumers);

        info!(
            queue = %self.config.service.queue_name,
            tasks = self.tasks.len(),
            "Bus runtime started"
        );
        Ok(())
    }

    /// Stop intake and drain.
    ///
    /// Consumers finish the delivery in hand and the relay its current
    /// cycle, within `shutdown_grace`; whatever is still running afterwards
    /// is aborted. Unsettled deliveries return to the broker.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.config.dispatch.shutdown_grace();

        match tokio::time::timeout(grace, join_all(tasks)).await {
            Ok(_) => info!("Bus runtime stopped"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Shutdown grace elapsed, aborting remaining tasks"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(feature = "sqlite")]
impl BusRuntime<crate::storage::sql::sqlite::Sqlite> {
    /// Connect SQLite storage and the configured transport.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = crate::utils::bootstrap::connect_with_retry("storage", || {
            crate::storage::connect_sqlite(&config.storage)
        })
        .await?;
        let transport =
            crate::bus::init_transport(&config.messaging, &config.service.queue_name).await?;
        Self::new(config, pool, transport).await
    }
}

#[cfg(feature = "postgres")]
impl BusRuntime<crate::storage::sql::postgres::Postgres> {
    /// Connect PostgreSQL storage and the configured transport.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = crate::utils::bootstrap::connect_with_retry("storage", || {
            crate::storage::connect_postgres(&config.storage)
        })
        .await?;
        let transport =
            crate::bus::init_transport(&config.messaging, &config.service.queue_name).await?;
        Self::new(config, pool, transport).await
    }
}
