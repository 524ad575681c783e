//! Unit of work binding outbox writes to the caller's transaction.

use tracing::debug;

use super::sql::{OutboxWriter, PoolOf, TransactionOf};
use super::Result;
use crate::event::IntegrationEvent;
use crate::outbox::RelayWaker;

/// A database transaction plus the integration events it will publish.
///
/// Domain writes go through `transaction()`; events are staged with
/// `stage()` and written to the outbox by `commit()` inside the same
/// transaction, immediately before it commits. Dropping the unit of work or
/// calling `rollback()` discards both.
pub struct UnitOfWork<DB: OutboxWriter> {
    tx: TransactionOf<DB>,
    staged: Vec<IntegrationEvent>,
    waker: Option<RelayWaker>,
}

impl<DB: OutboxWriter> UnitOfWork<DB> {
    /// Begin a new transaction on `pool`.
    pub async fn begin(pool: &PoolOf<DB>) -> Result<Self> {
        Ok(Self::from_transaction(pool.begin().await?))
    }

    /// Participate in a transaction the caller already opened.
    pub fn from_transaction(tx: TransactionOf<DB>) -> Self {
        Self {
            tx,
            staged: Vec::new(),
            waker: None,
        }
    }

    /// Wake `waker` after a successful commit that wrote events.
    pub fn with_waker(mut self, waker: RelayWaker) -> Self {
        self.waker = Some(waker);
        self
    }

    /// The underlying transaction, for the caller's own writes.
    pub fn transaction(&mut self) -> &mut TransactionOf<DB> {
        &mut self.tx
    }

    /// Queue an event for the outbox. No I/O happens until commit.
    pub fn stage(&mut self, event: IntegrationEvent) {
        self.staged.push(event);
    }

    pub fn staged(&self) -> &[IntegrationEvent] {
        &self.staged
    }

    /// Flush staged events and commit. Returns the number of events queued.
    pub async fn commit(mut self) -> Result<usize> {
        let count = self.staged.len();
        DB::write_outbox(&mut self.tx, &self.staged).await?;
        self.tx.commit().await?;

        debug!(events = count, "Unit of work committed");
        if count > 0 {
            if let Some(waker) = &self.waker {
                waker.wake();
            }
        }
        Ok(count)
    }

    /// Discard the transaction and every staged event.
    pub async fn rollback(self) -> Result<()> {
        debug!(events = self.staged.len(), "Unit of work rolled back");
        self.tx.rollback().await?;
        Ok(())
    }
}
