//! Relaybus - integration event bus
//!
//! Reliable asynchronous communication between services that each own
//! their database. Events are written to a transactional outbox together
//! with the business change, relayed to a broker with retry and backoff,
//! and dispatched to subscribed handlers behind an idempotent inbox.
//! Deliveries that can never succeed end up as dead letters.

pub mod bus;
pub mod codec;
pub mod config;
pub mod dlq;
pub mod event;
pub mod facade;
pub mod handler;
pub mod outbox;
pub mod runtime;
pub mod storage;
pub mod subscription;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{BrokerTransport, BusError, DispatchOutcome, Dispatcher};
pub use codec::{EventCodec, EventSchema, TypeTag};
pub use config::Config;
pub use dlq::{DeadLetter, DeadLetterPublisher};
pub use event::{EventId, IntegrationEvent};
pub use facade::EventBus;
pub use handler::{
    FnHandler, HandlerError, IntegrationEventHandler, IntegrationPayload, ReceivedEvent,
};
pub use outbox::{OutboxRelay, RelayWaker};
pub use runtime::BusRuntime;
pub use storage::UnitOfWork;
pub use subscription::HandlerId;
