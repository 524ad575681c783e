//! Subscription registry.
//!
//! Process-local mapping from event name to the handler identities consuming
//! it. Rebuilt at startup, never persisted.
//!
//! The registry is copy-on-write: every mutation builds a new immutable
//! `SubscriptionSnapshot` and swaps it in. Dispatches take an `Arc` to the
//! current snapshot, so each one sees a single consistent point in time
//! regardless of concurrent subscribe/unsubscribe calls.

mod catalog;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

pub use catalog::HandlerCatalog;

use crate::codec::TypeTag;

/// Errors raised while registering handlers or subscriptions.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Unknown handler: {0}")]
    UnknownHandler(HandlerId),

    #[error("Handler '{handler}' accepts '{accepts}', cannot handle '{event_name}'")]
    CapabilityMismatch {
        handler: HandlerId,
        event_name: String,
        accepts: String,
    },

    #[error("Schema conflict for '{event_name}': registered {registered}, requested {requested}")]
    SchemaConflict {
        event_name: String,
        registered: TypeTag,
        requested: TypeTag,
    },

    #[error("Handler already registered: {0}")]
    DuplicateHandler(HandlerId),
}

/// Stable identity of a handler implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Result of adding a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New pair; `first` is set when no other handler consumed the event.
    Added { first: bool },
    AlreadyPresent,
}

/// Result of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Pair removed; `last` is set when the event has no handlers left.
    Removed { last: bool },
    NotFound,
}

/// Immutable view of all subscriptions at one point in time.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSnapshot {
    by_event: HashMap<String, Vec<HandlerId>>,
}

impl SubscriptionSnapshot {
    /// Handlers for `event_name` in subscription order.
    pub fn handlers_for(&self, event_name: &str) -> &[HandlerId] {
        self.by_event
            .get(event_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, event_name: &str, handler: &HandlerId) -> bool {
        self.handlers_for(event_name).contains(handler)
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.by_event.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }
}

/// Concurrent copy-on-write registry of subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    current: RwLock<Arc<SubscriptionSnapshot>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; never changes after it is returned.
    pub fn snapshot(&self) -> Arc<SubscriptionSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Add an (event name, handler) pair. Idempotent.
    pub fn add(&self, event_name: &str, handler: &HandlerId) -> AddOutcome {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if current.contains(event_name, handler) {
            return AddOutcome::AlreadyPresent;
        }

        let mut next = SubscriptionSnapshot::clone(&current);
        let handlers = next.by_event.entry(event_name.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.push(handler.clone());
        *current = Arc::new(next);

        AddOutcome::Added { first }
    }

    /// Remove exactly the (event name, handler) pair.
    pub fn remove(&self, event_name: &str, handler: &HandlerId) -> RemoveOutcome {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !current.contains(event_name, handler) {
            return RemoveOutcome::NotFound;
        }

        let mut next = SubscriptionSnapshot::clone(&current);
        let mut last = false;
        if let Some(handlers) = next.by_event.get_mut(event_name) {
            handlers.retain(|h| h != handler);
            if handlers.is_empty() {
                next.by_event.remove(event_name);
                last = true;
            }
        }
        *current = Arc::new(next);

        RemoveOutcome::Removed { last }
    }
}
