//! Capability lookup from handler identity to implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::{HandlerId, RegistrationError};
use crate::handler::IntegrationEventHandler;

/// Handlers known to this process, keyed by identity.
///
/// Populated at startup; subscriptions refer to handlers by `HandlerId` and
/// are resolved through the catalog at subscribe and dispatch time.
#[derive(Default)]
pub struct HandlerCatalog {
    handlers: RwLock<HashMap<HandlerId, Arc<dyn IntegrationEventHandler>>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler under `id`. Identities are unique per process.
    pub fn register(
        &self,
        id: HandlerId,
        handler: Arc<dyn IntegrationEventHandler>,
    ) -> Result<(), RegistrationError> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if handlers.contains_key(&id) {
            return Err(RegistrationError::DuplicateHandler(id));
        }

        debug!(handler = %id, schema = %handler.schema().type_tag(), "Registered handler");
        handlers.insert(id, handler);
        Ok(())
    }

    pub fn resolve(&self, id: &HandlerId) -> Option<Arc<dyn IntegrationEventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
