//! Payload serializer.
//!
//! Converts event payloads to JSON bytes plus a type tag, and back. The tag
//! names the payload schema (`{event_name}/v{version}`) so a consumer can
//! refuse payloads it has no schema for instead of guessing.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::Serialize;
use tracing::debug;

use crate::subscription::RegistrationError;

/// Errors raised while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(TypeTag),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serializer tag identifying a payload schema on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(String);

impl TypeTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload shape accepted for a logical event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSchema {
    pub event_name: String,
    pub version: u32,
}

impl EventSchema {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            version: 1,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn type_tag(&self) -> TypeTag {
        TypeTag(format!("{}/v{}", self.event_name, self.version))
    }
}

/// JSON codec with a registry of known schemas.
#[derive(Default)]
pub struct EventCodec {
    schemas: RwLock<HashMap<String, EventSchema>>,
}

impl EventCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema.
    ///
    /// Re-registering an identical schema is a no-op; registering a different
    /// version for a known event name is rejected.
    pub fn register(&self, schema: EventSchema) -> Result<(), RegistrationError> {
        let mut schemas = self
            .schemas
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match schemas.get(&schema.event_name) {
            Some(existing) if *existing == schema => Ok(()),
            Some(existing) => Err(RegistrationError::SchemaConflict {
                event_name: schema.event_name.clone(),
                registered: existing.type_tag(),
                requested: schema.type_tag(),
            }),
            None => {
                debug!(type_tag = %schema.type_tag(), "Registered event schema");
                schemas.insert(schema.event_name.clone(), schema);
                Ok(())
            }
        }
    }

    /// Schema currently registered for `event_name`, if any.
    pub fn schema_for(&self, event_name: &str) -> Option<EventSchema> {
        self.schemas
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event_name)
            .cloned()
    }

    /// Encode a payload for `event_name`.
    ///
    /// Unregistered names encode as version 1.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        event_name: &str,
        data: &T,
    ) -> Result<(Vec<u8>, TypeTag), CodecError> {
        let schema = self
            .schema_for(event_name)
            .unwrap_or_else(|| EventSchema::new(event_name));
        let bytes = serde_json::to_vec(data)?;
        Ok((bytes, schema.type_tag()))
    }

    /// Decode a payload previously produced by `encode`.
    pub fn decode(&self, type_tag: &TypeTag, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        let known = self
            .schemas
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .any(|schema| schema.type_tag() == *type_tag);

        if !known {
            return Err(CodecError::UnknownEventType(type_tag.clone()));
        }

        Ok(serde_json::from_slice(bytes)?)
    }
}
