//! Name-to-factory lookup for protocol handlers.
//!
//! Provides lock-free concurrent access via `DashMap`. A registry is shared
//! read-only (behind an `Arc`) by every negotiation; each negotiation asks
//! it for fresh handler instances.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::styx::auth::{
    ANY_PROTOCOL, AnyProtocolHandler, AuthProtocolHandler, KeyStore, SharedKeyHandler,
    SharedKeyVariant,
};
use crate::styx::error::AuthError;

/// Builds a fresh, uninitialized handler.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn AuthProtocolHandler> + Send + Sync>;

/// Registry of protocol handler factories keyed by protocol name.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: DashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `p9sk1`, `p9sk2` and a `p9any` envelope offering both.
    pub fn with_defaults(keys: Arc<dyn KeyStore>) -> Self {
        let registry = Self::new();
        for variant in [SharedKeyVariant::P9sk1, SharedKeyVariant::P9sk2] {
            let keys = keys.clone();
            registry.register(variant.name(), move || {
                Box::new(SharedKeyHandler::new(variant, keys.clone()))
            });
        }
        registry.register(ANY_PROTOCOL, || {
            Box::new(AnyProtocolHandler::new([
                SharedKeyVariant::P9sk1.name(),
                SharedKeyVariant::P9sk2.name(),
            ]))
        });
        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    ///
    /// Returns `true` if the name was not registered before.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> Box<dyn AuthProtocolHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registering handler factory for {}", name);
        self.factories.insert(name, Arc::new(factory)).is_none()
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered protocol names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Create a fresh handler for `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn AuthProtocolHandler>, AuthError> {
        // clone the factory out so the shard lock is not held while it runs
        let factory = self
            .factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AuthError::UnknownProtocol(name.to_string()))?;

        let handler = factory();
        if handler.protocol_name() != name {
            return Err(AuthError::RegistryMismatch {
                registered: name.to_string(),
                produced: handler.protocol_name().to_string(),
            });
        }
        Ok(handler)
    }
}
