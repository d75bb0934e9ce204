//! Secret material for the shared-key handlers.
//!
//! The [`KeyStore`] trait is the seam between handlers and wherever keys
//! live (a factotum-like agent, a file, memory). [`MemoryKeyStore`] keeps
//! keys in a `DashMap` for lock-free concurrent lookups.

use std::fmt;

use dashmap::DashMap;

use crate::styx::error::AuthError;

/// Shared secret for one user.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse hex-encoded key material as it appears in attributes.
    pub fn from_hex(text: &str) -> Result<Self, AuthError> {
        let bytes =
            hex::decode(text.trim()).map_err(|e| AuthError::invalid_attribute("key", e.to_string()))?;
        if bytes.is_empty() {
            return Err(AuthError::invalid_attribute("key", "empty key"));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([{} bytes])", self.0.len())
    }
}

/// Result of a key lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    Found(SecretKey),
    /// No key is known for the user
    Missing,
    /// The key exists but is temporarily unavailable
    Locked { retry_after: u32 },
}

/// Trait for key storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`): one store is shared
/// by every handler instance the registry creates.
pub trait KeyStore: Send + Sync {
    /// Look up the shared key for `user`.
    fn lookup(&self, user: &str) -> KeyLookup;
}

/// In-memory implementation of [`KeyStore`].
pub struct MemoryKeyStore {
    keys: DashMap<String, SecretKey>,
    locked: DashMap<String, u32>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            locked: DashMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with_key(self, user: impl Into<String>, key: SecretKey) -> Self {
        self.insert(user, key);
        self
    }

    pub fn insert(&self, user: impl Into<String>, key: SecretKey) {
        self.keys.insert(user.into(), key);
    }

    pub fn remove(&self, user: &str) -> Option<SecretKey> {
        self.keys.remove(user).map(|(_, key)| key)
    }

    /// Make lookups for `user` answer `Locked` until [`unlock`](Self::unlock).
    pub fn lock(&self, user: impl Into<String>, retry_after: u32) {
        self.locked.insert(user.into(), retry_after);
    }

    pub fn unlock(&self, user: &str) {
        self.locked.remove(user);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn lookup(&self, user: &str) -> KeyLookup {
        if let Some(retry_after) = self.locked.get(user) {
            return KeyLookup::Locked {
                retry_after: *retry_after,
            };
        }
        self.keys
            .get(user)
            .map(|key| KeyLookup::Found(key.clone()))
            .unwrap_or(KeyLookup::Missing)
    }
}
