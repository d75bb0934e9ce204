//! Identity and credential value types.
//!
//! An [`Identity`] names a principal and the authentication protocol it is
//! scoped to. A [`Credential`] is the opaque result of a successful
//! authentication and is only ever created by a handler on SUCCESS.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named credential-holder tagged with the protocol it belongs to.
///
/// Identities are immutable. Delegation to another protocol produces a new
/// value via [`Identity::rescoped`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    name: String,
    auth_protocol: String,
}

impl Identity {
    /// Create a new identity for `name` under `auth_protocol`.
    pub fn new(name: impl Into<String>, auth_protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auth_protocol: auth_protocol.into(),
        }
    }

    /// The principal's display/lookup name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The protocol this identity is scoped to (e.g. `p9sk1`).
    pub fn auth_protocol(&self) -> &str {
        &self.auth_protocol
    }

    /// Same principal, scoped to another protocol.
    pub fn rescoped(&self, auth_protocol: impl Into<String>) -> Self {
        Self {
            name: self.name.clone(),
            auth_protocol: auth_protocol.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.auth_protocol)
    }
}

/// Proof that a peer's identity was verified by a handler.
///
/// The session key derived during the handshake is kept private and is
/// never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    peer: String,
    auth_protocol: String,
    established_at: DateTime<Utc>,
    session_key: Vec<u8>,
}

impl Credential {
    pub fn new(
        peer: impl Into<String>,
        auth_protocol: impl Into<String>,
        session_key: Vec<u8>,
    ) -> Self {
        Self {
            peer: peer.into(),
            auth_protocol: auth_protocol.into(),
            established_at: Utc::now(),
            session_key,
        }
    }

    /// Name of the authenticated peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Protocol that produced this credential.
    pub fn auth_protocol(&self) -> &str {
        &self.auth_protocol
    }

    /// When the handshake completed.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Key material shared with the peer, for the session layer.
    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    /// Serializable view without key material.
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            peer: self.peer.clone(),
            auth_protocol: self.auth_protocol.clone(),
            established_at: self.established_at.to_rfc3339(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("peer", &self.peer)
            .field("auth_protocol", &self.auth_protocol)
            .field("established_at", &self.established_at)
            .field("session_key", &"[redacted]")
            .finish()
    }
}

/// Public metadata of a [`Credential`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub peer: String,
    pub auth_protocol: String,
    /// RFC3339 timestamp
    pub established_at: String,
}
