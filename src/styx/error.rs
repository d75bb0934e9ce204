//! Communication and configuration faults.
//!
//! Negotiation outcomes such as FAILED or NO_IDENTITY are *not* errors: they
//! are ordinary values of [`ProcessingMode`](super::ProcessingMode) and
//! [`NegotiationOutcome`](super::negotiate::NegotiationOutcome). This module
//! covers the other channel: broken transports, unparsable peer data, bad
//! configuration and registry problems. Any of these terminates the current
//! negotiation attempt immediately.
//!
//! # Retry Classification
//!
//! [`AuthError::is_retryable`] splits faults into two groups:
//!
//! 1. **Transient (retryable)**: the transport broke or timed out. A fresh
//!    attempt on a fresh connection may succeed.
//! 2. **Permanent (not retryable)**: the peer sent garbage, the
//!    configuration is wrong, or delegation is misconfigured. Retrying would
//!    fail the same way.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Fault raised by a handler or the negotiation driver.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("channel closed by peer")]
    ChannelClosed,

    #[error("channel is already taken over by another handler")]
    ChannelBusy,

    #[error("malformed peer data: {reason}")]
    Malformed { reason: String },

    #[error("frame of {len} bytes exceeds blob capacity {capacity}")]
    FrameTooLarge { len: usize, capacity: usize },

    #[error("missing required attribute '{0}'")]
    MissingAttribute(String),

    #[error("invalid attribute '{name}': {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("no handler registered for protocol '{0}'")]
    UnknownProtocol(String),

    #[error("handler '{0}' delegated to itself")]
    SelfDelegation(String),

    #[error("delegation cycle: {}", .chain.join(" -> "))]
    DelegationCycle { chain: Vec<String> },

    #[error("more than {max} delegations: {}", .chain.join(" -> "))]
    TooManyDelegations { max: usize, chain: Vec<String> },

    #[error("handler '{protocol}' cannot mix channel takeover with blob exchange")]
    MixedExchange { protocol: String },

    #[error("factory for '{registered}' produced handler '{produced}'")]
    RegistryMismatch {
        registered: String,
        produced: String,
    },

    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),

    #[error("negotiation cancelled")]
    Cancelled,
}

impl AuthError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        AuthError::Malformed {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_attribute(name: impl Into<String>, reason: impl Into<String>) -> Self {
        AuthError::InvalidAttribute {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether a fresh attempt on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Io(e) => is_transient_io(e.kind()),
            AuthError::ChannelClosed | AuthError::Timeout(_) => true,
            AuthError::ChannelBusy
            | AuthError::Malformed { .. }
            | AuthError::FrameTooLarge { .. }
            | AuthError::MissingAttribute(_)
            | AuthError::InvalidAttribute { .. }
            | AuthError::UnknownProtocol(_)
            | AuthError::SelfDelegation(_)
            | AuthError::DelegationCycle { .. }
            | AuthError::TooManyDelegations { .. }
            | AuthError::MixedExchange { .. }
            | AuthError::RegistryMismatch { .. }
            | AuthError::Cancelled => false,
        }
    }
}

/// I/O error kinds that indicate a transient transport failure.
const TRANSIENT_IO_KINDS: &[io::ErrorKind] = &[
    io::ErrorKind::ConnectionRefused,
    io::ErrorKind::ConnectionReset,
    io::ErrorKind::ConnectionAborted,
    io::ErrorKind::NotConnected,
    io::ErrorKind::BrokenPipe,
    io::ErrorKind::TimedOut,
    io::ErrorKind::Interrupted,
    io::ErrorKind::UnexpectedEof,
    io::ErrorKind::WouldBlock,
];

fn is_transient_io(kind: io::ErrorKind) -> bool {
    TRANSIENT_IO_KINDS.contains(&kind)
}
