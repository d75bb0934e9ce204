//! Lifecycle bookkeeping shared by the built-in handlers.
//!
//! [`HandlerCore`] owns the parts of a handler that every protocol has in
//! common (identity, credential, info string, role and lifecycle state) and
//! enforces the invariants around them:
//!
//! - the credential is `Some` only while the last terminal mode is SUCCESS;
//! - a handler that was never initialized answers NO_IDENTITY;
//! - channel takeover and blob exchange never mix on one instance;
//! - a fault wipes the credential before it propagates.

use tracing::debug;

use crate::styx::error::AuthError;
use crate::styx::identity::{Credential, Identity};
use crate::styx::mode::{ProcessingMode, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Uninit,
    Initialized,
    Exchanging,
    /// Terminal or delegated; repeated calls return the same mode.
    Finished(ProcessingMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeKind {
    Takeover,
    Blob,
}

/// What to do once queued outbound data has been fully written.
#[derive(Debug)]
pub(crate) enum Settle {
    /// Wait for the peer's answer.
    Await,
    Succeed(Credential),
    Fail(String),
    Delegate(String),
}

#[derive(Debug)]
pub(crate) struct HandlerCore {
    protocol: &'static str,
    role: Option<Role>,
    identity: Option<Identity>,
    credential: Option<Credential>,
    info: Option<String>,
    lifecycle: Lifecycle,
    exchange: Option<ExchangeKind>,
}

impl HandlerCore {
    pub(crate) fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            role: None,
            identity: None,
            credential: None,
            info: None,
            lifecycle: Lifecycle::Uninit,
            exchange: None,
        }
    }

    pub(crate) fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub(crate) fn role(&self) -> Option<Role> {
        self.role
    }

    pub(crate) fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub(crate) fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub(crate) fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Record a successful initialization.
    pub(crate) fn bind(&mut self, identity: Option<Identity>, role: Role) {
        debug!(
            "{} handler initialized as {} with identity {:?}",
            self.protocol,
            role,
            identity.as_ref().map(|i| i.to_string())
        );
        self.identity = identity;
        self.role = Some(role);
        self.credential = None;
        self.info = None;
        self.lifecycle = Lifecycle::Initialized;
    }

    /// Record a failed initialization. Always returns `false`.
    pub(crate) fn reject_init(&mut self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        debug!("{} handler initialization failed: {}", self.protocol, reason);
        self.identity = None;
        self.role = None;
        self.credential = None;
        self.info = Some(reason);
        self.lifecycle = Lifecycle::Uninit;
        false
    }

    /// Replace the bound identity with the peer-negotiated one.
    pub(crate) fn adopt_peer_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// Gate a processing call.
    ///
    /// Returns `Ok(Some(mode))` when the call must short-circuit with `mode`,
    /// `Ok(None)` when the handler should proceed, and an error when the
    /// caller mixes exchange kinds.
    pub(crate) fn enter(&mut self, kind: ExchangeKind) -> Result<Option<ProcessingMode>, AuthError> {
        if self.lifecycle == Lifecycle::Uninit {
            return Ok(Some(ProcessingMode::NoIdentity));
        }

        match self.exchange {
            Some(current) if current != kind => {
                self.credential = None;
                return Err(AuthError::MixedExchange {
                    protocol: self.protocol.to_string(),
                });
            }
            _ => self.exchange = Some(kind),
        }

        match self.lifecycle {
            Lifecycle::Finished(mode) => Ok(Some(mode)),
            Lifecycle::Uninit | Lifecycle::Initialized | Lifecycle::Exchanging => {
                self.lifecycle = Lifecycle::Exchanging;
                Ok(None)
            }
        }
    }

    /// Pass a processing result through, wiping state on faults.
    pub(crate) fn settle(
        &mut self,
        result: Result<ProcessingMode, AuthError>,
    ) -> Result<ProcessingMode, AuthError> {
        if let Err(e) = &result {
            debug!("{} handler fault: {}", self.protocol, e);
            self.credential = None;
            self.info = Some(e.to_string());
            self.lifecycle = Lifecycle::Finished(ProcessingMode::Failed);
        }
        result
    }

    /// Apply the outcome queued behind an outbound message.
    pub(crate) fn apply(&mut self, settle: Settle) -> ProcessingMode {
        match settle {
            Settle::Await => ProcessingMode::NeedData,
            Settle::Succeed(credential) => self.succeed(credential),
            Settle::Fail(reason) => self.fail(reason),
            Settle::Delegate(successor) => self.delegate(successor),
        }
    }

    pub(crate) fn succeed(&mut self, credential: Credential) -> ProcessingMode {
        debug!(
            "{} handler authenticated peer {}",
            self.protocol,
            credential.peer()
        );
        self.credential = Some(credential);
        self.info = None;
        self.finish(ProcessingMode::Success)
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) -> ProcessingMode {
        let reason = reason.into();
        debug!("{} handler failed: {}", self.protocol, reason);
        self.credential = None;
        self.info = Some(reason);
        self.finish(ProcessingMode::Failed)
    }

    pub(crate) fn delegate(&mut self, successor: impl Into<String>) -> ProcessingMode {
        let successor = successor.into();
        debug!("{} handler delegating to {}", self.protocol, successor);
        self.credential = None;
        self.info = Some(successor);
        self.finish(ProcessingMode::Delegated)
    }

    pub(crate) fn not_supported(&mut self) -> ProcessingMode {
        self.credential = None;
        self.finish(ProcessingMode::NotSupported)
    }

    fn finish(&mut self, mode: ProcessingMode) -> ProcessingMode {
        self.lifecycle = Lifecycle::Finished(mode);
        mode
    }
}
