//! Direct channel takeover for single-protocol sessions.
//!
//! # Architecture
//!
//! 1. **Lease**: the driver leases the [`SharedChannel`] exclusively and
//!    hands it to the handler's `process`. A second concurrent takeover of
//!    the same channel fails fast with [`AuthError::ChannelBusy`]. The lease
//!    is held across `Wait` pauses, which the driver honors on its clock
//!    before calling `process` again, and dropped once the handler stops,
//!    on success and on error.
//!
//! 2. **Fallback**: a handler that answers NOT_SUPPORTED is discarded and a
//!    *fresh* handler for the same protocol runs the ordinary blob loop over
//!    a framed link on the same channel. The peer must be running the blob
//!    loop (or its own takeover) for the same protocol.
//!
//! # Feature Gate
//!
//! This module is only compiled when the `takeover` feature is enabled.

use tracing::{debug, info};

use crate::styx::channel::{Channel, FramedLink, SharedChannel};
use crate::styx::error::AuthError;
use crate::styx::identity::Identity;
use crate::styx::mode::{ProcessingMode, Role};
use crate::styx::negotiate::{NegotiationOutcome, Negotiator, Start, conclude};

impl Negotiator {
    /// Negotiate `protocol` by letting the handler own `channel`.
    ///
    /// # Returns
    ///
    /// * `Ok(outcome)` - The handler (or its blob-loop fallback) finished
    /// * `Err(AuthError::ChannelBusy)` - Another component holds the channel
    /// * `Err(..)` - Any other communication or delegation fault
    pub async fn negotiate_direct<C: Channel>(
        &self,
        protocol: &str,
        identity: Option<Identity>,
        role: Role,
        channel: &SharedChannel<C>,
    ) -> Result<NegotiationOutcome, AuthError> {
        self.guarded(
            protocol,
            self.run_direct(protocol, identity, role, channel),
        )
        .await
    }

    async fn run_direct<C: Channel>(
        &self,
        protocol: &str,
        identity: Option<Identity>,
        role: Role,
        channel: &SharedChannel<C>,
    ) -> Result<NegotiationOutcome, AuthError> {
        let start = Start::Live {
            identity: identity.clone(),
            role,
        };
        let (mut handler, ready) = self.prepare(protocol, &start)?;
        if !ready {
            return Ok(conclude(handler.as_ref(), ProcessingMode::NoIdentity));
        }

        let mode = {
            let mut lease = channel.lease()?;
            loop {
                match handler.process(&mut *lease).await? {
                    ProcessingMode::Wait { seconds } => self.pause(protocol, seconds).await,
                    mode => break mode,
                }
            }
        };
        debug!("{} takeover returned {}", protocol, mode);

        let chain = vec![protocol.to_string()];
        match mode {
            ProcessingMode::NotSupported => {
                info!(
                    "{} cannot take over the channel, falling back to blob exchange",
                    protocol
                );
                let (fresh, ready) = self.prepare(protocol, &start)?;
                if !ready {
                    return Ok(conclude(fresh.as_ref(), ProcessingMode::NoIdentity));
                }
                let mut lease = channel.lease()?;
                let mut link = FramedLink::new(&mut *lease);
                self.run_chain(fresh, chain, None, &mut link).await
            }
            ProcessingMode::Delegated => {
                let mut lease = channel.lease()?;
                let mut link = FramedLink::new(&mut *lease);
                self.run_chain(handler, chain, Some(mode), &mut link).await
            }
            other => Ok(conclude(handler.as_ref(), other)),
        }
    }
}
