//! Authentication protocol handler trait definition.
//!
//! Defines the capability set every protocol handler exposes to the
//! negotiation driver, enabling new protocols to be registered by name
//! without touching the driver.

use async_trait::async_trait;

use crate::styx::blob::Blob;
use crate::styx::channel::Channel;
use crate::styx::config::Attributes;
use crate::styx::error::AuthError;
use crate::styx::identity::{Credential, Identity};
use crate::styx::mode::{ProcessingMode, Role};

/// Trait for authentication protocol handlers.
///
/// One instance drives exactly one authentication attempt for one protocol,
/// as client or server. Instances are never reused across negotiations and
/// are owned by a single negotiation, so methods take `&mut self`.
///
/// # Lifecycle
///
/// 1. Exactly one of [`init`](Self::init) or
///    [`init_from_config`](Self::init_from_config) is called.
/// 2. Either [`process`](Self::process) (channel takeover) or the blob pair
///    [`get_data_for_peer`](Self::get_data_for_peer) /
///    [`handle_peer_data`](Self::handle_peer_data) is used, never both.
/// 3. Calls stop at a terminal mode or `Delegated`.
///
/// A handler whose initialization failed answers every processing call with
/// [`ProcessingMode::NoIdentity`].
#[async_trait]
pub trait AuthProtocolHandler: Send {
    /// Stable protocol name used for registry lookup (e.g. `p9sk1`).
    fn protocol_name(&self) -> &str;

    /// Prepare a live handshake.
    ///
    /// # Returns
    ///
    /// * `true` - Ready for processing calls
    /// * `false` - Identity incompatible with the protocol or secret
    ///   material unavailable; `info()` explains why
    fn init(&mut self, identity: Option<Identity>, role: Role) -> bool;

    /// Prepare from configuration attributes, without any network exchange.
    ///
    /// Returns `false` when required attributes are missing or malformed.
    fn init_from_config(&mut self, attributes: &Attributes) -> bool;

    /// Bound identity: our own, or the peer's once negotiated.
    fn identity(&self) -> Option<&Identity>;

    /// The peer's credential; `Some` iff the last terminal mode was SUCCESS.
    fn peer_credential(&self) -> Option<&Credential>;

    /// Failure diagnostic after FAILED, successor protocol after DELEGATED.
    fn info(&self) -> Option<&str>;

    /// Role chosen at initialization.
    fn role(&self) -> Option<Role>;

    /// Take over the channel until a terminal mode is reached.
    ///
    /// The caller holds an exclusive lease for the duration of the call.
    /// A returned `Wait` is honored by the caller, which then calls
    /// `process` again on the same channel. Handlers that cannot speak
    /// directly return [`ProcessingMode::NotSupported`].
    async fn process(&mut self, channel: &mut dyn Channel) -> Result<ProcessingMode, AuthError>;

    /// Fill `blob` with the next chunk of outbound handshake data.
    ///
    /// An empty blob on return means there is nothing to send.
    fn get_data_for_peer(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError>;

    /// Consume the unread bytes of `blob`, which came from the peer.
    fn handle_peer_data(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError>;
}
