//! Authentication negotiation for 9P/Styx file services.
//!
//! This module is organized into the following submodules:
//!
//! - `identity`: Identity and credential value types
//! - `blob`: Bounded buffer passed between driver and handler
//! - `mode`: Processing modes and roles
//! - `error`: Fault type and retry classification
//! - `config`: Setting resolution and configuration attributes
//! - `channel`: Raw channel, exclusive leases and framed blob links
//! - `auth`: Protocol handler trait and built-in handlers
//! - `registry`: Protocol name to handler factory lookup
//! - `negotiate`: The negotiation driver
//! - `takeover`: Direct channel takeover (feature-gated)

pub mod auth;
pub mod blob;
pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod mode;
pub mod negotiate;
pub mod registry;
#[cfg(feature = "takeover")]
pub(crate) mod takeover;
pub(crate) mod wire;

pub use blob::Blob;
pub use error::AuthError;
pub use identity::{Credential, CredentialSummary, Identity};
pub use mode::{ProcessingMode, Role};
pub use negotiate::{NegotiationOutcome, Negotiator};
