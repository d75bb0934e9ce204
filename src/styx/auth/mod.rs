//! Authentication protocol handlers.
//!
//! Every protocol implements [`AuthProtocolHandler`]; the negotiation driver
//! only ever talks to that trait, so new protocols are added by registering
//! a factory rather than by touching the driver.
//!
//! # Built-in Handlers
//!
//! - [`SharedKeyHandler`]: `p9sk1` (mutual) and `p9sk2` (one-way)
//!   shared-key challenge/response
//! - [`AnyProtocolHandler`]: `p9any` envelope that picks one of the above
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use styx_auth::styx::auth::{MemoryKeyStore, SecretKey, SharedKeyHandler};
//!
//! let keys = Arc::new(MemoryKeyStore::new().with_key("alice", SecretKey::new(b"k".to_vec())));
//! let mut handler = SharedKeyHandler::p9sk1(keys);
//! handler.init(Some(Identity::new("alice", "p9sk1")), Role::Client);
//! ```

mod any;
mod keystore;
mod lifecycle;
mod shared_key;
#[cfg(test)]
pub(crate) mod testing;
mod traits;

pub use any::{ANY_PROTOCOL, AnyProtocolHandler};
pub use keystore::{KeyLookup, KeyStore, MemoryKeyStore, SecretKey};
pub use shared_key::{DEFAULT_SERVER_NAME, SharedKeyHandler, SharedKeyVariant};
pub use traits::AuthProtocolHandler;
