//! Processing outcomes returned by handler operations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Result of a single handler processing call.
///
/// Each call returns exactly one of these; the driver maps it to its next
/// action. `Wait` carries its delay explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// No usable identity is bound
    NoIdentity,
    /// The handler cannot take over a channel directly
    NotSupported,
    /// Authentication conclusively failed (see `info()`)
    Failed,
    /// Authentication conclusively succeeded
    Success,
    /// More peer data is required before progress can be made
    NeedData,
    /// Outbound data is ready for `get_data_for_peer`
    PendingData,
    /// Progress was made; invoke the same operation again
    Continue,
    /// Retry the same operation after `seconds` have elapsed
    Wait { seconds: u32 },
    /// Data exchange is complete without an outcome yet
    NoMoreData,
    /// The handler named by `info()` must continue the negotiation
    Delegated,
}

impl ProcessingMode {
    /// Whether this mode ends the handler's involvement.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingMode::Success
                | ProcessingMode::Failed
                | ProcessingMode::NotSupported
                | ProcessingMode::NoIdentity
        )
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::NoIdentity => write!(f, "no_identity"),
            ProcessingMode::NotSupported => write!(f, "not_supported"),
            ProcessingMode::Failed => write!(f, "failed"),
            ProcessingMode::Success => write!(f, "success"),
            ProcessingMode::NeedData => write!(f, "need_data"),
            ProcessingMode::PendingData => write!(f, "pending_data"),
            ProcessingMode::Continue => write!(f, "continue"),
            ProcessingMode::Wait { seconds } => write!(f, "wait({}s)", seconds),
            ProcessingMode::NoMoreData => write!(f, "no_more_data"),
            ProcessingMode::Delegated => write!(f, "delegated"),
        }
    }
}

/// Which side of the handshake a handler plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The initiating party
    Client,
    /// The responding party
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}
