//! Pluggable authentication-protocol negotiation for 9P/Styx file services.

pub mod styx;
