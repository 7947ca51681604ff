//! agent-relay server: runs a coding agent per prompt and streams its output as chat records.

pub mod cli;
pub mod router;
pub mod runtime;
pub mod store;
pub mod transport;
