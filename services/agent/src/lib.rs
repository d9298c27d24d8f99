//! agent: edge-side process that registers with the Master, heartbeats,
//! and executes dispatched shell commands, streaming output line-by-line
//! over the bus.

pub mod config;
pub mod executor;
pub mod identity;
pub mod runtime;
pub mod sysstat;

pub use runtime::{run, AgentError};
