//! Porthole tunnel agent
//!
//! Runs next to a local service, holds the single outbound relay
//! connection, and forwards relayed HTTP requests and WebSocket sessions
//! against the local service.

pub mod config;
pub mod forwarder;
pub mod rewriter;
pub mod sessions;
pub mod tunnel;

pub use config::AgentConfig;
pub use tunnel::{AgentError, TunnelAgent};
