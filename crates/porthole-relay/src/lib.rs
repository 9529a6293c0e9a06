//! Porthole relay server
//!
//! The public-facing half of the tunnel: accepts agent registrations on one
//! endpoint and relays public HTTP requests and WebSocket sessions addressed
//! to `/<clientId>/...` over each agent's single persistent connection.

pub mod pending;
pub mod registry;
pub mod server;

pub use pending::{PendingRequests, RelayedResponse, SessionEvent};
pub use registry::{ClientRegistry, RegistryError, TunnelClient};
pub use server::{router, RelayConfig, RelayServer, RelayServerError};

/// Fixed body for requests addressed to an unregistered client identifier
pub const TUNNEL_NOT_ACTIVE: &str = "Tunnel not active";

/// Fixed body resolving requests orphaned by a tunnel disconnect
pub const TUNNEL_DISCONNECTED: &str = "Tunnel client disconnected.";
