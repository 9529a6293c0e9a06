//! Tunnel client registry
//!
//! Process-wide table mapping a public client identifier to its single
//! active relay connection. Constructed explicitly and handed to the
//! server, so tests can build a fresh one per case.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use porthole_proto::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pending::{PendingRequests, RelayedResponse, SessionEvent};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tunnel id already registered: {0}")]
    DuplicateId(String),

    #[error("Tunnel connection closed")]
    ConnectionClosed,

    #[error("Frame encoding failed: {0}")]
    Codec(#[from] porthole_proto::CodecError),
}

/// One registered agent connection
///
/// Owns the outbound frame channel into the connection's writer task plus
/// the correlation state for everything in flight on this tunnel.
#[derive(Debug)]
pub struct TunnelClient {
    id: String,
    frames: mpsc::Sender<Bytes>,
    pub pending: PendingRequests,
}

impl TunnelClient {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Encode and queue one frame for the agent
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), RegistryError> {
        let encoded = frame.encode()?;
        self.frames
            .send(encoded)
            .await
            .map_err(|_| RegistryError::ConnectionClosed)
    }
}

/// Server-side table of active tunnel clients, one connection per id
pub struct ClientRegistry {
    clients: DashMap<String, Arc<TunnelClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new tunnel client.
    ///
    /// Rejects when the id already has a live entry: the existing
    /// connection is left untouched and the caller must close the new one.
    pub fn register(
        &self,
        id: String,
        frames: mpsc::Sender<Bytes>,
    ) -> Result<Arc<TunnelClient>, RegistryError> {
        match self.clients.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(client_id = %id, "Rejected duplicate tunnel registration");
                Err(RegistryError::DuplicateId(id))
            }
            Entry::Vacant(entry) => {
                let client = Arc::new(TunnelClient {
                    id: id.clone(),
                    frames,
                    pending: PendingRequests::new(),
                });
                entry.insert(client.clone());
                info!(client_id = %id, "Tunnel client registered");
                Ok(client)
            }
        }
    }

    /// Client for a public identifier, if connected
    pub fn lookup(&self, id: &str) -> Option<Arc<TunnelClient>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a client and resolve everything still pending on it.
    ///
    /// Every pending HTTP request gets the fixed disconnect response,
    /// exactly once; every open session is told to close.
    pub fn unregister(&self, id: &str) {
        let Some((_, client)) = self.clients.remove(id) else {
            debug!(client_id = %id, "Unregister for unknown tunnel id");
            return;
        };

        let (sinks, handles) = client.pending.drain();
        info!(
            client_id = %id,
            pending_http = sinks.len(),
            open_sessions = handles.len(),
            "Tunnel client disconnected"
        );

        for sink in sinks {
            let _ = sink.send(RelayedResponse::disconnected());
        }
        for handle in handles {
            let _ = handle.send(SessionEvent::Close);
        }
    }

    /// Number of connected clients
    pub fn count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
