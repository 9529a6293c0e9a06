//! Tunnel connection and frame dispatch
//!
//! Holds the one outbound relay connection: a writer task drains the frame
//! queue shared by every in-flight forward, while the read loop decodes
//! inbound frames and hands each to a request-scoped task. No single slow
//! local call or session ever blocks the others.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use porthole_proto::{Frame, TunnelMessage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::AgentConfig;
use crate::forwarder::{self, ForwardedRequest};
use crate::sessions::{self, SessionCommand, SessionMap};

/// Outbound frame queue depth for the tunnel connection
const FRAME_QUEUE_DEPTH: usize = 256;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect to relay {url}: {source}")]
    ConnectFailed {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("Tunnel connection closed by relay")]
    ConnectionClosed,
}

/// The local agent: one relay connection, many relayed requests
pub struct TunnelAgent {
    config: Arc<AgentConfig>,
    http: reqwest::Client,
    sessions: SessionMap,
}

impl TunnelAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Connect to the relay and serve frames until the connection closes
    pub async fn run(&self) -> Result<(), AgentError> {
        let url = format!(
            "{}?id={}",
            self.config.server_url.trim_end_matches('/'),
            self.config.client_id
        );

        let (socket, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| AgentError::ConnectFailed {
                    url: url.clone(),
                    source: e,
                })?;

        info!(
            "Tunnel active: {} -> http://{}",
            self.public_url(),
            self.config.local_authority()
        );

        let (mut sink, mut stream) = socket.split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);

        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Binary(data)) => self.dispatch(Bytes::from(data), &frame_tx).await,
                Ok(Message::Close(_)) => break,
                // Text, ping and pong are not part of the protocol
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Tunnel connection error");
                    break;
                }
            }
        }

        writer.abort();
        // Local sessions die with the tunnel: their frames have nowhere
        // to go once the connection is gone.
        self.sessions.clear();

        info!("Tunnel closed");
        Err(AgentError::ConnectionClosed)
    }

    /// Decode one frame and hand it to the matching handler
    async fn dispatch(&self, data: Bytes, out: &mpsc::Sender<Vec<u8>>) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match frame.message {
            TunnelMessage::HttpRequest {
                request_id,
                method,
                path,
                query,
                headers,
            } => {
                let request = ForwardedRequest {
                    request_id,
                    method,
                    path,
                    query,
                    headers,
                    body: frame.body,
                };
                let http = self.http.clone();
                let config = self.config.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let response = forwarder::forward_request(&http, &config, request).await;
                    send_frame(&out, &response).await;
                });
            }
            TunnelMessage::WsOpen { request_id, path } => {
                let config = self.config.clone();
                let sessions = self.sessions.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    sessions::run_local_session(config, sessions, request_id, path, out).await;
                });
            }
            TunnelMessage::WsData { request_id } => {
                if let Some(entry) = self.sessions.get(&request_id) {
                    let _ = entry.value().send(SessionCommand::Data(frame.body));
                }
            }
            TunnelMessage::WsClose { request_id } => {
                if let Some((_, commands)) = self.sessions.remove(&request_id) {
                    let _ = commands.send(SessionCommand::Close);
                }
            }
            other => {
                warn!(kind = other.kind(), "Unexpected message kind from relay");
            }
        }
    }

    /// Public base URL for this tunnel, for the startup banner
    fn public_url(&self) -> String {
        match Url::parse(&self.config.server_url) {
            Ok(mut url) => {
                let scheme = if url.scheme() == "wss" { "https" } else { "http" };
                let _ = url.set_scheme(scheme);
                url.set_path(&format!("/{}/", self.config.client_id));
                url.set_query(None);
                url.to_string()
            }
            Err(_) => format!("{}/{}/", self.config.server_url, self.config.client_id),
        }
    }
}

/// Encode and queue one frame for the relay
pub(crate) async fn send_frame(out: &mpsc::Sender<Vec<u8>>, frame: &Frame) {
    match frame.encode() {
        Ok(bytes) => {
            if out.send(bytes.to_vec()).await.is_err() {
                debug!("Tunnel writer gone; dropping frame");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode frame"),
    }
}
