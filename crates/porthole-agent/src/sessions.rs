//! Local WebSocket sessions
//!
//! One task per relayed session: it owns the local connection, forwards
//! local messages upstream as `WS_DATA`, and honors data/close commands
//! routed in from the tunnel connection. The side that removes the session
//! from the map owns the close; later signals for the same identifier are
//! no-ops.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use porthole_proto::{Frame, TunnelMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

use crate::config::AgentConfig;
use crate::tunnel::send_frame;

/// Command routed to one local session task
#[derive(Debug)]
pub enum SessionCommand {
    Data(Bytes),
    Close,
}

/// Tracked local sessions, keyed by request identifier
pub type SessionMap = Arc<DashMap<String, mpsc::UnboundedSender<SessionCommand>>>;

/// Open and run one local WebSocket session for a `WS_OPEN` frame
pub async fn run_local_session(
    config: Arc<AgentConfig>,
    sessions: SessionMap,
    request_id: String,
    path: String,
    out: mpsc::Sender<Vec<u8>>,
) {
    let url = format!(
        "ws://{}:{}{}",
        config.local_host, config.local_port, path
    );

    let (local, _response) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(request_id = %request_id, url = %url, error = %e, "Local WebSocket connect failed");
            // The session never opened; synthesize a close so the server
            // side tears down instead of dangling.
            send_frame(&out, &Frame::new(TunnelMessage::WsClose { request_id })).await;
            return;
        }
    };

    debug!(request_id = %request_id, url = %url, "Local WebSocket session open");

    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    sessions.insert(request_id.clone(), commands_tx);

    let (mut sink, mut stream) = local.split();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let frame = Frame::with_body(
                        TunnelMessage::WsData { request_id: request_id.clone() },
                        Bytes::from(data),
                    );
                    send_frame(&out, &frame).await;
                }
                Some(Ok(Message::Text(text))) => {
                    let frame = Frame::with_body(
                        TunnelMessage::WsData { request_id: request_id.clone() },
                        Bytes::from(text.into_bytes()),
                    );
                    send_frame(&out, &frame).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    close_upstream(&sessions, &request_id, &out).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(request_id = %request_id, error = %e, "Local WebSocket error");
                    close_upstream(&sessions, &request_id, &out).await;
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(SessionCommand::Data(data)) => {
                    if sink.send(Message::Binary(data.to_vec())).await.is_err() {
                        close_upstream(&sessions, &request_id, &out).await;
                        break;
                    }
                }
                // Tunnel side closed the session; the map entry is
                // already gone either way.
                Some(SessionCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }

    debug!(request_id = %request_id, "Local WebSocket session ended");
}

/// Send `WS_CLOSE` upstream, but only from the side that actually removed
/// the tracked session
async fn close_upstream(sessions: &SessionMap, request_id: &str, out: &mpsc::Sender<Vec<u8>>) {
    if sessions.remove(request_id).is_some() {
        let close = Frame::new(TunnelMessage::WsClose {
            request_id: request_id.to_string(),
        });
        send_frame(out, &close).await;
    }
}
