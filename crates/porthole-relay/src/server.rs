//! Public relay surface
//!
//! Serves three things: a plain-text status line on `/`, the agent
//! registration endpoint, and a fallback relaying any method on
//! `/<clientId>/...` (including public WebSocket upgrades) over the
//! addressed client's tunnel connection.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use porthole_proto::{Frame, TunnelMessage};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::pending::{RelayedResponse, SessionEvent};
use crate::registry::{ClientRegistry, TunnelClient};

/// Path agents connect to for tunnel registration
pub const TUNNEL_ENDPOINT: &str = "/porthole";

/// Largest request body relayed through the tunnel (16MB)
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Outbound frame queue depth per tunnel connection
const FRAME_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3001".parse().unwrap(),
        }
    }
}

/// Public relay server
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ClientRegistry>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ClientRegistry::new()),
        }
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// Bind and serve until the process exits
    pub async fn start(self) -> Result<(), RelayServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await.map_err(|e| {
            RelayServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!("Relay server listening on {}", local_addr);

        axum::serve(listener, router(self.registry)).await?;
        Ok(())
    }
}

/// Build the public router around a client registry
pub fn router(registry: Arc<ClientRegistry>) -> Router {
    Router::new()
        .route("/", get(status))
        .route(TUNNEL_ENDPOINT, get(register_agent))
        .fallback(relay)
        .with_state(registry)
}

async fn status(State(registry): State<Arc<ClientRegistry>>) -> String {
    format!(
        "Porthole relay is active. {} client(s) connected.",
        registry.count()
    )
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    id: String,
}

/// Agent registration: a WebSocket upgrade carrying the client id as a
/// query parameter
async fn register_agent(
    State(registry): State<Arc<ClientRegistry>>,
    Query(params): Query<RegisterParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let id = params.id;

    // Refuse before completing the upgrade when the id is already live;
    // registration inside the socket task settles any remaining race.
    if registry.lookup(&id).is_some() {
        warn!(client_id = %id, "Tunnel id already connected");
        return (StatusCode::CONFLICT, "Tunnel id already connected").into_response();
    }

    ws.on_upgrade(move |socket| agent_connection(registry, id, socket))
}

/// Runs one registered agent connection: a writer task drains the outbound
/// frame queue while this task dispatches inbound frames until the socket
/// closes, at which point everything still pending is resolved.
async fn agent_connection(registry: Arc<ClientRegistry>, id: String, socket: WebSocket) {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE_DEPTH);

    let client = match registry.register(id.clone(), frame_tx) {
        Ok(client) => client,
        Err(_) => {
            // Lost the registration race: close the new socket and leave
            // the existing connection untouched.
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

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
            Ok(Message::Binary(data)) => dispatch_frame(&client, data),
            Ok(Message::Close(_)) => break,
            // Text, ping and pong are not part of the protocol
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %client.id(), error = %e, "Tunnel connection error");
                break;
            }
        }
    }

    registry.unregister(&id);
    writer.abort();
}

/// Dispatch one inbound frame from the agent.
///
/// Malformed frames are dropped with a diagnostic; the connection and all
/// unrelated in-flight requests continue untouched.
fn dispatch_frame(client: &TunnelClient, data: Bytes) {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(client_id = %client.id(), error = %e, "Dropping malformed frame");
            return;
        }
    };

    match frame.message {
        TunnelMessage::HttpResponse {
            request_id,
            status,
            headers,
        } => match client.pending.resolve_http(&request_id) {
            Some(sink) => {
                let _ = sink.send(RelayedResponse {
                    status,
                    headers,
                    body: frame.body,
                });
            }
            // Already resolved, or an id this client never issued
            None => {
                debug!(client_id = %client.id(), request_id = %request_id, "Discarding response without pending request");
            }
        },
        TunnelMessage::WsData { request_id } => {
            if let Some(handle) = client.pending.lookup_ws(&request_id) {
                let _ = handle.send(SessionEvent::Data(frame.body));
            }
        }
        TunnelMessage::WsClose { request_id } => {
            if let Some(handle) = client.pending.remove_ws(&request_id) {
                let _ = handle.send(SessionEvent::Close);
            }
        }
        other => {
            warn!(client_id = %client.id(), kind = other.kind(), "Unexpected message kind from agent");
        }
    }
}

/// Optional WebSocket-upgrade extractor.
///
/// axum 0.8 removed the blanket `Option<WebSocketUpgrade>` extractor: it now
/// requires `OptionalFromRequestParts`, which `WebSocketUpgrade` does not
/// implement. This wrapper restores the previous semantics — `Some` when the
/// request is a WebSocket upgrade, `None` otherwise.
struct OptionalWsUpgrade(Option<WebSocketUpgrade>);

impl<S: Send + Sync> FromRequestParts<S> for OptionalWsUpgrade {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(
            WebSocketUpgrade::from_request_parts(parts, state).await.ok(),
        ))
    }
}

/// Relay any public request addressed to `/<clientId>/...`
async fn relay(
    State(registry): State<Arc<ClientRegistry>>,
    OptionalWsUpgrade(ws): OptionalWsUpgrade,
    req: Request,
) -> Response {
    let (client_id, rest) = split_client_path(req.uri().path());
    let client_id = client_id.to_string();
    let rest = rest.to_string();

    let Some(client) = registry.lookup(&client_id) else {
        debug!(client_id = %client_id, "Request for unknown tunnel id");
        return (StatusCode::NOT_FOUND, crate::TUNNEL_NOT_ACTIVE).into_response();
    };

    match ws {
        Some(upgrade) => {
            // The agent needs path plus query to open the local endpoint
            let path = match req.uri().query() {
                Some(query) => format!("{rest}?{query}"),
                None => rest,
            };
            upgrade.on_upgrade(move |socket| public_session(client, path, socket))
        }
        None => relay_http(client, rest, req).await,
    }
}

/// Relay one public HTTP request and await its terminal response
async fn relay_http(client: Arc<TunnelClient>, path: String, req: Request) -> Response {
    let request_id = new_request_id();
    let method = req.method().to_string();
    let query = parse_query(req.uri().query());
    let headers = collect_headers(req.headers());

    let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response()
        }
    };

    debug!(
        client_id = %client.id(),
        request_id = %request_id,
        %method,
        %path,
        "Relaying request"
    );

    let (sink, resolved) = oneshot::channel();
    client.pending.track_http(request_id.clone(), sink);

    let frame = Frame::with_body(
        TunnelMessage::HttpRequest {
            request_id: request_id.clone(),
            method,
            path,
            query,
            headers,
        },
        body,
    );

    if client.send_frame(&frame).await.is_err() {
        // Writer task is gone. The disconnect sweep may already have
        // resolved the entry; otherwise clear it here so nothing leaks.
        client.pending.resolve_http(&request_id);
        return tunnel_disconnected();
    }

    match resolved.await {
        Ok(response) => build_response(response),
        Err(_) => tunnel_disconnected(),
    }
}

/// Runs one public-side WebSocket session relayed to the agent
async fn public_session(client: Arc<TunnelClient>, path: String, socket: WebSocket) {
    let request_id = new_request_id();
    let (handle, mut events) = mpsc::unbounded_channel();
    client.pending.track_ws(request_id.clone(), handle);

    debug!(
        client_id = %client.id(),
        request_id = %request_id,
        %path,
        "Opening relayed session"
    );

    let open = Frame::new(TunnelMessage::WsOpen {
        request_id: request_id.clone(),
        path,
    });
    if client.send_frame(&open).await.is_err() {
        client.pending.remove_ws(&request_id);
        return;
    }

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let frame = Frame::with_body(
                        TunnelMessage::WsData { request_id: request_id.clone() },
                        data,
                    );
                    if client.send_frame(&frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    let frame = Frame::with_body(
                        TunnelMessage::WsData { request_id: request_id.clone() },
                        Bytes::copy_from_slice(text.as_bytes()),
                    );
                    if client.send_frame(&frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    close_upstream(&client, &request_id).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(request_id = %request_id, error = %e, "Public session error");
                    close_upstream(&client, &request_id).await;
                    break;
                }
            },
            event = events.recv() => match event {
                Some(SessionEvent::Data(data)) => {
                    if sink.send(Message::Binary(data)).await.is_err() {
                        close_upstream(&client, &request_id).await;
                        break;
                    }
                }
                // Agent side closed, or the tunnel disconnected; the
                // registry entry is already gone either way.
                Some(SessionEvent::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }

    debug!(client_id = %client.id(), request_id = %request_id, "Relayed session ended");
}

/// Tell the agent the session is gone, but only if this side is first to
/// observe the close
async fn close_upstream(client: &TunnelClient, request_id: &str) {
    if client.pending.remove_ws(request_id).is_some() {
        let close = Frame::new(TunnelMessage::WsClose {
            request_id: request_id.to_string(),
        });
        let _ = client.send_frame(&close).await;
    }
}

/// Fresh correlation token: random, never reused, no ordering significance
fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Split `/abc/x/y` into the client id (`abc`) and the path forwarded to
/// the agent (`/x/y`)
fn split_client_path(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.split_once('/') {
        Some((id, _)) => (id, &path[1 + id.len()..]),
        None => (trimmed, "/"),
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Build the public response from a relayed terminal response.
///
/// Body-framing headers are dropped: the body is a fully buffered byte
/// slice here, so the content length is recomputed by the server.
fn build_response(relayed: RelayedResponse) -> Response {
    let status = StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in &relayed.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from(relayed.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn tunnel_disconnected() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, crate::TUNNEL_DISCONNECTED).into_response()
}
