//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main tunnel protocol message enum
///
/// Serialized as the JSON metadata block of a [`Frame`](crate::Frame). The
/// `type` tag and camelCase field names are the wire format; both ends emit
/// and parse exactly these shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TunnelMessage {
    /// Public HTTP request relayed to the agent. The frame body carries the
    /// request body bytes, which may be empty.
    #[serde(rename = "HTTP_REQUEST")]
    HttpRequest {
        request_id: String,
        method: String,
        path: String,
        #[serde(default)]
        query: HashMap<String, String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Terminal response for one relayed request. The frame body carries the
    /// response body bytes.
    #[serde(rename = "HTTP_RESPONSE")]
    HttpResponse {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Open a local WebSocket session against `path` (including query string)
    #[serde(rename = "WS_OPEN")]
    WsOpen { request_id: String, path: String },

    /// One WebSocket message for an open session; the frame body carries the
    /// raw message payload
    #[serde(rename = "WS_DATA")]
    WsData { request_id: String },

    /// Close the session; the first close observed from either direction is
    /// authoritative
    #[serde(rename = "WS_CLOSE")]
    WsClose { request_id: String },
}

impl TunnelMessage {
    /// Correlation key shared by every message kind
    pub fn request_id(&self) -> &str {
        match self {
            TunnelMessage::HttpRequest { request_id, .. }
            | TunnelMessage::HttpResponse { request_id, .. }
            | TunnelMessage::WsOpen { request_id, .. }
            | TunnelMessage::WsData { request_id }
            | TunnelMessage::WsClose { request_id } => request_id,
        }
    }

    /// Wire name of the message kind, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::HttpRequest { .. } => "HTTP_REQUEST",
            TunnelMessage::HttpResponse { .. } => "HTTP_RESPONSE",
            TunnelMessage::WsOpen { .. } => "WS_OPEN",
            TunnelMessage::WsData { .. } => "WS_DATA",
            TunnelMessage::WsClose { .. } => "WS_CLOSE",
        }
    }
}
