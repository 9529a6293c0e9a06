//! Per-client correlation state for in-flight requests and sessions

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

/// Terminal outcome of one relayed HTTP exchange
#[derive(Debug)]
pub struct RelayedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl RelayedResponse {
    /// Fixed response manufactured when the tunnel connection closes with
    /// the request still pending
    pub fn disconnected() -> Self {
        Self {
            status: 503,
            headers: HashMap::from([(
                "content-type".to_string(),
                "text/plain".to_string(),
            )]),
            body: Bytes::from_static(crate::TUNNEL_DISCONNECTED.as_bytes()),
        }
    }
}

/// Event delivered to a public-side WebSocket session task
#[derive(Debug)]
pub enum SessionEvent {
    /// Payload relayed from the agent's local connection
    Data(Bytes),
    /// The agent side closed; tear the public session down
    Close,
}

/// Sink completing the not-yet-answered public response
pub type ResponseSink = oneshot::Sender<RelayedResponse>;

/// Handle delivering events into a public-side session task
pub type SessionHandle = mpsc::UnboundedSender<SessionEvent>;

/// Correlation registry scoped to one tunnel client.
///
/// HTTP requests and WebSocket sessions live in separate maps: identifiers
/// come from the same generator, but a token can never be matched across
/// the two kinds, nor across clients; each client owns its own registry.
/// Every `track_*` has exactly one matching `resolve_http`/`remove_ws`,
/// with [`drain`](Self::drain) as the disconnect backstop.
#[derive(Debug, Default)]
pub struct PendingRequests {
    http: Mutex<HashMap<String, ResponseSink>>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an in-flight HTTP request
    pub fn track_http(&self, request_id: String, sink: ResponseSink) {
        self.http.lock().unwrap().insert(request_id, sink);
    }

    /// Take the sink for a terminal response; `None` when the request was
    /// already resolved or never tracked
    pub fn resolve_http(&self, request_id: &str) -> Option<ResponseSink> {
        self.http.lock().unwrap().remove(request_id)
    }

    /// Track an open public-side WebSocket session
    pub fn track_ws(&self, request_id: String, handle: SessionHandle) {
        self.sessions.lock().unwrap().insert(request_id, handle);
    }

    /// Handle for a live session, if any
    pub fn lookup_ws(&self, request_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().get(request_id).cloned()
    }

    /// Remove a session; the side that removes the entry owns the close,
    /// so later close signals for the same identifier are no-ops
    pub fn remove_ws(&self, request_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().remove(request_id)
    }

    /// Take everything still pending, emptying both maps
    pub fn drain(&self) -> (Vec<ResponseSink>, Vec<SessionHandle>) {
        let sinks = self.http.lock().unwrap().drain().map(|(_, s)| s).collect();
        let handles = self
            .sessions
            .lock()
            .unwrap()
            .drain()
            .map(|(_, h)| h)
            .collect();
        (sinks, handles)
    }

    /// Number of in-flight HTTP requests
    pub fn http_count(&self) -> usize {
        self.http.lock().unwrap().len()
    }

    /// Number of open WebSocket sessions
    pub fn ws_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_exactly_once() {
        let pending = PendingRequests::new();
        let (tx, _rx) = oneshot::channel();

        pending.track_http("r1".to_string(), tx);
        assert_eq!(pending.http_count(), 1);

        assert!(pending.resolve_http("r1").is_some());
        assert!(pending.resolve_http("r1").is_none());
        assert_eq!(pending.http_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_id() {
        let pending = PendingRequests::new();
        assert!(pending.resolve_http("ghost").is_none());
    }

    #[test]
    fn test_ws_remove_is_authoritative() {
        let pending = PendingRequests::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        pending.track_ws("w1".to_string(), tx);
        assert!(pending.lookup_ws("w1").is_some());

        // First close wins; the second observes nothing to close.
        assert!(pending.remove_ws("w1").is_some());
        assert!(pending.remove_ws("w1").is_none());
        assert!(pending.lookup_ws("w1").is_none());
    }

    #[test]
    fn test_identifier_isolation_across_clients() {
        // Two clients may draw the same token; each registry only ever
        // sees its own.
        let a = PendingRequests::new();
        let b = PendingRequests::new();
        let (tx, _rx) = oneshot::channel();

        a.track_http("same-token".to_string(), tx);

        assert!(b.resolve_http("same-token").is_none());
        assert!(a.resolve_http("same-token").is_some());
    }

    #[test]
    fn test_http_and_ws_namespaces_are_separate() {
        let pending = PendingRequests::new();
        let (http_tx, _http_rx) = oneshot::channel();
        let (ws_tx, _ws_rx) = mpsc::unbounded_channel();

        pending.track_http("tok".to_string(), http_tx);
        pending.track_ws("tok".to_string(), ws_tx);

        assert!(pending.remove_ws("tok").is_some());
        assert!(pending.resolve_http("tok").is_some());
    }

    #[test]
    fn test_drain_empties_both_maps() {
        let pending = PendingRequests::new();
        let (t1, _r1) = oneshot::channel();
        let (t2, _r2) = oneshot::channel();
        let (w1, _wr1) = mpsc::unbounded_channel();

        pending.track_http("r1".to_string(), t1);
        pending.track_http("r2".to_string(), t2);
        pending.track_ws("w1".to_string(), w1);

        let (sinks, handles) = pending.drain();
        assert_eq!(sinks.len(), 2);
        assert_eq!(handles.len(), 1);
        assert_eq!(pending.http_count(), 0);
        assert_eq!(pending.ws_count(), 0);
    }
}
