//! Local HTTP forwarding
//!
//! Reconstructs each relayed request against the configured local service,
//! strips proxy-identifying headers so the service sees a same-origin
//! request, and always produces exactly one terminal response frame per
//! request identifier.

use bytes::Bytes;
use porthole_proto::{Frame, TunnelMessage};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::config::AgentConfig;
use crate::rewriter;

/// Fixed body for a local service the agent cannot reach
pub const BAD_GATEWAY_BODY: &str = "Bad Gateway: local server unreachable";

/// Request headers that would reveal the relay hop to the local service
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-for",
    "origin",
    "referer",
];

/// Response headers invalidated by the local call: the body arrives
/// decoded and unchunked, and its length is recomputed after rewriting
const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["content-encoding", "transfer-encoding", "content-length"];

#[derive(Debug, Error)]
enum ForwardError {
    #[error("Invalid local URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid method: {0}")]
    Method(String),

    #[error("Local request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// One relayed request, decoded from an `HTTP_REQUEST` frame
pub struct ForwardedRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Perform the local call and build the terminal response frame.
///
/// Failure to reach the local service becomes the fixed 502 response,
/// still carrying the original request identifier, so the public caller
/// always receives exactly one terminal response.
pub async fn forward_request(
    http: &reqwest::Client,
    config: &AgentConfig,
    request: ForwardedRequest,
) -> Frame {
    let request_id = request.request_id.clone();
    match try_forward(http, config, request).await {
        Ok(frame) => frame,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Local request failed");
            bad_gateway(request_id)
        }
    }
}

async fn try_forward(
    http: &reqwest::Client,
    config: &AgentConfig,
    request: ForwardedRequest,
) -> Result<Frame, ForwardError> {
    let url = local_url(config, &request.path, &request.query)?;
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| ForwardError::Method(request.method.clone()))?;

    let response = http
        .request(method, url)
        .headers(sanitize_request_headers(&request.headers, config))
        .body(request.body)
        .send()
        .await?;

    let status = response.status().as_u16();
    let mut headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter(|(name, _)| !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let mut body = response.bytes().await?;
    if let Some(content_type) = headers.get("content-type") {
        if rewriter::needs_rewrite(content_type) {
            body = rewriter::rewrite_body(body, &config.client_id);
        }
    }
    headers.insert("content-length".to_string(), body.len().to_string());

    debug!(
        request_id = %request.request_id,
        status,
        bytes = body.len(),
        "Local response relayed"
    );

    Ok(Frame::with_body(
        TunnelMessage::HttpResponse {
            request_id: request.request_id,
            status,
            headers,
        },
        body,
    ))
}

fn local_url(
    config: &AgentConfig,
    path: &str,
    query: &HashMap<String, String>,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!(
        "http://{}:{}{}",
        config.local_host, config.local_port, path
    ))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter());
    }
    Ok(url)
}

/// Drop proxy-identifying headers and point `host` at the local target
fn sanitize_request_headers(headers: &HashMap<String, String>, config: &AgentConfig) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }

    if let Ok(host) = HeaderValue::from_str(&config.local_authority()) {
        map.insert(HOST, host);
    }

    map
}

/// Build the fixed 502 frame for an unreachable local service
fn bad_gateway(request_id: String) -> Frame {
    let body = Bytes::from_static(BAD_GATEWAY_BODY.as_bytes());
    let headers = HashMap::from([
        ("content-type".to_string(), "text/plain".to_string()),
        ("content-length".to_string(), body.len().to_string()),
    ]);

    Frame::with_body(
        TunnelMessage::HttpResponse {
            request_id,
            status: 502,
            headers,
        },
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig::new(
            "ws://relay.test/porthole".to_string(),
            "abc123".to_string(),
            3000,
        )
    }

    #[test]
    fn test_sanitize_strips_proxy_headers() {
        let headers = HashMap::from([
            ("Host".to_string(), "relay.example.com".to_string()),
            ("X-Forwarded-For".to_string(), "1.2.3.4".to_string()),
            ("X-Forwarded-Proto".to_string(), "https".to_string()),
            ("Origin".to_string(), "https://relay.example.com".to_string()),
            ("Referer".to_string(), "https://relay.example.com/p".to_string()),
            ("Accept".to_string(), "text/html".to_string()),
        ]);

        let sanitized = sanitize_request_headers(&headers, &config());

        assert_eq!(sanitized.get(HOST).unwrap(), "localhost:3000");
        assert!(sanitized.get("x-forwarded-for").is_none());
        assert!(sanitized.get("x-forwarded-proto").is_none());
        assert!(sanitized.get("origin").is_none());
        assert!(sanitized.get("referer").is_none());
        assert_eq!(sanitized.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_local_url_with_query() {
        let query = HashMap::from([("q".to_string(), "rust lang".to_string())]);
        let url = local_url(&config(), "/search", &query).unwrap();

        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(3000));
        assert_eq!(url.path(), "/search");
        assert_eq!(url.query(), Some("q=rust+lang"));
    }

    #[test]
    fn test_local_url_without_query() {
        let url = local_url(&config(), "/", &HashMap::new()).unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/");
    }

    #[tokio::test]
    async fn test_unreachable_local_service_becomes_502() {
        let mut config = config();
        config.local_host = "127.0.0.1".to_string();
        // Nothing listens here
        config.local_port = 1;

        let request = ForwardedRequest {
            request_id: "r1".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: Bytes::new(),
        };

        let http = reqwest::Client::new();
        let frame = forward_request(&http, &config, request).await;

        match frame.message {
            TunnelMessage::HttpResponse {
                request_id,
                status,
                headers,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(status, 502);
                assert_eq!(
                    headers.get("content-type").map(String::as_str),
                    Some("text/plain")
                );
            }
            other => panic!("expected HTTP_RESPONSE, got {other:?}"),
        }
        assert_eq!(frame.body, Bytes::from_static(BAD_GATEWAY_BODY.as_bytes()));
    }

    #[tokio::test]
    async fn test_invalid_method_becomes_502() {
        let request = ForwardedRequest {
            request_id: "r2".to_string(),
            method: "NOT A METHOD".to_string(),
            path: "/".to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: Bytes::new(),
        };

        let http = reqwest::Client::new();
        let frame = forward_request(&http, &config(), request).await;

        match frame.message {
            TunnelMessage::HttpResponse { status, .. } => assert_eq!(status, 502),
            other => panic!("expected HTTP_RESPONSE, got {other:?}"),
        }
    }
}
