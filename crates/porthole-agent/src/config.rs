//! Agent configuration

/// Configuration for one tunnel agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay tunnel endpoint (`ws://` or `wss://`)
    pub server_url: String,
    /// Public client identifier; becomes the URL path prefix
    pub client_id: String,
    /// Local host requests are forwarded to
    pub local_host: String,
    /// Local port requests are forwarded to
    pub local_port: u16,
}

impl AgentConfig {
    pub fn new(server_url: String, client_id: String, local_port: u16) -> Self {
        Self {
            server_url,
            client_id,
            local_host: "localhost".to_string(),
            local_port,
        }
    }

    /// Local target in `host:port` form, as the rewritten `host` header
    pub fn local_authority(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}
