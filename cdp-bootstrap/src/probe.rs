use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::errors::BootstrapError;

/// Introspection path answered by the control protocol's HTTP endpoint.
pub const INTROSPECTION_PATH: &str = "/json";

/// Checks whether the remote-debugging port answers.
#[async_trait]
pub trait PortCheck: Send + Sync {
    /// Never fails: errors and timeouts both mean "not reachable".
    async fn is_reachable(&self, port: u16, timeout: Duration) -> bool;
}

/// A debuggable target listed by the endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub websocket_url: Option<String>,
}

/// Lightweight HTTP prober for `127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct PortProber {
    host: String,
    client: reqwest::Client,
}

impl Default for PortProber {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProber {
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        // A proxy from the environment must never see loopback probes.
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            host: host.into(),
            client,
        }
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, INTROSPECTION_PATH)
    }

    /// One GET against the introspection path; success is HTTP 200.
    pub async fn probe(&self, port: u16, timeout: Duration) -> bool {
        match self.client.get(self.url(port)).timeout(timeout).send().await {
            Ok(response) => {
                let reachable = response.status() == reqwest::StatusCode::OK;
                debug!(port, status = %response.status(), reachable, "probed debug port");
                reachable
            }
            Err(e) => {
                debug!(port, "debug port not reachable: {}", e);
                false
            }
        }
    }

    /// First reachable port in `base..base + window`.
    pub async fn find_open_port(&self, base: u16, window: u16, timeout: Duration) -> Option<u16> {
        for offset in 0..window.max(1) {
            let Some(port) = base.checked_add(offset) else {
                break;
            };
            if self.probe(port, timeout).await {
                return Some(port);
            }
        }
        None
    }

    /// Targets currently exposed by the endpoint.
    pub async fn list_targets(
        &self,
        port: u16,
        timeout: Duration,
    ) -> Result<Vec<TargetInfo>, BootstrapError> {
        let response = self
            .client
            .get(self.url(port))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BootstrapError::PlatformError(format!("Failed to list targets: {e}")))?;

        let targets: Vec<TargetInfo> = response
            .json()
            .await
            .map_err(|e| BootstrapError::PlatformError(format!("Failed to parse targets: {e}")))?;

        debug!("Found {} debuggable targets on port {}", targets.len(), port);
        Ok(targets)
    }
}

#[async_trait]
impl PortCheck for PortProber {
    async fn is_reachable(&self, port: u16, timeout: Duration) -> bool {
        self.probe(port, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn start_test_server(status: u16, body: &'static str) -> (u16, Arc<tiny_http::Server>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let server_arc = Arc::new(server);
        let server_clone = server_arc.clone();

        thread::spawn(move || {
            for request in server_clone.incoming_requests() {
                let response = if request.url() == INTROSPECTION_PATH {
                    tiny_http::Response::from_string(body).with_status_code(status)
                } else {
                    tiny_http::Response::from_string("not found").with_status_code(404)
                };
                let _ = request.respond(response);
            }
        });

        (port, server_arc)
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn reachable_when_endpoint_answers_ok() {
        let (port, _server) = start_test_server(200, "[]");
        let prober = PortProber::new();
        assert!(prober.probe(port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn non_200_is_unreachable() {
        let (port, _server) = start_test_server(500, "boom");
        let prober = PortProber::new();
        assert!(!prober.probe(port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let prober = PortProber::new();
        assert!(!prober.is_reachable(unused_port(), Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn lists_targets() {
        let (port, _server) = start_test_server(
            200,
            r#"[{"id":"A1","title":"Editor","url":"vscode-file://x","type":"page","webSocketDebuggerUrl":"ws://127.0.0.1/devtools/page/A1"}]"#,
        );
        let prober = PortProber::new();
        let targets = prober.list_targets(port, Duration::from_secs(2)).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].target_type, "page");
        assert!(targets[0].websocket_url.is_some());
    }

    #[tokio::test]
    async fn window_scan_finds_open_port() {
        let (port, _server) = start_test_server(200, "[]");
        let prober = PortProber::new();
        let found = prober
            .find_open_port(port, 1, Duration::from_secs(2))
            .await;
        assert_eq!(found, Some(port));
    }
}
