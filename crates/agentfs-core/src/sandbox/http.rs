//! JSON-RPC 2.0 sandbox client over HTTP.
//!
//! Methods: `execute {command, timeout}` → `{output, exit_code}`,
//! `upload_file {path, content_base64}`, `download_file {path}` →
//! `{content_base64}`. Error code [`NOT_FOUND_CODE`] marks a missing file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::SandboxClient;
use crate::error::SandboxError;
use crate::types::ExecuteResponse;
use crate::util::http::build_client;

pub const NOT_FOUND_CODE: i64 = -32004;

/// Extra time allowed on top of a command's own timeout for the HTTP round trip.
const TRANSPORT_SLACK: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct DownloadResult {
    content_base64: String,
}

pub struct HttpSandboxClient {
    endpoint: String,
    api_key: Option<String>,
    sandbox_id: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpSandboxClient {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Self {
        Self::with_client(endpoint, api_key, build_client(Duration::from_secs(60)))
    }

    /// Use a caller-supplied HTTP client.
    pub fn with_client(endpoint: &str, api_key: Option<String>, client: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            sandbox_id: endpoint.to_string(),
            client,
            next_id: AtomicU64::new(1),
        }
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SandboxError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&req);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!("Sandbox RPC {} -> {}", method, self.endpoint);
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SandboxError::Timeout(timeout.as_secs())
            } else {
                SandboxError::Unreachable(format!("{method} request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SandboxError::Remote {
                code: i64::from(status.as_u16()),
                message: format!("sandbox returned HTTP {status}"),
            });
        }

        let rpc_resp: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| SandboxError::Protocol(format!("{method} response parse error: {e}")))?;

        if let Some(err) = rpc_resp.error {
            return Err(SandboxError::Remote {
                code: err.code,
                message: err.message,
            });
        }

        rpc_resp
            .result
            .ok_or_else(|| SandboxError::Protocol(format!("{method} response has no result")))
    }
}

#[async_trait]
impl SandboxClient for HttpSandboxClient {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecuteResponse, SandboxError> {
        let params = json!({ "command": command, "timeout": timeout.as_secs() });
        let result = self.rpc_call("execute", params, timeout + TRANSPORT_SLACK).await?;
        serde_json::from_value(result)
            .map_err(|e| SandboxError::Protocol(format!("invalid execute result: {e}")))
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let params = json!({ "path": path, "content_base64": encoded });
        self.rpc_call("upload_file", params, TRANSPORT_SLACK).await?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let result = match self
            .rpc_call("download_file", json!({ "path": path }), TRANSPORT_SLACK)
            .await
        {
            Ok(result) => result,
            Err(SandboxError::Remote { code, .. }) if code == NOT_FOUND_CODE => {
                return Err(SandboxError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e),
        };
        let download: DownloadResult = serde_json::from_value(result)
            .map_err(|e| SandboxError::Protocol(format!("invalid download result: {e}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(download.content_base64)
            .map_err(|e| SandboxError::Protocol(format!("invalid base64 payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "execute",
            params: json!({"command": "ls", "timeout": 5}),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "execute");
        assert_eq!(value["params"]["command"], "ls");
    }

    #[test]
    fn test_empty_api_key_is_dropped() {
        let client = HttpSandboxClient::new("http://127.0.0.1:1/rpc/", Some(String::new()));
        assert!(client.api_key.is_none());
        assert_eq!(client.endpoint, "http://127.0.0.1:1/rpc");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        // Port 1 on loopback refuses connections.
        let client = HttpSandboxClient::new("http://127.0.0.1:1/rpc", None);
        let err = client
            .execute("true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Unreachable(_) | SandboxError::Timeout(_)));
    }
}
