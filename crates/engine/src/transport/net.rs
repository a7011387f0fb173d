//! T-NET: loopback HTTP over a TAP-bridged private network.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::transport::{GuestExecResult, GuestTransport};

const ATTEMPTS: u32 = 3;
const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Talks to a guest agent's HTTP server over its TAP-bridged address.
pub struct NetTransport {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    command: &'a str,
    timeout: u32,
}

#[derive(Serialize)]
struct WriteFileRequest<'a> {
    file_path: &'a str,
    content: &'a str,
    encoding: &'a str,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    return_code: i32,
}

#[derive(Deserialize)]
struct WriteFileResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

impl NetTransport {
    pub fn new(guest_ip: &str, port: u16) -> Self {
        NetTransport {
            base_url: format!("http://{guest_ip}:{port}"),
            client: reqwest::Client::new(),
        }
    }

    fn client_for(&self, op_timeout: u32) -> EngineResult<reqwest::Client> {
        let connect = Duration::from_secs(op_timeout.min(3) as u64).max(Duration::from_millis(1));
        let read = Duration::from_secs(op_timeout as u64 + 5);
        reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(read)
            .build()
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))
    }
}

#[async_trait]
impl GuestTransport for NetTransport {
    async fn write_file(&self, path: &str, content: &str) -> EngineResult<()> {
        let client = self.client_for(5)?;
        let url = format!("{}/write_file", self.base_url);
        let body = WriteFileRequest {
            file_path: path,
            content,
            encoding: "utf8",
        };

        let resp = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))?;

        let parsed: WriteFileResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::TransportUnavailable(e.to_string()))?;

        if parsed.success {
            Ok(())
        } else {
            Err(EngineError::GuestCommandFailed {
                stderr: parsed.error.unwrap_or_else(|| "write_file failed".to_string()),
            })
        }
    }

    async fn execute(&self, command: &str, timeout: u32) -> EngineResult<GuestExecResult> {
        let client = self.client_for(timeout)?;
        let url = format!("{}/execute", self.base_url);
        let body = ExecuteRequest { command, timeout };

        let mut last_err = None;
        for (attempt, backoff) in BACKOFF_SCHEDULE.iter().enumerate().take(ATTEMPTS as usize) {
            match client.post(&url).json(&body).send().await {
                Ok(resp) => {
                    let parsed: ExecuteResponse = resp
                        .json()
                        .await
                        .map_err(|e| EngineError::TransportUnavailable(e.to_string()))?;
                    return Ok(GuestExecResult {
                        success: parsed.success,
                        stdout: parsed.stdout,
                        stderr: parsed.stderr,
                        return_code: parsed.return_code,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "guest execute attempt failed");
                    last_err = Some(e);
                    if attempt + 1 < ATTEMPTS as usize {
                        tokio::time::sleep(*backoff).await;
                    }
                }
            }
        }

        // Final failure: probe health to distinguish a live-but-broken guest
        // from a dead one.
        if self.health().await {
            Err(EngineError::GuestCommandFailed {
                stderr: last_err.map(|e| e.to_string()).unwrap_or_default(),
            })
        } else {
            Err(EngineError::TransportUnavailable(format!(
                "guest unreachable after {ATTEMPTS} attempts"
            )))
        }
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(2)).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<HealthResponse>()
                .await
                .map(|h| h.status == "healthy")
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_is_false_when_nothing_is_listening() {
        let transport = NetTransport::new("127.0.0.1", 1);
        assert!(!transport.health().await);
    }

    #[test]
    fn client_for_floors_the_connect_timeout_for_a_zero_second_op() {
        let transport = NetTransport::new("169.254.0.2", 8081);
        // Must not panic building a client for a zero-second op timeout.
        assert!(transport.client_for(0).is_ok());
    }
}
