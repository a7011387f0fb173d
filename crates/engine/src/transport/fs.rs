//! T-FS: shared-directory request/response file-drop protocol.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use engine_types::{ContentEncoding, GuestRequest, GuestResponse};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::transport::{GuestExecResult, GuestTransport};

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(5);

/// Talks to a guest agent through a shared directory mounted into the
/// guest (9p/virtiofs or equivalent); the transport itself is agnostic to
/// how the directory gets there.
pub struct FsTransport {
    shared_root: PathBuf,
}

impl FsTransport {
    pub fn new(shared_root: impl Into<PathBuf>) -> Self {
        FsTransport {
            shared_root: shared_root.into(),
        }
    }

    fn requests_dir(&self) -> PathBuf {
        self.shared_root.join("requests")
    }

    fn responses_dir(&self) -> PathBuf {
        self.shared_root.join("responses")
    }

    fn status_path(&self) -> PathBuf {
        self.shared_root.join("guest_status.json")
    }

    /// Writes `request` atomically (temp file + rename) and waits for the
    /// matching response file to appear, or for the deadline to expire.
    async fn roundtrip(&self, request: GuestRequest, deadline: Duration) -> EngineResult<GuestResponse> {
        let request_id = request.request_id().to_string();
        write_atomic(
            &self.requests_dir(),
            &format!("{request_id}.json"),
            &serde_json::to_vec(&request).map_err(|e| EngineError::InternalResourceError(e.to_string()))?,
        )
        .await?;

        let response_path = self.responses_dir().join(format!("{request_id}.json"));
        let started = tokio::time::Instant::now();
        loop {
            if let Ok(bytes) = tokio::fs::read(&response_path).await {
                let _ = tokio::fs::remove_file(&response_path).await;
                return serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::InternalResourceError(e.to_string()));
            }
            if started.elapsed() >= deadline {
                return Err(EngineError::TransportTimeout {
                    seconds: deadline.as_secs() as u32,
                });
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl GuestTransport for FsTransport {
    async fn write_file(&self, path: &str, content: &str) -> EngineResult<()> {
        let request = GuestRequest::WriteFile {
            request_id: Uuid::new_v4().to_string(),
            file_path: path.to_string(),
            content: content.to_string(),
            encoding: ContentEncoding::Utf8,
        };
        let response = self.roundtrip(request, Duration::from_secs(10)).await?;
        if response.success {
            Ok(())
        } else {
            Err(EngineError::GuestCommandFailed {
                stderr: response.error.unwrap_or_else(|| "write_file failed".to_string()),
            })
        }
    }

    async fn execute(&self, command: &str, timeout: u32) -> EngineResult<GuestExecResult> {
        let request = GuestRequest::Execute {
            request_id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            timeout,
        };
        let response = self
            .roundtrip(request, Duration::from_secs(timeout as u64 + 5))
            .await?;
        Ok(GuestExecResult {
            success: response.success,
            stdout: response.stdout.unwrap_or_default(),
            stderr: response.stderr.unwrap_or_default(),
            return_code: response.return_code.unwrap_or(-1),
        })
    }

    async fn health(&self) -> bool {
        let status_path = self.status_path();
        let bytes = match tokio::fs::read(&status_path).await {
            Ok(b) => b,
            Err(_) => return false,
        };
        let status: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let Some(timestamp) = status.get("timestamp").and_then(|v| v.as_f64()) else {
            return false;
        };
        let now = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_secs_f64(),
            Err(_) => return false,
        };
        let age = Duration::from_secs_f64((now - timestamp).max(0.0));
        if age > HEARTBEAT_STALE_AFTER {
            warn!(age_secs = age.as_secs_f64(), "guest heartbeat stale");
            return false;
        }
        status.get("status").and_then(|v| v.as_str()) == Some("running")
    }
}

/// Writes `data` to `dir/name` via a temp file in the same directory then
/// rename, so a concurrent reader never observes a partially-written file.
async fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> EngineResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;

    let tmp_name = format!(".{name}.{}.tmp", Uuid::new_v4());
    let tmp_path = dir.join(&tmp_name);
    let final_path = dir.join(name);

    {
        let mut f = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
        f.write_all(data)
            .await
            .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
        f.flush().await.map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
    }

    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn health_is_false_without_status_file() {
        let dir = tempdir().unwrap();
        let transport = FsTransport::new(dir.path());
        assert!(!transport.health().await);
    }

    #[tokio::test]
    async fn health_is_false_when_heartbeat_stale() {
        let dir = tempdir().unwrap();
        let transport = FsTransport::new(dir.path());
        let stale = serde_json::json!({
            "agent_id": "a1",
            "status": "running",
            "timestamp": 0.0,
            "uptime": 0.0,
            "shared_dir": dir.path().to_string_lossy(),
        });
        tokio::fs::write(transport.status_path(), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();
        assert!(!transport.health().await);
    }

    #[tokio::test]
    async fn health_is_true_for_a_fresh_running_heartbeat() {
        let dir = tempdir().unwrap();
        let transport = FsTransport::new(dir.path());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let fresh = serde_json::json!({
            "agent_id": "a1",
            "status": "running",
            "timestamp": now,
            "uptime": 1.0,
            "shared_dir": dir.path().to_string_lossy(),
        });
        tokio::fs::write(transport.status_path(), serde_json::to_vec(&fresh).unwrap())
            .await
            .unwrap();
        assert!(transport.health().await);
    }

    #[tokio::test]
    async fn write_file_round_trips_through_the_request_response_files() {
        let dir = tempdir().unwrap();
        let transport = FsTransport::new(dir.path());

        // Stand in for the guest agent: watch for the request file this
        // write_file() call produces, then drop a matching response.
        let requests_dir = transport.requests_dir();
        let responses_dir = transport.responses_dir();
        let responder = tokio::spawn(async move {
            loop {
                let mut entries = match tokio::fs::read_dir(&requests_dir).await {
                    Ok(e) => e,
                    Err(_) => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        continue;
                    }
                };
                if let Some(entry) = entries.next_entry().await.ok().flatten() {
                    let bytes = tokio::fs::read(entry.path()).await.unwrap();
                    let request: GuestRequest = serde_json::from_slice(&bytes).unwrap();
                    let response = GuestResponse {
                        request_id: request.request_id().to_string(),
                        success: true,
                        stdout: None,
                        stderr: None,
                        return_code: None,
                        error: None,
                        file_path: None,
                        agent_id: None,
                        uptime_seconds: None,
                    };
                    write_atomic(
                        &responses_dir,
                        &format!("{}.json", response.request_id),
                        &serde_json::to_vec(&response).unwrap(),
                    )
                    .await
                    .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        transport.write_file("/tmp/a.txt", "hello").await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn write_atomic_never_leaves_temp_file_behind() {
        let dir = tempdir().unwrap();
        write_atomic(dir.path(), "req.json", b"{}").await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = vec![];
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["req.json".to_string()]);
    }
}
