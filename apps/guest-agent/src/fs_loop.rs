//! T-FS mode: polls a shared directory for request files instead of
//! serving HTTP, for guests without a TAP-bridged network.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use engine_types::{GuestRequest, GuestResponse};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::{exec, files};

const POLL_INTERVAL: Duration = Duration::from_millis(100); // 10 Hz
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500); // 2 Hz

pub async fn run(config: AgentConfig) -> std::io::Result<()> {
    let shared_dir = config
        .shared_dir
        .clone()
        .unwrap_or_else(|| "/mnt/shared".to_string());
    let root = PathBuf::from(&shared_dir);
    let requests_dir = root.join("requests");
    let responses_dir = root.join("responses");
    let status_path = root.join("guest_status.json");

    tokio::fs::create_dir_all(&requests_dir).await?;
    tokio::fs::create_dir_all(&responses_dir).await?;

    let agent_id = config.agent_id.clone();
    let started_at = Instant::now();
    let heartbeat_status_path = status_path.clone();
    let heartbeat_agent_id = agent_id.clone();
    let heartbeat_shared_dir = shared_dir.clone();
    tokio::spawn(async move {
        loop {
            write_status(
                &heartbeat_status_path,
                &heartbeat_agent_id,
                "running",
                started_at.elapsed().as_secs_f64(),
                &heartbeat_shared_dir,
            )
            .await;
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        }
    });

    eprintln!("guest agent polling {}", requests_dir.display());
    loop {
        let mut entries = match tokio::fs::read_dir(&requests_dir).await {
            Ok(e) => e,
            Err(_) => {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }

        for path in paths {
            // Delete before processing so a crash mid-handling never
            // reprocesses the same request.
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            let _ = tokio::fs::remove_file(&path).await;

            let request: GuestRequest = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(_) => continue,
            };

            let response = handle(request).await;
            let _ = write_response(&responses_dir, &response).await;
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn handle(request: GuestRequest) -> GuestResponse {
    match request {
        GuestRequest::Execute {
            request_id,
            command,
            timeout,
        } => {
            let outcome = exec::run(&command, timeout).await;
            GuestResponse {
                request_id,
                success: outcome.success,
                stdout: Some(outcome.stdout),
                stderr: Some(outcome.stderr),
                return_code: Some(outcome.return_code),
                error: None,
                file_path: None,
                agent_id: None,
                uptime_seconds: None,
            }
        }
        GuestRequest::WriteFile {
            request_id,
            file_path,
            content,
            encoding,
        } => {
            let outcome = files::write_file(&file_path, &content, encoding).await;
            GuestResponse {
                request_id,
                success: outcome.success,
                stdout: None,
                stderr: None,
                return_code: None,
                error: outcome.error,
                file_path: outcome.success.then_some(file_path),
                agent_id: None,
                uptime_seconds: None,
            }
        }
        GuestRequest::Health { request_id } => GuestResponse {
            request_id,
            success: true,
            stdout: None,
            stderr: None,
            return_code: None,
            error: None,
            file_path: None,
            agent_id: None,
            uptime_seconds: None,
        },
    }
}

async fn write_response(responses_dir: &Path, response: &GuestResponse) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(response)?;
    write_atomic(responses_dir, &format!("{}.json", response.request_id), &bytes).await
}

async fn write_status(
    status_path: &Path,
    agent_id: &str,
    status: &str,
    uptime_seconds: f64,
    shared_dir: &str,
) {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let body = serde_json::json!({
        "agent_id": agent_id,
        "status": status,
        "timestamp": timestamp,
        "uptime": uptime_seconds,
        "shared_dir": shared_dir,
    });
    if let Ok(bytes) = serde_json::to_vec(&body) {
        let dir = status_path.parent().unwrap_or(Path::new("."));
        let name = status_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("guest_status.json");
        let _ = write_atomic(dir, name, &bytes).await;
    }
}

async fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> std::io::Result<()> {
    let tmp_name = format!(".{name}.{}.tmp", Uuid::new_v4());
    let tmp_path = dir.join(&tmp_name);
    let final_path = dir.join(name);
    {
        let mut f = tokio::fs::File::create(&tmp_path).await?;
        f.write_all(data).await?;
        f.flush().await?;
    }
    tokio::fs::rename(&tmp_path, &final_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_types::ContentEncoding;

    #[tokio::test]
    async fn handle_execute_runs_the_command_and_echoes_the_request_id() {
        let response = handle(GuestRequest::Execute {
            request_id: "r1".to_string(),
            command: "echo hi".to_string(),
            timeout: 5,
        })
        .await;
        assert_eq!(response.request_id, "r1");
        assert!(response.success);
        assert_eq!(response.stdout.as_deref(), Some("hi\n"));
    }

    #[tokio::test]
    async fn handle_write_file_rejects_paths_outside_tmp() {
        let response = handle(GuestRequest::WriteFile {
            request_id: "r2".to_string(),
            file_path: "/etc/passwd".to_string(),
            content: "x".to_string(),
            encoding: ContentEncoding::Utf8,
        })
        .await;
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn handle_health_always_succeeds() {
        let response = handle(GuestRequest::Health {
            request_id: "r3".to_string(),
        })
        .await;
        assert!(response.success);
        assert_eq!(response.request_id, "r3");
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(dir.path(), "out.json", b"{}").await.unwrap();
        let mut leftovers = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Ok(Some(entry)) = leftovers.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["out.json".to_string()]);
    }

    #[tokio::test]
    async fn write_response_names_the_file_after_the_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let response = GuestResponse {
            request_id: "abc".to_string(),
            success: true,
            stdout: None,
            stderr: None,
            return_code: None,
            error: None,
            file_path: None,
            agent_id: None,
            uptime_seconds: None,
        };
        write_response(dir.path(), &response).await.unwrap();
        assert!(dir.path().join("abc.json").exists());
    }
}
