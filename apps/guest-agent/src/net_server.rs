//! T-NET mode: serves `/health`, `/execute`, `/write_file` over HTTP on a
//! fixed port reachable from the host over the TAP-bridged network.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use engine_types::ContentEncoding;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::{exec, files};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_GUEST_TIMEOUT: u32 = 30;

struct AgentState {
    agent_id: String,
    started_at: Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    agent_id: String,
    uptime: f64,
}

#[derive(Deserialize)]
struct ExecuteRequest {
    command: String,
    timeout: u32,
}

#[derive(Serialize)]
struct ExecuteResponse {
    success: bool,
    stdout: String,
    stderr: String,
    return_code: i32,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    file_path: String,
    content: String,
    #[serde(default = "default_encoding")]
    encoding: ContentEncoding,
}

fn default_encoding() -> ContentEncoding {
    ContentEncoding::Utf8
}

#[derive(Serialize)]
struct WriteFileResponse {
    success: bool,
    file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health(State(state): State<Arc<AgentState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        agent_id: state.agent_id.clone(),
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

async fn execute(
    Json(req): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let timeout = req.timeout.min(MAX_GUEST_TIMEOUT);
    let outcome = exec::run(&req.command, timeout).await;
    Json(ExecuteResponse {
        success: outcome.success,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        return_code: outcome.return_code,
    })
}

async fn write_file(Json(req): Json<WriteFileRequest>) -> impl IntoResponse {
    let outcome = files::write_file(&req.file_path, &req.content, req.encoding).await;
    Json(WriteFileResponse {
        success: outcome.success,
        file_path: outcome.success.then(|| req.file_path.clone()),
        error: outcome.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_handler_runs_the_command_and_reports_exit_status() {
        let response = execute(Json(ExecuteRequest {
            command: "echo hi".to_string(),
            timeout: 5,
        }))
        .await
        .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn write_file_handler_rejects_paths_outside_tmp() {
        let response = write_file(Json(WriteFileRequest {
            file_path: "/etc/passwd".to_string(),
            content: "x".to_string(),
            encoding: ContentEncoding::Utf8,
        }))
        .await
        .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn health_handler_reports_the_configured_agent_id() {
        let state = Arc::new(AgentState {
            agent_id: "agent-xyz".to_string(),
            started_at: Instant::now(),
        });
        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.agent_id, "agent-xyz");
    }
}

pub async fn serve(config: AgentConfig, port: u16) -> std::io::Result<()> {
    let state = Arc::new(AgentState {
        agent_id: config.agent_id,
        started_at: Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/write_file", post(write_file))
        .with_state(state)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES));

    let addr = format!("0.0.0.0:{port}");
    eprintln!("guest agent listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}
