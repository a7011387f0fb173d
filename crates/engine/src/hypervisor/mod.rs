//! Control of a single hypervisor process over its local Unix control socket.
//! JSON request/response mirror Firecracker's own published API surface
//! (machine-config, boot-source, drives, network-interfaces, actions,
//! snapshot create/load).

pub mod process;

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_DEADLINE: Duration = Duration::from_secs(10);

/// Async client for one hypervisor instance's control socket.
pub struct HypervisorClient {
    sock_path: String,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl HypervisorClient {
    pub fn new(sock_path: impl Into<String>) -> Self {
        HypervisorClient {
            sock_path: sock_path.into(),
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
        }
    }

    /// Polls until the control socket exists and answers a trivial GET, or
    /// gives up after the readiness deadline.
    pub async fn wait_ready(&self) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + READY_DEADLINE;
        loop {
            if std::path::Path::new(&self.sock_path).exists() && self.probe().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::HypervisorUnavailable);
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn probe(&self) -> EngineResult<()> {
        self.request(Method::GET, "/", json!({})).await.map(|_| ())
    }

    pub async fn machine_config(&self, vcpus: u32, mem_mib: u32) -> EngineResult<()> {
        self.put(
            "/machine-config",
            json!({ "vcpu_count": vcpus, "mem_size_mib": mem_mib }),
            "machine_config",
        )
        .await
    }

    pub async fn boot_source(&self, kernel_path: &str, boot_args: &str) -> EngineResult<()> {
        self.put(
            "/boot-source",
            json!({ "kernel_image_path": kernel_path, "boot_args": boot_args }),
            "boot_source",
        )
        .await
    }

    pub async fn drive(&self, id: &str, host_path: &str, root: bool, read_only: bool) -> EngineResult<()> {
        self.put(
            &format!("/drives/{id}"),
            json!({
                "drive_id": id,
                "path_on_host": host_path,
                "is_root_device": root,
                "is_read_only": read_only,
            }),
            "drive",
        )
        .await
    }

    pub async fn network_iface(&self, id: &str, mac: &str, tap_name: &str) -> EngineResult<()> {
        self.put(
            &format!("/network-interfaces/{id}"),
            json!({
                "iface_id": id,
                "guest_mac": mac,
                "host_dev_name": tap_name,
            }),
            "network_iface",
        )
        .await
    }

    pub async fn start_instance(&self) -> EngineResult<()> {
        self.put(
            "/actions",
            json!({ "action_type": "InstanceStart" }),
            "start_instance",
        )
        .await
    }

    pub async fn snapshot_create(&self, snapshot_path: &str, mem_path: &str) -> EngineResult<()> {
        self.put(
            "/snapshot/create",
            json!({ "snapshot_path": snapshot_path, "mem_file_path": mem_path }),
            "snapshot_create",
        )
        .await
    }

    pub async fn snapshot_load(&self, snapshot_path: &str, mem_path: &str, resume: bool) -> EngineResult<()> {
        self.put(
            "/snapshot/load",
            json!({
                "snapshot_path": snapshot_path,
                "mem_file_path": mem_path,
                "resume_vm": resume,
            }),
            "snapshot_load",
        )
        .await
    }

    async fn put(&self, path: &str, body: impl Serialize, op: &str) -> EngineResult<()> {
        self.request_named(Method::PUT, path, body, op).await.map(|_| ())
    }

    async fn request(&self, method: Method, path: &str, body: impl Serialize) -> EngineResult<Bytes> {
        self.request_named(method, path, body, path).await
    }

    async fn request_named(
        &self,
        method: Method,
        path: &str,
        body: impl Serialize,
        op: &str,
    ) -> EngineResult<Bytes> {
        let payload = serde_json::to_vec(&body).map_err(|e| EngineError::HypervisorError {
            op: op.to_string(),
            detail: e.to_string(),
        })?;
        let uri = hyperlocal::Uri::new(&self.sock_path, path);
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| EngineError::HypervisorError {
                op: op.to_string(),
                detail: e.to_string(),
            })?;

        let res = self.client.request(req).await.map_err(|e| {
            warn!(op, error = %e, "hypervisor request failed");
            EngineError::HypervisorError {
                op: op.to_string(),
                detail: e.to_string(),
            }
        })?;

        let status = res.status();
        let body_bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| EngineError::HypervisorError {
                op: op.to_string(),
                detail: e.to_string(),
            })?
            .to_bytes();

        if status.as_u16() >= 400 {
            let detail = String::from_utf8_lossy(&body_bytes).to_string();
            return Err(EngineError::HypervisorError {
                op: op.to_string(),
                detail,
            });
        }
        debug!(op, status = %status, "hypervisor request ok");
        Ok(body_bytes)
    }
}
