//! Host<->guest RPC. Two interchangeable implementations of one capability;
//! `VmHandle` is generic over `GuestTransport` and never branches on which
//! is in use.

#[cfg(feature = "transport-net")]
pub mod net;

#[cfg(feature = "transport-fs")]
pub mod fs;

use async_trait::async_trait;

use crate::error::EngineResult;

/// Result of one guest `execute` call, before it is classified into an
/// `ExecutionResult`.
#[derive(Debug, Clone)]
pub struct GuestExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

#[async_trait]
pub trait GuestTransport: Send + Sync {
    /// Writes `content` to `path` inside the guest. `path` must be under
    /// `/tmp/`.
    async fn write_file(&self, path: &str, content: &str) -> EngineResult<()>;

    /// Runs `command` inside the guest, bounded by `timeout` seconds.
    async fn execute(&self, command: &str, timeout: u32) -> EngineResult<GuestExecResult>;

    /// Cheap liveness probe used for health-gating and post-failure checks.
    async fn health(&self) -> bool;
}
