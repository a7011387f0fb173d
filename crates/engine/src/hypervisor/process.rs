//! Spawns and tears down the hypervisor process backing one VM, under a
//! transient systemd scope so it is tracked and reliably killed on stop.

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

fn test_mode() -> bool {
    std::env::var("ENGINE_TEST_MODE").is_ok()
}

pub async fn spawn_scope(unit: &str, sock_path: &str) -> EngineResult<()> {
    if let Some(dir) = std::path::Path::new(sock_path).parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
    }

    if test_mode() {
        debug!(unit, "ENGINE_TEST_MODE: skipping firecracker scope spawn");
        return Ok(());
    }

    let status = Command::new("sudo")
        .args([
            "systemd-run",
            "--scope",
            "--unit",
            unit,
            "--property",
            "KillMode=mixed",
            "--property",
            "TimeoutStopSec=5s",
            "--",
            "firecracker",
            "--api-sock",
            sock_path,
        ])
        .status()
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;

    if !status.success() {
        return Err(EngineError::InternalResourceError(format!(
            "systemd-run failed to launch firecracker under unit {unit}"
        )));
    }
    Ok(())
}

pub async fn stop_scope(unit: &str) {
    if test_mode() {
        debug!(unit, "ENGINE_TEST_MODE: skipping firecracker scope stop");
        return;
    }
    let status = Command::new("sudo").args(["systemctl", "stop", unit]).status().await;
    if !matches!(status, Ok(s) if s.success()) {
        warn!(unit, "stopping hypervisor scope returned non-success (treated as already stopped)");
    }
}
