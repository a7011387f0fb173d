//! Host bridge and per-VM TAP device lifecycle.
//!
//! The bridge is process-global and idempotent; TAP devices are unique per
//! VM id. All commands are shelled out to `ip`/`sudo` the way the rest of
//! this codebase talks to the network stack; `ENGINE_TEST_MODE` skips the
//! privileged calls so unit tests can run unprivileged.

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

static BRIDGE_LOCK: Mutex<()> = Mutex::const_new(());

fn test_mode() -> bool {
    std::env::var("ENGINE_TEST_MODE").is_ok()
}

/// Idempotently ensures the host bridge exists and is up. Protected by a
/// process-wide lock so concurrent VM starts never race bridge creation.
pub async fn ensure_bridge(bridge: &str) -> EngineResult<()> {
    if test_mode() {
        debug!(bridge, "ENGINE_TEST_MODE: skipping bridge setup");
        return Ok(());
    }
    let _guard = BRIDGE_LOCK.lock().await;

    let exists = Command::new("ip")
        .args(["link", "show", bridge])
        .output()
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;

    if !exists.status.success() {
        let status = Command::new("sudo")
            .args(["-n", "ip", "link", "add", bridge, "type", "bridge"])
            .status()
            .await
            .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
        if !status.success() {
            warn!(bridge, "bridge creation failed, continuing (treated as a warning per policy)");
        }
    }

    let _ = Command::new("sudo")
        .args(["-n", "ip", "link", "set", bridge, "up"])
        .status()
        .await;

    Ok(())
}

/// Creates a TAP device and enslaves it to the bridge, bringing it up.
/// TAP failures are fatal for the owning VM.
pub async fn create_tap(name: &str, bridge: &str) -> EngineResult<()> {
    if test_mode() {
        debug!(name, bridge, "ENGINE_TEST_MODE: skipping TAP creation");
        return Ok(());
    }

    let check = Command::new("ip")
        .args(["link", "show", name])
        .output()
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
    if check.status.success() {
        let _ = Command::new("sudo").args(["-n", "ip", "link", "del", name]).status().await;
    }

    let status = Command::new("sudo")
        .args(["-n", "ip", "tuntap", "add", "dev", name, "mode", "tap"])
        .status()
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
    if !status.success() {
        return Err(EngineError::InternalResourceError(format!(
            "failed to create tap device {name}"
        )));
    }

    let _ = Command::new("sudo")
        .args(["-n", "ip", "link", "set", name, "master", bridge])
        .status()
        .await;
    let status = Command::new("sudo")
        .args(["-n", "ip", "link", "set", name, "up"])
        .status()
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;
    if !status.success() {
        return Err(EngineError::InternalResourceError(format!(
            "failed to bring up tap device {name}"
        )));
    }

    debug!(name, bridge, "tap device attached");
    Ok(())
}

/// Deletes a TAP device. "does not exist" is treated as success.
pub async fn delete_tap(name: &str) -> EngineResult<()> {
    if test_mode() {
        return Ok(());
    }
    let output = Command::new("sudo")
        .args(["-n", "ip", "link", "del", name])
        .output()
        .await
        .map_err(|e| EngineError::InternalResourceError(e.to_string()))?;

    if output.status.success() {
        debug!(name, "tap device deleted");
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Cannot find device") {
        return Ok(());
    }
    warn!(name, %stderr, "tap delete failed");
    Ok(())
}

/// Deterministic TAP name for a given VM id, used by `VmHandle::start`.
pub fn tap_name_for(vm_id: &str) -> String {
    format!("tap{vm_id}")
}

static NEXT_GUEST_HOST_OCTET: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(2);

/// Hands out the next guest IP inside the bridge's link-local /24, so the
/// host never needs to discover it from the guest.
pub fn allocate_guest_ip() -> String {
    let octet = NEXT_GUEST_HOST_OCTET.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % 250 + 2;
    format!("169.254.0.{octet}")
}
