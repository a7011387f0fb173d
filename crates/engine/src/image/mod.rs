//! Produces a per-VM writable rootfs from an immutable base image.

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Copies `base_path` to `out_path` using a reflink where the backing
/// filesystem supports it, falling back to a plain copy otherwise.
pub async fn prepare_rootfs(base_path: &str, out_path: &str) -> EngineResult<()> {
    let reflink = Command::new("cp")
        .args(["--reflink=always", base_path, out_path])
        .status()
        .await;

    if let Ok(status) = reflink {
        if status.success() {
            debug!(base_path, out_path, "rootfs reflink-copied");
            return Ok(());
        }
    }

    warn!(base_path, out_path, "reflink unavailable, falling back to full copy");
    let status = Command::new("cp")
        .args([base_path, out_path])
        .status()
        .await
        .map_err(|e| EngineError::InternalResourceError(format!("cp failed: {e}")))?;

    if status.success() {
        Ok(())
    } else {
        Err(EngineError::InternalResourceError(format!(
            "failed to copy {base_path} to {out_path}"
        )))
    }
}

/// Removes every listed path, ignoring entries that are already gone.
pub async fn cleanup(paths: &[&str]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path, "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path, error = %e, "cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn prepare_rootfs_copies_content() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.img");
        let out = dir.path().join("vm.img");
        tokio::fs::write(&base, b"rootfs-bytes").await.unwrap();

        prepare_rootfs(base.to_str().unwrap(), out.to_str().unwrap())
            .await
            .unwrap();

        let copied = tokio::fs::read(&out).await.unwrap();
        assert_eq!(copied, b"rootfs-bytes");
    }

    #[tokio::test]
    async fn cleanup_ignores_missing_files() {
        cleanup(&["/tmp/engine-test-definitely-missing-file"]).await;
    }
}
