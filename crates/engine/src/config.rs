//! Engine-wide tunables, read from the environment once at `Executor::new`,
//! the same pattern the agent binary uses for its own `AppState`.

use std::time::Duration;

use engine_types::Language;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bridge_name: String,
    pub scratch_root: String,
    pub images_root: String,
    pub pool_target_size: usize,
    pub guest_ready_deadline: Duration,
    pub guest_port: u16,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        EngineConfig {
            bridge_name: env_or("ENGINE_BRIDGE", "fcbr0"),
            scratch_root: env_or("ENGINE_SCRATCH_ROOT", "/var/lib/engine/scratch"),
            images_root: env_or("ENGINE_IMAGES_ROOT", "/var/lib/engine/images"),
            pool_target_size: std::env::var("ENGINE_POOL_TARGET_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            guest_ready_deadline: Duration::from_secs(30),
            guest_port: 8081,
        }
    }

    pub fn kernel_path(&self, language: Language) -> String {
        format!("{}/kernels/{}/vmlinux", self.images_root, lang_dir(language))
    }

    pub fn base_rootfs_path(&self, language: Language) -> String {
        format!("{}/rootfs/{}/rootfs.ext4", self.images_root, lang_dir(language))
    }

    pub fn scratch_dir(&self, vm_id: &str) -> String {
        format!("{}/{vm_id}", self.scratch_root)
    }
}

fn lang_dir(language: Language) -> &'static str {
    match language {
        Language::Python => "python",
        Language::Rust => "rust",
        Language::TypeScript => "typescript",
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            bridge_name: "fcbr0".to_string(),
            scratch_root: "/var/lib/engine/scratch".to_string(),
            images_root: "/var/lib/engine/images".to_string(),
            pool_target_size: 3,
            guest_ready_deadline: Duration::from_secs(30),
            guest_port: 8081,
        }
    }

    #[test]
    fn kernel_and_rootfs_paths_are_namespaced_by_language() {
        let cfg = config();
        assert_eq!(cfg.kernel_path(Language::Python), "/var/lib/engine/images/kernels/python/vmlinux");
        assert_eq!(cfg.kernel_path(Language::Rust), "/var/lib/engine/images/kernels/rust/vmlinux");
        assert_eq!(
            cfg.base_rootfs_path(Language::TypeScript),
            "/var/lib/engine/images/rootfs/typescript/rootfs.ext4"
        );
    }

    #[test]
    fn scratch_dir_is_namespaced_by_vm_id() {
        let cfg = config();
        assert_eq!(cfg.scratch_dir("abc123"), "/var/lib/engine/scratch/abc123");
    }
}
