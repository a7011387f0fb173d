//! Composes the hypervisor client, image manager, network fabric, and
//! guest transport into one microVM's lifecycle: start, execute, reset,
//! stop.

pub mod classify;
pub mod command;

pub use classify::{classify_guest_result, GuestOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use engine_types::{ExecutionResult, Language, VmConfig};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::hypervisor::{process, HypervisorClient};
use crate::image;
use crate::network;
use crate::transport::GuestTransport;

static GUEST_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    New,
    Booting,
    Ready,
    Busy,
    Resetting,
    Dead,
}

/// Every filesystem/network resource owned exclusively by one VM. All are
/// released in every terminal path of `stop()`.
#[derive(Debug, Clone)]
pub struct VmPaths {
    pub control_socket: String,
    pub rootfs_path: String,
    pub base_snapshot_path: String,
    pub mem_snapshot_path: String,
    pub tap_name: String,
    pub systemd_unit: String,
    pub shared_dir: Option<String>,
}

impl VmPaths {
    pub fn new(engine_config: &EngineConfig, vm_id: &str) -> Self {
        let scratch = engine_config.scratch_dir(vm_id);
        VmPaths {
            control_socket: format!("{scratch}/firecracker.sock"),
            rootfs_path: format!("{scratch}/rootfs.ext4"),
            base_snapshot_path: format!("{scratch}/snapshot.state"),
            mem_snapshot_path: format!("{scratch}/snapshot.mem"),
            tap_name: network::tap_name_for(vm_id),
            systemd_unit: format!("fc-{vm_id}.scope"),
            shared_dir: None,
        }
    }
}

pub struct VmHandle<T: GuestTransport> {
    pub id: String,
    pub language: Language,
    pub state: VmState,
    pub config: VmConfig,
    pub paths: VmPaths,
    pub transport: T,
    pub execution_count: u64,
    pub needs_reset: bool,
    pub has_snapshot: bool,
    pub created_at: Instant,
    hypervisor: HypervisorClient,
}

impl<T: GuestTransport> VmHandle<T> {
    /// Runs the full boot sequence: prepare rootfs, attach TAP, spawn the
    /// hypervisor process, configure it, wait for guest readiness, and
    /// attempt a first snapshot. Any failure rolls back the TAP and rootfs
    /// already allocated.
    pub async fn start(
        language: Language,
        config: VmConfig,
        engine_config: &EngineConfig,
        transport: T,
        shared_dir: Option<String>,
    ) -> EngineResult<Self> {
        let id = Uuid::new_v4().to_string()[..8].to_string();
        let mut paths = VmPaths::new(engine_config, &id);
        paths.shared_dir = shared_dir;

        if let Err(e) = image::prepare_rootfs(&engine_config.base_rootfs_path(language), &paths.rootfs_path).await {
            return Err(e);
        }

        if let Err(e) = network::create_tap(&paths.tap_name, &engine_config.bridge_name).await {
            image::cleanup(&[&paths.rootfs_path]).await;
            return Err(e);
        }

        if let Err(e) = process::spawn_scope(&paths.systemd_unit, &paths.control_socket).await {
            network::delete_tap(&paths.tap_name).await.ok();
            image::cleanup(&[&paths.rootfs_path]).await;
            return Err(e);
        }

        let hypervisor = HypervisorClient::new(paths.control_socket.clone());
        hypervisor.wait_ready().await?;

        hypervisor.machine_config(config.vcpus, config.memory_mib).await?;
        hypervisor
            .boot_source(&engine_config.kernel_path(language), "console=ttyS0 reboot=k panic=1")
            .await?;
        hypervisor.drive("rootfs", &paths.rootfs_path, true, false).await?;
        if config.network_enabled {
            hypervisor
                .network_iface("eth0", &mac_for(&id), &paths.tap_name)
                .await?;
        }
        hypervisor.start_instance().await?;

        let mut vm = VmHandle {
            id,
            language,
            state: VmState::Booting,
            config,
            paths,
            transport,
            execution_count: 0,
            needs_reset: false,
            has_snapshot: false,
            created_at: Instant::now(),
            hypervisor,
        };

        vm.wait_guest_ready(engine_config.guest_ready_deadline).await?;
        vm.state = VmState::Ready;

        if let Err(e) = vm
            .hypervisor
            .snapshot_create(&vm.paths.base_snapshot_path, &vm.paths.mem_snapshot_path)
            .await
        {
            warn!(vm_id = %vm.id, op = "snapshot_create", error = %e, "snapshot unavailable, continuing without it");
        } else {
            vm.has_snapshot = true;
        }

        Ok(vm)
    }

    async fn wait_guest_ready(&self, deadline: std::time::Duration) -> EngineResult<()> {
        let started = tokio::time::Instant::now();
        loop {
            if self.transport.health().await {
                let echoed = self
                    .transport
                    .execute(command::echo_ready_command(), 5)
                    .await
                    .ok()
                    .filter(|r| r.success && r.stdout.trim() == "ready");
                if echoed.is_some() {
                    return Ok(());
                }
            }
            if started.elapsed() >= deadline {
                return Err(EngineError::HypervisorUnavailable);
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Runs one submission to completion and translates the result into an
    /// `ExecutionResult`. Always attempts best-effort cleanup afterward.
    pub async fn execute(&mut self, code: &str) -> ExecutionResult {
        let started = Instant::now();
        self.execution_count += 1;
        self.needs_reset = true;
        self.state = VmState::Busy;

        let seq = GUEST_FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        let guest_path = format!("/tmp/user_code_{seq}.{}", self.language.file_extension());

        let result = self.run_submission(code, &guest_path).await;

        let cleanup_result = self
            .transport
            .execute("rm -rf /tmp/user_code_* /tmp/execution_*", 5)
            .await;
        if let Err(e) = cleanup_result {
            warn!(vm_id = %self.id, error = %e, "post-run cleanup failed (best-effort)");
        }

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok((outcome, exec_result)) => {
                info!(vm_id = %self.id, language = %self.language, outcome = ?outcome, "execute complete");
                ExecutionResult {
                    success: exec_result.success,
                    output: exec_result.output,
                    error: exec_result.error,
                    execution_time_seconds: elapsed,
                    vm_id: self.id.clone(),
                }
            }
            Err(e) => {
                warn!(vm_id = %self.id, error = %e, "execute failed");
                ExecutionResult::failure(self.id.clone(), e.to_string(), elapsed)
            }
        }
    }

    async fn run_submission(
        &mut self,
        code: &str,
        guest_path: &str,
    ) -> EngineResult<(GuestOutcome, ExecutionResultParts)> {
        self.transport.write_file(guest_path, code).await?;

        let cmd = command::build_execute_command(self.language, guest_path, self.config.timeout_seconds);
        let exec_result = self.transport.execute(&cmd, self.config.timeout_seconds).await?;

        let outcome = classify_guest_result(self.language, &exec_result);
        let parts = match outcome {
            GuestOutcome::Success => ExecutionResultParts {
                success: true,
                output: exec_result.stdout,
                error: None,
            },
            GuestOutcome::TimedOut => ExecutionResultParts {
                success: false,
                output: String::new(),
                error: Some(format!(
                    "Execution timed out after {} seconds",
                    self.config.timeout_seconds
                )),
            },
            GuestOutcome::Failure => {
                let error = if !exec_result.stderr.is_empty() {
                    exec_result.stderr
                } else if !exec_result.stdout.is_empty() {
                    exec_result.stdout
                } else {
                    "process failed with no error output".to_string()
                };
                ExecutionResultParts {
                    success: false,
                    output: String::new(),
                    error: Some(error),
                }
            }
        };
        Ok((outcome, parts))
    }

    /// Preferred path: snapshot-restore into a fresh hypervisor process.
    /// Falls back to a full rebuild-from-base when no snapshot exists or
    /// the restore fails. Returns false (caller must destroy) if
    /// post-reset health verification fails.
    pub async fn reset(&mut self, engine_config: &EngineConfig) -> bool {
        self.state = VmState::Resetting;

        process::stop_scope(&self.paths.systemd_unit).await;

        let restored = if self.has_snapshot {
            match process::spawn_scope(&self.paths.systemd_unit, &self.paths.control_socket).await {
                Ok(()) => {
                    self.hypervisor = HypervisorClient::new(self.paths.control_socket.clone());
                    let ready = self.hypervisor.wait_ready().await.is_ok();
                    ready
                        && self
                            .hypervisor
                            .snapshot_load(&self.paths.base_snapshot_path, &self.paths.mem_snapshot_path, true)
                            .await
                            .is_ok()
                }
                Err(_) => false,
            }
        } else {
            false
        };

        let rebuilt = if restored {
            true
        } else {
            warn!(vm_id = %self.id, "snapshot restore unavailable, rebuilding from base rootfs");
            self.rebuild_from_base(engine_config).await.is_ok()
        };

        if !rebuilt {
            self.state = VmState::Dead;
            return false;
        }

        if self.wait_guest_ready(engine_config.guest_ready_deadline).await.is_err() {
            self.state = VmState::Dead;
            return false;
        }

        if !self.verify_health_check().await {
            self.state = VmState::Dead;
            return false;
        }

        self.needs_reset = false;
        self.state = VmState::Ready;
        true
    }

    async fn rebuild_from_base(&mut self, engine_config: &EngineConfig) -> EngineResult<()> {
        image::cleanup(&[&self.paths.rootfs_path]).await;
        image::prepare_rootfs(&engine_config.base_rootfs_path(self.language), &self.paths.rootfs_path).await?;

        process::spawn_scope(&self.paths.systemd_unit, &self.paths.control_socket).await?;
        self.hypervisor = HypervisorClient::new(self.paths.control_socket.clone());
        self.hypervisor.wait_ready().await?;
        self.hypervisor
            .machine_config(self.config.vcpus, self.config.memory_mib)
            .await?;
        self.hypervisor
            .boot_source(&engine_config.kernel_path(self.language), "console=ttyS0 reboot=k panic=1")
            .await?;
        self.hypervisor
            .drive("rootfs", &self.paths.rootfs_path, true, false)
            .await?;
        self.hypervisor.start_instance().await?;

        if let Ok(()) = self
            .hypervisor
            .snapshot_create(&self.paths.base_snapshot_path, &self.paths.mem_snapshot_path)
            .await
        {
            self.has_snapshot = true;
        }
        Ok(())
    }

    async fn verify_health_check(&self) -> bool {
        let guest_path = format!("/tmp/health_check_{}.{}", self.id, self.language.file_extension());
        let source = command::health_check_program_source(self.language);
        if self.transport.write_file(&guest_path, &source).await.is_err() {
            return false;
        }
        let cmd = command::build_execute_command(self.language, &guest_path, 10);
        match self.transport.execute(&cmd, 10).await {
            Ok(result) => result.success && result.stdout.contains(command::HEALTH_CHECK_MARKER),
            Err(_) => false,
        }
    }

    /// Idempotent: safe to call more than once. SIGTERMs the hypervisor
    /// (with a SIGKILL fallback via the systemd scope) then releases every
    /// resource this VM owns.
    pub async fn stop(&mut self) {
        process::stop_scope(&self.paths.systemd_unit).await;
        network::delete_tap(&self.paths.tap_name).await.ok();
        image::cleanup(&[
            &self.paths.rootfs_path,
            &self.paths.base_snapshot_path,
            &self.paths.mem_snapshot_path,
        ])
        .await;
        if let Some(shared_dir) = &self.paths.shared_dir {
            let _ = tokio::fs::remove_dir_all(shared_dir).await;
        }
        let _ = tokio::fs::remove_file(&self.paths.control_socket).await;
        self.state = VmState::Dead;
    }
}

struct ExecutionResultParts {
    success: bool,
    output: String,
    error: Option<String>,
}

fn mac_for(vm_id: &str) -> String {
    let hash: u32 = vm_id.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    format!(
        "06:00:{:02x}:{:02x}:{:02x}:{:02x}",
        (hash >> 24) as u8,
        (hash >> 16) as u8,
        (hash >> 8) as u8,
        hash as u8
    )
}
