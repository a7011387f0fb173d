//! Front door: resolves a language to its pool, narrows the VM config to
//! policy ceilings, drives one execute, and always returns the VM.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use engine_types::{ExecutionResult, Language, PolicyRef, VmConfig};
use tokio::sync::OnceCell;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::pool::{PoolDebugInfo, VmFactory, VmPool};
use crate::transport::GuestTransport;
use crate::vm::VmHandle;

#[cfg(feature = "transport-net")]
use crate::transport::net::NetTransport as ActiveTransport;
#[cfg(all(feature = "transport-fs", not(feature = "transport-net")))]
use crate::transport::fs::FsTransport as ActiveTransport;

struct LanguageFactory {
    language: Language,
    engine_config: EngineConfig,
}

#[async_trait]
impl VmFactory<ActiveTransport> for LanguageFactory {
    async fn create(&self) -> EngineResult<VmHandle<ActiveTransport>> {
        let config = VmConfig {
            timeout_seconds: 10,
            ..VmConfig::default()
        };

        #[cfg(feature = "transport-net")]
        let (transport, shared_dir) = {
            let guest_ip = crate::network::allocate_guest_ip();
            (ActiveTransport::new(&guest_ip, self.engine_config.guest_port), None)
        };
        #[cfg(all(feature = "transport-fs", not(feature = "transport-net")))]
        let (transport, shared_dir) = {
            let vm_id = uuid::Uuid::new_v4().to_string();
            let dir = format!("{}/{vm_id}", self.engine_config.scratch_root);
            (ActiveTransport::new(dir.clone()), Some(dir))
        };

        crate::network::ensure_bridge(&self.engine_config.bridge_name).await?;
        VmHandle::start(self.language, config, &self.engine_config, transport, shared_dir).await
    }
}

pub struct PoolDebug {
    pub per_language: HashMap<String, PoolDebugInfo>,
}

pub struct Executor {
    engine_config: EngineConfig,
    pools: HashMap<Language, Arc<VmPool<ActiveTransport>>>,
    initialized: OnceCell<()>,
}

impl Executor {
    pub fn new(engine_config: EngineConfig) -> Self {
        let pools = [Language::Python, Language::Rust, Language::TypeScript]
            .into_iter()
            .map(|language| {
                let factory = Arc::new(LanguageFactory {
                    language,
                    engine_config: engine_config.clone(),
                });
                (language, VmPool::new(language, engine_config.pool_target_size, factory))
            })
            .collect();

        Executor {
            engine_config,
            pools,
            initialized: OnceCell::new(),
        }
    }

    /// Idempotent: only the first call actually fills the pools.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                for pool in self.pools.values() {
                    pool.initialize().await;
                }
            })
            .await;
    }

    pub async fn execute(
        &self,
        code: &str,
        language_tag: &str,
        timeout_seconds: u32,
        policy: PolicyRef,
    ) -> ExecutionResult {
        let started = Instant::now();
        self.initialize().await;

        let language = match Language::from_str(language_tag) {
            Ok(l) => l,
            Err(e) => {
                return ExecutionResult::failure("n/a", e.to_string(), started.elapsed().as_secs_f64());
            }
        };

        let pool = match self.pools.get(&language) {
            Some(p) => Arc::clone(p),
            None => {
                return ExecutionResult::failure(
                    "n/a",
                    EngineError::UnsupportedLanguage(language_tag.to_string()).to_string(),
                    started.elapsed().as_secs_f64(),
                )
            }
        };

        let mut vm = match pool.acquire().await {
            Ok(vm) => vm,
            Err(_) => {
                return ExecutionResult::failure(
                    "n/a",
                    EngineError::VmUnavailable {
                        language: language.to_string(),
                    }
                    .to_string(),
                    started.elapsed().as_secs_f64(),
                )
            }
        };

        vm.config.timeout_seconds = timeout_seconds.min(policy.max_timeout_seconds);
        vm.config.memory_mib = vm.config.memory_mib.min(policy.max_memory_mib);

        let result = vm.execute(code).await;

        pool.release(vm, &self.engine_config).await;

        result
    }

    pub async fn pool_debug_info(&self) -> PoolDebug {
        let mut per_language = HashMap::new();
        for (language, pool) in &self.pools {
            per_language.insert(language.to_string(), pool.debug_info().await);
        }
        PoolDebug { per_language }
    }

    /// Stops every pool's available VMs. Idempotent.
    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
    }
}
