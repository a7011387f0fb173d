//! Per-language warm VM queue with target size, background replenishment,
//! and return-or-dispose discipline on release.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_types::{Language, PoolStats};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::transport::GuestTransport;
use crate::vm::VmHandle;

const HEALTH_GATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds a fresh VM for a pool. The concrete transport a VM is handed
/// (T-NET vs T-FS) is the factory's concern, not the pool's.
#[async_trait]
pub trait VmFactory<T: GuestTransport>: Send + Sync {
    async fn create(&self) -> EngineResult<VmHandle<T>>;
}

struct PoolInner<T: GuestTransport> {
    available: VecDeque<VmHandle<T>>,
    active: HashMap<String, ()>,
    stats: PoolStats,
}

pub struct VmPool<T: GuestTransport> {
    pub language: Language,
    target_size: usize,
    inner: tokio::sync::Mutex<PoolInner<T>>,
    factory: Arc<dyn VmFactory<T>>,
}

#[derive(Debug, Clone)]
pub struct PoolDebugInfo {
    pub language: Language,
    pub available: usize,
    pub active: usize,
    pub target: usize,
    pub stats: PoolStats,
}

impl<T: GuestTransport + 'static> VmPool<T> {
    pub fn new(language: Language, target_size: usize, factory: Arc<dyn VmFactory<T>>) -> Arc<Self> {
        Arc::new(VmPool {
            language,
            target_size,
            inner: tokio::sync::Mutex::new(PoolInner {
                available: VecDeque::new(),
                active: HashMap::new(),
                stats: PoolStats::default(),
            }),
            factory,
        })
    }

    /// Fills the pool with `target_size` VMs in parallel. Failures are
    /// logged; the executor is never blocked on a fully-filled pool.
    pub async fn initialize(self: &Arc<Self>) {
        let creations = (0..self.target_size).map(|_| {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.factory.create().await })
        });

        let results = futures::future::join_all(creations).await;
        let mut inner = self.inner.lock().await;
        for result in results {
            match result {
                Ok(Ok(vm)) => {
                    inner.stats.created += 1;
                    inner.available.push_back(vm);
                }
                Ok(Err(e)) => warn!(language = %self.language, error = %e, "initial vm creation failed"),
                Err(e) => warn!(language = %self.language, error = %e, "initial vm creation task panicked"),
            }
        }
        info!(language = %self.language, filled = inner.available.len(), target = self.target_size, "pool initialized");
    }

    /// Pops the oldest Ready VM (FIFO, maximizes page-cache hit rate),
    /// health-gates it, and moves it to the active set. Creates on demand
    /// if the queue is empty.
    pub async fn acquire(self: &Arc<Self>) -> EngineResult<VmHandle<T>> {
        loop {
            let popped = {
                let mut inner = self.inner.lock().await;
                inner.available.pop_front()
            };

            let (vm, was_warm) = match popped {
                Some(vm) => (vm, true),
                None => {
                    let mut inner = self.inner.lock().await;
                    inner.stats.misses += 1;
                    drop(inner);
                    let vm = self.factory.create().await?;
                    let mut inner = self.inner.lock().await;
                    inner.stats.created += 1;
                    (vm, false)
                }
            };

            let healthy = tokio::time::timeout(HEALTH_GATE_TIMEOUT, vm.transport.health())
                .await
                .unwrap_or(false);

            if !healthy {
                self.destroy(vm).await;
                continue;
            }

            {
                let mut inner = self.inner.lock().await;
                if was_warm {
                    inner.stats.hits += 1;
                }
                inner.active.insert(vm.id.clone(), ());
            }

            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.replenish().await;
            });

            return Ok(vm);
        }
    }

    /// Returns a VM after use: reset-and-keep if there's room, otherwise
    /// destroy. Never blocks on a full pool.
    pub async fn release(self: &Arc<Self>, mut vm: VmHandle<T>, engine_config: &EngineConfig) {
        {
            let mut inner = self.inner.lock().await;
            inner.active.remove(&vm.id);
            inner.stats.executions += 1;
        }

        let queue_len = self.inner.lock().await.available.len();
        if queue_len < self.target_size {
            if vm.needs_reset {
                if vm.reset(engine_config).await {
                    let mut inner = self.inner.lock().await;
                    inner.available.push_back(vm);
                    return;
                }
            } else {
                let mut inner = self.inner.lock().await;
                inner.available.push_back(vm);
                return;
            }
            self.destroy(vm).await;
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.replenish().await;
            });
        } else {
            self.destroy(vm).await;
        }
    }

    /// Background top-up: stops at the first failure to avoid a hot loop;
    /// the next acquire miss retries.
    pub async fn replenish(self: &Arc<Self>) {
        loop {
            let need_more = {
                let inner = self.inner.lock().await;
                inner.available.len() < self.target_size
            };
            if !need_more {
                return;
            }
            match self.factory.create().await {
                Ok(vm) => {
                    let mut inner = self.inner.lock().await;
                    inner.stats.created += 1;
                    inner.available.push_back(vm);
                }
                Err(e) => {
                    warn!(language = %self.language, error = %e, "replenish failed, will retry on next acquire miss");
                    return;
                }
            }
        }
    }

    async fn destroy(&self, mut vm: VmHandle<T>) {
        vm.stop().await;
        let mut inner = self.inner.lock().await;
        inner.active.remove(&vm.id);
        inner.stats.destroyed += 1;
    }

    pub async fn debug_info(&self) -> PoolDebugInfo {
        let inner = self.inner.lock().await;
        PoolDebugInfo {
            language: self.language,
            available: inner.available.len(),
            active: inner.active.len(),
            target: self.target_size,
            stats: inner.stats.clone(),
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        while let Some(mut vm) = inner.available.pop_front() {
            vm.stop().await;
            inner.stats.destroyed += 1;
        }
    }
}
