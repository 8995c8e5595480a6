//! The runtime pool: a bounded set of pre-warmed [`JsRuntime`] instances
//! plus a cache of runtimes that already have a given worker loaded.
//!
//! Grounded in `hyperlight-js`'s `SandboxBuilder`/`ProtoJSSandbox`/
//! `JSSandbox` lifecycle (provision once, reuse many times) and its
//! `crossbeam`-backed dev-dependency idiom for the idle-instance channel.
//! `rquickjs` doesn't offer anything like hyperlight's VM snapshot/restore,
//! so localflare expresses "fresh globals on reuse" differently: a runtime
//! is either *bare* (engine + Web platform globals, no worker script) or
//! *loaded* for exactly one `(worker id, version)` — the pool caches loaded
//! runtimes keyed by that pair rather than caching compiled script text, so
//! a repeat request for the same worker version skips both the QuickJS
//! engine bootstrap and the worker's own module evaluation.

mod metrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use localflare_common::{LocalflareError, Result, WorkerId};
use localflare_runtime::{BindingModule, JsRuntime, Script};
use tracing::{instrument, Level};

use crate::metrics::{
    METRIC_POOL_ACQUIRE_TOTAL, METRIC_POOL_CACHE_HIT_TOTAL, METRIC_POOL_CACHE_MISS_TOTAL,
    METRIC_POOL_CAPACITY, METRIC_POOL_IN_USE,
};

const DEFAULT_POOL_SIZE: usize = 8;

/// Key identifying which worker deployment a loaded runtime is good for.
/// A redeploy bumps `Worker::version`, which invalidates any runtime cached
/// under the old version.
type WorkerVersionKey = (WorkerId, u64);

/// Builds a [`Pool`], pre-warming `size` bare runtimes up front so the
/// first requests to hit the pool don't pay the QuickJS bootstrap cost.
pub struct PoolBuilder {
    size: usize,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn build(self) -> Result<Pool> {
        let (sender, receiver) = crossbeam_channel::bounded(self.size);
        for _ in 0..self.size {
            sender
                .send(JsRuntime::new()?)
                .map_err(|_| LocalflareError::Internal("pool channel closed during warmup".into()))?;
        }
        metrics::gauge!(METRIC_POOL_CAPACITY).set(self.size as f64);
        Ok(Pool(Arc::new(PoolInner {
            idle_bare_tx: sender,
            idle_bare_rx: receiver,
            capacity: self.size,
            live: AtomicUsize::new(self.size),
            idle_loaded: Mutex::new(HashMap::new()),
        })))
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct PoolInner {
    idle_bare_tx: crossbeam_channel::Sender<JsRuntime>,
    idle_bare_rx: crossbeam_channel::Receiver<JsRuntime>,
    capacity: usize,
    live: AtomicUsize,
    idle_loaded: Mutex<HashMap<WorkerVersionKey, Vec<JsRuntime>>>,
}

/// A bounded, pre-warmed set of worker sandboxes.
#[derive(Clone)]
pub struct Pool(Arc<PoolInner>);

/// A snapshot of pool occupancy, surfaced on the admin stats endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle_bare: usize,
    pub idle_loaded: usize,
    pub live: usize,
}

impl Pool {
    /// Check out a runtime loaded with `worker_id`/`version`'s script,
    /// installing `bindings` on it. Prefers an already-loaded idle runtime
    /// for that exact version; falls back to a bare runtime plus a fresh
    /// `load_worker`; blocks (off the async executor) if none are idle.
    ///
    /// `script` and `bindings` are owned rather than borrowed: the whole
    /// load step runs inside `spawn_blocking` (rquickjs evaluation is
    /// synchronous CPU work, never awaited), so nothing here can hold a
    /// borrow across that task boundary.
    #[instrument(err(Debug), skip(self, script, bindings), level = Level::DEBUG)]
    pub async fn acquire(
        &self,
        worker_id: WorkerId,
        version: u64,
        script: Script,
        bindings: Vec<Box<dyn BindingModule>>,
    ) -> Result<PooledRuntime> {
        metrics::counter!(METRIC_POOL_ACQUIRE_TOTAL).increment(1);
        let key = (worker_id, version);

        if let Some(runtime) = self.take_loaded(&key) {
            metrics::counter!(METRIC_POOL_CACHE_HIT_TOTAL).increment(1);
            metrics::gauge!(METRIC_POOL_IN_USE).increment(1);
            return Ok(PooledRuntime {
                runtime: Some(runtime),
                key,
                pool: self.clone(),
            });
        }
        metrics::counter!(METRIC_POOL_CACHE_MISS_TOTAL).increment(1);

        let inner = self.0.clone();
        let runtime = tokio::task::spawn_blocking(move || -> Result<JsRuntime> {
            let runtime = inner
                .idle_bare_rx
                .recv()
                .map_err(|_| LocalflareError::Internal("pool channel closed".into()))?;
            runtime.install_bindings(&bindings)?;
            runtime.load_worker(&script)?;
            Ok(runtime)
        })
        .await
        .map_err(|e| LocalflareError::Internal(format!("pool acquire task panicked: {e}")))??;

        metrics::gauge!(METRIC_POOL_IN_USE).increment(1);
        Ok(PooledRuntime {
            runtime: Some(runtime),
            key,
            pool: self.clone(),
        })
    }

    fn take_loaded(&self, key: &WorkerVersionKey) -> Option<JsRuntime> {
        let mut idle_loaded = self.0.idle_loaded.lock().unwrap();
        let slot = idle_loaded.get_mut(key)?;
        let runtime = slot.pop();
        if slot.is_empty() {
            idle_loaded.remove(key);
        }
        runtime
    }

    /// Evict every idle runtime loaded with any version of `worker_id`
    /// (called on redeploy). Live borrowed runtimes finish their current
    /// request and are simply dropped instead of being returned to the
    /// pool — see [`PooledRuntime::drop`].
    #[instrument(skip(self), level = Level::DEBUG)]
    pub fn invalidate_script(&self, worker_id: WorkerId) {
        let mut idle_loaded = self.0.idle_loaded.lock().unwrap();
        let evicted: Vec<WorkerVersionKey> = idle_loaded
            .keys()
            .filter(|(id, _)| *id == worker_id)
            .copied()
            .collect();
        for key in evicted {
            if let Some(runtimes) = idle_loaded.remove(&key) {
                self.0.live.fetch_sub(runtimes.len(), Ordering::Relaxed);
            }
        }
    }

    /// Current occupancy, for the admin `/stats` endpoint.
    pub fn stats(&self) -> PoolStats {
        let idle_loaded: usize = self.0.idle_loaded.lock().unwrap().values().map(Vec::len).sum();
        PoolStats {
            capacity: self.0.capacity,
            idle_bare: self.0.idle_bare_rx.len(),
            idle_loaded,
            live: self.0.live.load(Ordering::Relaxed),
        }
    }

    fn release(&self, key: WorkerVersionKey, runtime: JsRuntime) {
        metrics::gauge!(METRIC_POOL_IN_USE).decrement(1);
        let mut idle_loaded = self.0.idle_loaded.lock().unwrap();
        idle_loaded.entry(key).or_default().push(runtime);
    }
}

/// An exclusively-checked-out runtime. Returned to the pool's loaded cache
/// on drop, under the `(worker_id, version)` it was acquired for.
pub struct PooledRuntime {
    runtime: Option<JsRuntime>,
    key: WorkerVersionKey,
    pool: Pool,
}

impl std::ops::Deref for PooledRuntime {
    type Target = JsRuntime;
    fn deref(&self) -> &JsRuntime {
        self.runtime.as_ref().expect("runtime taken before drop")
    }
}

impl Drop for PooledRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.pool.release(self.key, runtime);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_common::WorkerId;

    #[tokio::test]
    async fn acquire_loads_worker_and_reuses_on_release() {
        let pool = PoolBuilder::new().with_size(2).build().expect("pool should build");
        let worker_id = WorkerId::new();
        let script = Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith(new Response('hi'));
            });
            "#,
        );

        {
            let _runtime = pool
                .acquire(worker_id, 1, script.clone(), Vec::new())
                .await
                .expect("first acquire should load a bare runtime");
        }
        let stats = pool.stats();
        assert_eq!(stats.idle_loaded, 1);

        let _runtime = pool
            .acquire(worker_id, 1, script.clone(), Vec::new())
            .await
            .expect("second acquire should hit the loaded cache");
        let stats = pool.stats();
        assert_eq!(stats.idle_loaded, 0);
    }

    #[tokio::test]
    async fn invalidate_script_drops_cached_runtimes_for_worker() {
        let pool = PoolBuilder::new().with_size(1).build().expect("pool should build");
        let worker_id = WorkerId::new();
        let script = Script::from_content("export default {};");
        {
            let _runtime = pool.acquire(worker_id, 1, script, Vec::new()).await.unwrap();
        }
        assert_eq!(pool.stats().idle_loaded, 1);

        pool.invalidate_script(worker_id);
        assert_eq!(pool.stats().idle_loaded, 0);
    }
}
