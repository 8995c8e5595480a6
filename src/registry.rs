//! Ties a registered [`Worker`]'s binding descriptors to live storage
//! backends and schedulers, and resolves them into the `Vec<Box<dyn
//! BindingModule>>` each dispatch needs.
//!
//! Resource names (a KV namespace title, an R2 bucket name, a D1 database
//! name, a queue name) are resolved lazily: the first worker that
//! references one creates it. Durable object namespaces are the
//! exception — a namespace needs its own script and class name, so it's
//! created explicitly through [`AppState::create_do_namespace`] before any
//! worker can bind to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use localflare_bindings::{
    AiBinding, AiGatewayBinding, DurableObjectBinding, DurableObjectDispatcher, KvBinding, ObjectBinding,
    QueueBinding, RelationalBinding, SecretBinding, VectorBinding,
};
use localflare_common::{BindingDescriptor, BindingKind, BucketId, DbId, LocalflareError, NamespaceId, QueueId, Result, Worker};
use localflare_pool::{Pool, PoolBuilder, PoolStats};
use localflare_runtime::{BindingModule, Script};
use localflare_scheduler::{AlarmPoller, DurableObjectScheduler, QueueConsumer, QueueScheduler};
use localflare_storage::{
    DurableObjectStore, GatewayStore, KvStore, MetaDb, ObjectStore, QueueSettings, QueueStore, RelationalStore, VectorStore,
};

use crate::config::Config;

/// Default gateway knobs applied to every `Gateway` binding. There's no
/// admin surface yet for tuning these per gateway, so every one gets the
/// same cache TTL and rate limit.
const GATEWAY_CACHE_TTL_SECS: i64 = 300;
const GATEWAY_RATE_LIMIT: Option<(i64, u64)> = Some((60, 100));

#[derive(Default)]
struct NameCache {
    kv: HashMap<String, NamespaceId>,
    buckets: HashMap<String, BucketId>,
    databases: HashMap<String, DbId>,
    queues: HashMap<String, QueueId>,
    do_namespaces: HashMap<String, NamespaceId>,
}

pub struct AppState {
    pub config: Config,
    pub pool: Pool,
    pub kv_store: Arc<KvStore>,
    pub object_store: Arc<ObjectStore>,
    pub relational_store: Arc<RelationalStore>,
    pub queue_store: Arc<QueueStore>,
    pub do_store: Arc<DurableObjectStore>,
    pub vector_store: Arc<VectorStore>,
    pub gateway_store: Arc<GatewayStore>,
    pub alarm_poller: Arc<AlarmPoller>,
    pub queue_scheduler: Arc<QueueScheduler>,

    workers: RwLock<HashMap<String, Worker>>,
    names: Mutex<NameCache>,
    do_schedulers: Mutex<HashMap<NamespaceId, Arc<DurableObjectScheduler>>>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let meta_db = MetaDb::open(&config.data_dir)?;

        let kv_store = Arc::new(KvStore::new(meta_db.clone()));
        let object_store = Arc::new(ObjectStore::new(meta_db.clone(), &config.data_dir));
        let relational_store = Arc::new(RelationalStore::new(&config.data_dir));
        let queue_store = Arc::new(QueueStore::new(meta_db.clone()));
        let do_store = Arc::new(DurableObjectStore::new(meta_db.clone()));
        let vector_store = Arc::new(VectorStore::new(meta_db.clone()));
        let gateway_store = Arc::new(GatewayStore::new(meta_db));

        let pool = PoolBuilder::new().with_size(config.pool_size).build()?;

        let alarm_poller = AlarmPoller::new(
            do_store.clone(),
            config.alarm_poll_interval(),
            config.alarm_backoff_ms,
            config.alarm_max_retries,
        );
        alarm_poller.spawn();

        let queue_scheduler = QueueScheduler::new(pool.clone(), queue_store.clone(), config.call_timeout(), config.queue_visibility_timeout_secs);

        Ok(Arc::new(Self {
            config,
            pool,
            kv_store,
            object_store,
            relational_store,
            queue_store,
            do_store,
            vector_store,
            gateway_store,
            alarm_poller,
            queue_scheduler,
            workers: RwLock::new(HashMap::new()),
            names: Mutex::new(NameCache::default()),
            do_schedulers: Mutex::new(HashMap::new()),
        }))
    }

    // -- worker registry -------------------------------------------------

    /// Registers a brand-new worker, or redeploys an existing one under the
    /// same name (bumping its version and invalidating cached runtimes).
    /// Fails if any binding descriptor names a resource this process
    /// doesn't know how to resolve.
    pub fn register_worker(
        &self,
        name: &str,
        script: String,
        routes: Vec<String>,
        bindings: HashMap<String, BindingDescriptor>,
    ) -> Result<Worker> {
        let mut workers = self.workers.write().unwrap();
        let worker = match workers.remove(name) {
            Some(mut existing) => {
                existing.redeploy(script);
                existing.routes = routes;
                existing.bindings = bindings;
                existing
            }
            None => {
                let mut fresh = Worker::new(name, script);
                fresh.routes = routes;
                fresh.bindings = bindings;
                fresh
            }
        };
        // Validate eagerly so a typo'd binding target fails at registration
        // time rather than on the worker's first request.
        self.build_bindings(&worker)?;
        if worker.version > 1 {
            self.pool.invalidate_script(worker.id);
        }
        workers.insert(name.to_string(), worker.clone());
        Ok(worker)
    }

    pub fn worker(&self, name: &str) -> Option<Worker> {
        self.workers.read().unwrap().get(name).cloned()
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.workers.read().unwrap().values().cloned().collect()
    }

    // -- durable object namespaces ----------------------------------------

    /// Creates (or returns the existing) durable object namespace `name`,
    /// backed by `script`'s `class_name` export, and wires up its
    /// scheduler so fetches/alarms against its instances can be dispatched.
    pub fn create_do_namespace(self: &Arc<Self>, name: &str, script: String, class_name: &str) -> Result<NamespaceId> {
        let mut names = self.names.lock().unwrap();
        if let Some(id) = names.do_namespaces.get(name) {
            return Ok(*id);
        }
        let id = self.do_store.create_namespace(name, &script, class_name)?;
        let scheduler = DurableObjectScheduler::new(self.do_store.clone(), Script::from_content(script), self.config.call_timeout(), self.config.do_idle_timeout());
        self.alarm_poller.register(id, scheduler.clone());
        self.do_schedulers.lock().unwrap().insert(id, scheduler);
        names.do_namespaces.insert(name.to_string(), id);
        Ok(id)
    }

    // -- queues ------------------------------------------------------------

    /// Creates (or returns the existing) queue `name`, spawning its
    /// background poll task immediately — it's harmless for the task to
    /// run before a consumer is registered, `poll_once` just finds nothing
    /// due.
    pub fn create_queue(self: &Arc<Self>, name: &str, settings: QueueSettings) -> Result<QueueId> {
        let mut names = self.names.lock().unwrap();
        if let Some(id) = names.queues.get(name) {
            return Ok(*id);
        }
        let id = self.queue_store.create_queue(name, &settings)?;
        names.queues.insert(name.to_string(), id);
        self.queue_scheduler.spawn(id, self.config.queue_poll_interval());
        Ok(id)
    }

    /// Points queue `queue_name`'s consumer at worker `worker_name` — every
    /// due batch from here on is dispatched through that worker's current
    /// script and bindings.
    pub fn register_queue_consumer(self: &Arc<Self>, queue_name: &str, worker_name: &str) -> Result<()> {
        let queue = *self
            .names
            .lock()
            .unwrap()
            .queues
            .get(queue_name)
            .ok_or_else(|| LocalflareError::NotFound(format!("queue {queue_name}")))?;
        let worker = self
            .worker(worker_name)
            .ok_or_else(|| LocalflareError::NotFound(format!("worker {worker_name}")))?;

        let state = self.clone();
        let worker_name = worker_name.to_string();
        let bindings: Arc<dyn Fn() -> Vec<Box<dyn BindingModule>> + Send + Sync> = Arc::new(move || {
            state
                .worker(&worker_name)
                .and_then(|w| state.build_bindings(&w).ok())
                .unwrap_or_default()
        });

        self.queue_scheduler.register(
            queue,
            QueueConsumer {
                queue_name: queue_name.to_string(),
                worker_id: worker.id,
                version: worker.version,
                script: Script::from_content(worker.script),
                bindings,
            },
        );
        Ok(())
    }

    // -- vector indexes -----------------------------------------------------

    pub fn create_vector_index(&self, name: &str, dimensions: usize, metric: localflare_storage::Metric) -> Result<()> {
        self.vector_store.create_index(name, dimensions, metric)
    }

    // -- stats --------------------------------------------------------------

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // -- binding resolution ---------------------------------------------

    /// Resolves every one of `worker`'s binding descriptors into an
    /// installable [`BindingModule`]. Runs fresh on every dispatch (and
    /// once, eagerly, at registration) rather than being cached: the
    /// modules themselves are cheap `Arc` clones over shared stores.
    pub fn build_bindings(&self, worker: &Worker) -> Result<Vec<Box<dyn BindingModule>>> {
        let mut out: Vec<Box<dyn BindingModule>> = Vec::with_capacity(worker.bindings.len());
        for (name, descriptor) in &worker.bindings {
            out.push(self.build_one(name, descriptor)?);
        }
        Ok(out)
    }

    fn build_one(&self, name: &str, descriptor: &BindingDescriptor) -> Result<Box<dyn BindingModule>> {
        let target = descriptor.target.as_str();
        match descriptor.kind {
            BindingKind::Kv => {
                let namespace = self.resolve_or_create_kv(target)?;
                Ok(Box::new(KvBinding::new(name, self.kv_store.clone(), namespace)))
            }
            BindingKind::Objects => {
                let bucket = self.resolve_or_create_bucket(target)?;
                Ok(Box::new(ObjectBinding::new(name, self.object_store.clone(), bucket)))
            }
            BindingKind::Relational => {
                let db = self.resolve_or_create_database(target)?;
                Ok(Box::new(RelationalBinding::new(name, self.relational_store.clone(), db)))
            }
            BindingKind::Queue => {
                let queue = *self
                    .names
                    .lock()
                    .unwrap()
                    .queues
                    .get(target)
                    .ok_or_else(|| LocalflareError::NotFound(format!("queue {target}")))?;
                Ok(Box::new(QueueBinding::new(name, self.queue_store.clone(), queue)))
            }
            BindingKind::Do => {
                let namespace = *self
                    .names
                    .lock()
                    .unwrap()
                    .do_namespaces
                    .get(target)
                    .ok_or_else(|| LocalflareError::NotFound(format!("durable object namespace {target}")))?;
                let dispatcher: Arc<dyn DurableObjectDispatcher> = self
                    .do_schedulers
                    .lock()
                    .unwrap()
                    .get(&namespace)
                    .cloned()
                    .ok_or_else(|| LocalflareError::NotFound(format!("durable object namespace {target}")))?;
                Ok(Box::new(DurableObjectBinding::new(name, self.do_store.clone(), namespace, dispatcher)))
            }
            BindingKind::Vector => Ok(Box::new(VectorBinding::new(name, self.vector_store.clone(), target.to_string()))),
            BindingKind::Ai => {
                let base_url = if target.is_empty() { self.config.ai_base_url.clone() } else { target.to_string() };
                Ok(Box::new(AiBinding::new(name, base_url)))
            }
            BindingKind::Gateway => Ok(Box::new(AiGatewayBinding::new(
                name,
                target,
                self.config.ai_base_url.clone(),
                self.gateway_store.clone(),
                GATEWAY_CACHE_TTL_SECS,
                GATEWAY_RATE_LIMIT,
                false,
            ))),
            BindingKind::Secret => Ok(Box::new(SecretBinding::new(name, target))),
        }
    }

    fn resolve_or_create_kv(&self, name: &str) -> Result<NamespaceId> {
        let mut names = self.names.lock().unwrap();
        if let Some(id) = names.kv.get(name) {
            return Ok(*id);
        }
        let id = self.kv_store.create_namespace(name)?;
        names.kv.insert(name.to_string(), id);
        Ok(id)
    }

    fn resolve_or_create_bucket(&self, name: &str) -> Result<BucketId> {
        let mut names = self.names.lock().unwrap();
        if let Some(id) = names.buckets.get(name) {
            return Ok(*id);
        }
        let id = self.object_store.create_bucket(name)?;
        names.buckets.insert(name.to_string(), id);
        Ok(id)
    }

    fn resolve_or_create_database(&self, name: &str) -> Result<DbId> {
        let mut names = self.names.lock().unwrap();
        if let Some(id) = names.databases.get(name) {
            return Ok(*id);
        }
        let id = DbId::new();
        self.relational_store.create_database(id)?;
        names.databases.insert(name.to_string(), id);
        Ok(id)
    }
}
