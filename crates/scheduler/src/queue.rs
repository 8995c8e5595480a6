//! The queue scheduler: periodically pulls a batch of due messages and
//! drives them through a consumer worker's `queue` handler, then applies
//! whatever ack/retry/dead-letter outcomes it reported back to storage.
//!
//! Unlike durable objects, queue consumers are ordinary stateless workers
//! that may also serve `fetch` traffic, so dispatch goes through the
//! shared [`localflare_pool::Pool`] keyed by `(worker_id, version)` rather
//! than a dedicated runtime — the same worker deployment backing a queue
//! consumer is reused for both event kinds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use localflare_common::{LocalflareError, QueueId, Result, WorkerId};
use localflare_pool::Pool;
use localflare_runtime::{BindingModule, ExecutionContext, QueueBatchInit, QueueMessageInit, Script};
use localflare_storage::QueueStore;
use tokio::sync::Notify;
use tracing::{instrument, Level};

use crate::metrics::{METRIC_QUEUE_BATCH_DISPATCHED_TOTAL, METRIC_QUEUE_MESSAGE_DEAD_LETTERED_TOTAL};

/// A queue's registered consumer: which worker deployment handles its
/// batches, and how to build the bindings it needs each time it's loaded
/// into a fresh pooled runtime.
pub struct QueueConsumer {
    pub queue_name: String,
    pub worker_id: WorkerId,
    pub version: u64,
    pub script: Script,
    pub bindings: Arc<dyn Fn() -> Vec<Box<dyn BindingModule>> + Send + Sync>,
}

pub struct QueueScheduler {
    pool: Pool,
    store: Arc<QueueStore>,
    call_timeout: Duration,
    visibility_timeout_secs: i64,
    consumers: Mutex<HashMap<QueueId, QueueConsumer>>,
    notify: Mutex<HashMap<QueueId, Arc<Notify>>>,
}

impl QueueScheduler {
    pub fn new(pool: Pool, store: Arc<QueueStore>, call_timeout: Duration, visibility_timeout_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            pool,
            store,
            call_timeout,
            visibility_timeout_secs,
            consumers: Mutex::new(HashMap::new()),
            notify: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, queue: QueueId, consumer: QueueConsumer) {
        self.consumers.lock().unwrap().insert(queue, consumer);
    }

    /// The wake handle a producer binding should fire after `send`/`sendBatch`
    /// so a waiting poll loop doesn't sit out its full interval with a
    /// message already eligible.
    pub fn notify_handle(&self, queue: QueueId) -> Arc<Notify> {
        self.notify.lock().unwrap().entry(queue).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    fn notify(&self, queue: QueueId) {
        if let Some(notify) = self.notify.lock().unwrap().get(&queue) {
            notify.notify_one();
        }
    }

    /// Spawns a background task that polls `queue` on `poll_interval`, woken
    /// early by [`Self::notify_handle`] firing on enqueue/ack/retry — the
    /// same "never sleep a fixed timer when there's known work" discipline
    /// alarms use, applied per queue instead of per message.
    pub fn spawn(self: &Arc<Self>, queue: QueueId, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let wake = scheduler.notify_handle(queue);
        tokio::spawn(async move {
            loop {
                let pulled = match scheduler.poll_once(queue).await {
                    Ok(pulled) => pulled,
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "queue poll failed");
                        0
                    }
                };
                if pulled > 0 {
                    // More messages may already be eligible; check again
                    // without waiting out the rest of the interval.
                    continue;
                }
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        })
    }

    /// Pulls one batch (if any is due) and dispatches it. Returns the
    /// number of messages pulled, `0` if none were due.
    #[instrument(skip(self), level = Level::DEBUG)]
    pub async fn poll_once(&self, queue: QueueId) -> Result<usize> {
        let consumer = {
            let consumers = self.consumers.lock().unwrap();
            let consumer = consumers
                .get(&queue)
                .ok_or_else(|| LocalflareError::NotFound(format!("no consumer registered for queue {queue}")))?;
            (
                consumer.queue_name.clone(),
                consumer.worker_id,
                consumer.version,
                consumer.script.clone(),
                consumer.bindings.clone(),
            )
        };
        let (queue_name, worker_id, version, script, bindings_factory) = consumer;

        let settings = self.store.settings(queue)?;
        let messages = self.store.pull(queue, settings.max_batch_size, self.visibility_timeout_secs)?;
        if messages.is_empty() {
            return Ok(0);
        }

        let batch = QueueBatchInit {
            queue_name,
            messages: messages
                .iter()
                .map(|m| QueueMessageInit {
                    id: m.id.clone(),
                    body: m.body.clone(),
                    timestamp_millis: m.created,
                    attempts: m.attempts,
                })
                .collect(),
        };
        let pulled = batch.messages.len();

        let bindings = bindings_factory();
        let runtime = self.pool.acquire(worker_id, version, script, bindings).await?;
        let exec_ctx = ExecutionContext::with_timeout(self.call_timeout);
        let result = runtime.dispatch_queue(batch, &exec_ctx)?;
        drop(runtime);

        metrics::counter!(METRIC_QUEUE_BATCH_DISPATCHED_TOTAL).increment(1);

        let mut settled: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for id in &result.acked {
            self.store.ack(id)?;
            settled.insert(id.as_str());
        }
        for (id, delay_secs) in &result.retried {
            self.store.retry(id, *delay_secs)?;
            settled.insert(id.as_str());
        }

        if result.threw.is_some() {
            for message in &messages {
                if settled.contains(message.id.as_str()) {
                    continue;
                }
                if self.store.dead_letter_if_exhausted(queue, &message.id)? {
                    metrics::counter!(METRIC_QUEUE_MESSAGE_DEAD_LETTERED_TOTAL).increment(1);
                } else {
                    self.store.retry(&message.id, 0)?;
                }
            }
        }

        if !settled.is_empty() {
            self.notify(queue);
        }

        Ok(pulled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_common::WorkerId;
    use localflare_pool::PoolBuilder;
    use localflare_storage::{MessageContentType, MetaDb, QueueSettings};

    fn default_settings() -> QueueSettings {
        QueueSettings {
            delivery_delay_secs: 0,
            message_ttl_secs: 3600,
            max_retries: 2,
            max_batch_size: 10,
            max_batch_timeout_ms: 1000,
            dead_letter_queue: None,
        }
    }

    #[tokio::test]
    async fn successful_batch_acks_every_message() {
        let store = Arc::new(QueueStore::new(MetaDb::open_in_memory().unwrap()));
        let queue = store.create_queue("q", &default_settings()).unwrap();
        store.send(queue, b"one".to_vec(), MessageContentType::Text, None).unwrap();
        store.send(queue, b"two".to_vec(), MessageContentType::Text, None).unwrap();

        let pool = PoolBuilder::new().with_size(1).build().unwrap();
        let scheduler = QueueScheduler::new(pool, store.clone(), Duration::from_secs(5), 30);
        scheduler.register(
            queue,
            QueueConsumer {
                queue_name: "q".to_string(),
                worker_id: WorkerId::new(),
                version: 1,
                script: Script::from_content(
                    r#"
                    addEventListener('queue', async (event) => {
                        event.batch.ackAll();
                    });
                    "#,
                ),
                bindings: Arc::new(Vec::new),
            },
        );

        let pulled = scheduler.poll_once(queue).await.unwrap();
        assert_eq!(pulled, 2);
        assert_eq!(store.queue_depth(queue).unwrap(), 0);
    }

    #[tokio::test]
    async fn thrown_handler_retries_unsettled_messages() {
        let store = Arc::new(QueueStore::new(MetaDb::open_in_memory().unwrap()));
        let queue = store.create_queue("q", &default_settings()).unwrap();
        store.send(queue, b"one".to_vec(), MessageContentType::Text, None).unwrap();

        let pool = PoolBuilder::new().with_size(1).build().unwrap();
        let scheduler = QueueScheduler::new(pool, store.clone(), Duration::from_secs(5), 0);
        scheduler.register(
            queue,
            QueueConsumer {
                queue_name: "q".to_string(),
                worker_id: WorkerId::new(),
                version: 1,
                script: Script::from_content(
                    r#"
                    addEventListener('queue', async (event) => {
                        throw new Error('boom');
                    });
                    "#,
                ),
                bindings: Arc::new(Vec::new),
            },
        );

        scheduler.poll_once(queue).await.unwrap();
        assert_eq!(store.queue_depth(queue).unwrap(), 1, "message should remain queued for retry");

        let batch = store.pull(queue, 10, 0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempts, 2, "one attempt from the initial pull, one from the retry pull");
    }

    #[tokio::test]
    async fn exhausted_retries_move_message_to_dead_letter_queue() {
        let store = Arc::new(QueueStore::new(MetaDb::open_in_memory().unwrap()));
        let dlq = store
            .create_queue("q-dlq", &default_settings())
            .unwrap();
        let mut settings = default_settings();
        settings.max_retries = 1;
        settings.dead_letter_queue = Some(dlq);
        let queue = store.create_queue("q", &settings).unwrap();
        store.send(queue, b"one".to_vec(), MessageContentType::Text, None).unwrap();

        let pool = PoolBuilder::new().with_size(1).build().unwrap();
        let scheduler = QueueScheduler::new(pool, store.clone(), Duration::from_secs(5), 0);
        scheduler.register(
            queue,
            QueueConsumer {
                queue_name: "q".to_string(),
                worker_id: WorkerId::new(),
                version: 1,
                script: Script::from_content(
                    r#"
                    addEventListener('queue', async (event) => {
                        throw new Error('boom');
                    });
                    "#,
                ),
                bindings: Arc::new(Vec::new),
            },
        );

        scheduler.poll_once(queue).await.unwrap();
        assert_eq!(store.queue_depth(queue).unwrap(), 0);
        assert_eq!(store.queue_depth(dlq).unwrap(), 1);
    }
}
