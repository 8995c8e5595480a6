//! The shared relational metadata database: one process-wide connection
//! guarded by a mutex, matching the single-writer-serialized-by-WAL policy
//! KV/queue/DO/vector/gateway state all share a file under.

use std::path::Path;
use std::sync::{Arc, Mutex};

use localflare_common::Result;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_namespaces (
    id    TEXT PRIMARY KEY,
    title TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS kv_pairs (
    namespace_id TEXT NOT NULL,
    key          TEXT NOT NULL,
    value        BLOB NOT NULL,
    metadata     TEXT,
    expiration   INTEGER,
    PRIMARY KEY (namespace_id, key)
);

CREATE TABLE IF NOT EXISTS r2_buckets (
    id      TEXT PRIMARY KEY,
    name    TEXT NOT NULL,
    created INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS r2_objects (
    bucket_id    TEXT NOT NULL,
    key          TEXT NOT NULL,
    size         INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    etag         TEXT NOT NULL,
    created      INTEGER NOT NULL,
    updated      INTEGER NOT NULL,
    metadata     TEXT,
    PRIMARY KEY (bucket_id, key)
);

CREATE TABLE IF NOT EXISTS relational_databases (
    id   TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queues (
    id                 TEXT PRIMARY KEY,
    name               TEXT NOT NULL,
    delivery_delay     INTEGER NOT NULL DEFAULT 0,
    message_ttl        INTEGER NOT NULL,
    max_retries        INTEGER NOT NULL,
    max_batch_size     INTEGER NOT NULL,
    max_batch_timeout  INTEGER NOT NULL,
    dead_letter_queue  TEXT
);
CREATE TABLE IF NOT EXISTS queue_messages (
    id           TEXT PRIMARY KEY,
    queue_id     TEXT NOT NULL,
    body         BLOB NOT NULL,
    content_type TEXT NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    created      INTEGER NOT NULL,
    visible_at   INTEGER NOT NULL,
    expires_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_messages_eligible
    ON queue_messages (queue_id, visible_at, expires_at, created);

CREATE TABLE IF NOT EXISTS do_namespaces (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    script     TEXT NOT NULL,
    class_name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS do_instances (
    id           TEXT PRIMARY KEY,
    namespace_id TEXT NOT NULL,
    name         TEXT,
    has_storage  INTEGER NOT NULL DEFAULT 0,
    created      INTEGER NOT NULL,
    last_access  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS do_storage (
    instance_id TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       BLOB NOT NULL,
    PRIMARY KEY (instance_id, key)
);
CREATE TABLE IF NOT EXISTS do_alarms (
    instance_id    TEXT PRIMARY KEY,
    scheduled_time INTEGER NOT NULL,
    retry_count    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS vector_indexes (
    name       TEXT PRIMARY KEY,
    dimensions INTEGER NOT NULL,
    metric     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS vectors (
    id         TEXT PRIMARY KEY,
    index_name TEXT NOT NULL,
    namespace  TEXT,
    values_raw BLOB NOT NULL,
    metadata   TEXT
);
CREATE INDEX IF NOT EXISTS idx_vectors_index_name ON vectors (index_name);

CREATE TABLE IF NOT EXISTS gateway_cache (
    gateway_id TEXT NOT NULL,
    cache_key  TEXT NOT NULL,
    response   BLOB NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (gateway_id, cache_key)
);
CREATE TABLE IF NOT EXISTS gateway_log (
    id          TEXT PRIMARY KEY,
    gateway_id  TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    status      INTEGER NOT NULL,
    request     BLOB,
    response    BLOB,
    created     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS gateway_rate_limit (
    gateway_id   TEXT NOT NULL,
    period_start INTEGER NOT NULL,
    count        INTEGER NOT NULL,
    limit_value  INTEGER NOT NULL,
    PRIMARY KEY (gateway_id, period_start)
);
"#;

/// A handle to the shared metadata database. Cheap to clone; every clone
/// shares the same connection and mutex.
#[derive(Clone)]
pub struct MetaDb(Arc<Mutex<Connection>>);

impl MetaDb {
    /// Open (creating if absent) the metadata database at
    /// `<data_dir>/localflare.db`, with WAL journaling and a 5-second busy
    /// timeout so concurrent binding calls never hard-fail on `SQLITE_BUSY`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| localflare_common::LocalflareError::Internal(format!("failed to create data dir: {e}")))?;
        let conn = Connection::open(data_dir.join("localflare.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self(Arc::new(Mutex::new(conn))))
    }

    /// Open a private in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self(Arc::new(Mutex::new(conn))))
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.0.lock().unwrap();
        f(&conn)
    }
}

/// Current epoch-seconds, used throughout storage for expirations and
/// timestamps.
pub fn now_epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current epoch-milliseconds, used for queue/DO-alarm scheduling where
/// second resolution is too coarse.
pub fn now_epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
