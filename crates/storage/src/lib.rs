//! Storage backends for every localflare binding: KV, object (R2-style),
//! relational (D1-style), queue, Durable Object, vector index, and AI
//! Gateway state.
//!
//! Everything here is SQLite (`rusqlite`, bundled) plus plain files for
//! object bodies — no external services, matching the single-process
//! local-emulator shape the rest of the workspace is built around. The
//! shared metadata database ([`MetaDb`]) backs every submodule except
//! [`relational`], whose whole point is one independent SQLite file per
//! database id.

pub mod db;
pub mod durable_object;
pub mod gateway;
pub mod kv;
pub mod objects;
pub mod queue;
pub mod relational;
pub mod vector;

pub use db::{now_epoch_millis, now_epoch_seconds, MetaDb};
pub use durable_object::{AlarmRow, DurableObjectStore, InstanceInfo, ListOptions as DoListOptions, NamespaceInfo};
pub use gateway::{GatewayStore, LogEntry as GatewayLogEntry};
pub use kv::{KvListPage, KvPair, KvStore};
pub use objects::{bucket_root, ObjectEntry, ObjectListPage, ObjectMeta, ObjectStore};
pub use queue::{Message, MessageContentType, QueueSettings, QueueStore};
pub use relational::{AllResult, QueryMeta, RelationalStore, RunResult, Row};
pub use vector::{IndexInfo, Match, Metric, QueryOptions as VectorQueryOptions, VectorEntry, VectorStore};
