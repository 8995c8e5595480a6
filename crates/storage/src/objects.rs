//! Object bucket storage: bytes on the filesystem under
//! `<data_dir>/r2/<bucket_id>/<key>`, metadata mirrored in the shared
//! relational database. Multipart uploads live entirely in memory until
//! completed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use localflare_common::{BucketId, LocalflareError, Result};
use md5::{Digest, Md5};
use rusqlite::{params, OptionalExtension};

use crate::db::{now_epoch_seconds, MetaDb};

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub etag: String,
    pub created: i64,
    pub updated: i64,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub meta: ObjectMeta,
    pub bytes: Vec<u8>,
}

pub struct ObjectListPage {
    pub objects: Vec<ObjectMeta>,
    /// Prefixes collapsed by a delimiter, not individual objects.
    pub delimited_prefixes: Vec<String>,
    pub cursor: Option<String>,
}

struct PartialUpload {
    bucket: BucketId,
    key: String,
    content_type: String,
    metadata: Option<String>,
    parts: HashMap<u32, Vec<u8>>,
}

/// Object storage facade. The per-bucket reader-writer mutex here
/// serializes writes to the same bucket's files while letting reads proceed
/// concurrently across buckets; the multipart table gets its own lock since
/// it's logically unrelated to any single bucket's committed objects.
pub struct ObjectStore {
    db: MetaDb,
    data_dir: PathBuf,
    bucket_locks: Mutex<HashMap<BucketId, std::sync::Arc<RwLock<()>>>>,
    multipart: Mutex<HashMap<String, PartialUpload>>,
}

impl ObjectStore {
    pub fn new(db: MetaDb, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            data_dir: data_dir.into(),
            bucket_locks: Mutex::new(HashMap::new()),
            multipart: Mutex::new(HashMap::new()),
        }
    }

    fn bucket_lock(&self, bucket: BucketId) -> std::sync::Arc<RwLock<()>> {
        self.bucket_locks
            .lock()
            .unwrap()
            .entry(bucket)
            .or_insert_with(|| std::sync::Arc::new(RwLock::new(())))
            .clone()
    }

    fn bucket_dir(&self, bucket: BucketId) -> PathBuf {
        self.data_dir.join("r2").join(bucket.to_string())
    }

    fn object_path(&self, bucket: BucketId, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(key)
    }

    pub fn create_bucket(&self, name: &str) -> Result<BucketId> {
        let id = BucketId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO r2_buckets (id, name, created) VALUES (?1, ?2, ?3)",
                params![id.to_string(), name, now_epoch_seconds()],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn put(
        &self,
        bucket: BucketId,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: Option<String>,
    ) -> Result<ObjectMeta> {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.write().unwrap();

        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LocalflareError::Internal(format!("failed to create object dir: {e}")))?;
        }
        std::fs::write(&path, &bytes)
            .map_err(|e| LocalflareError::Internal(format!("failed to write object: {e}")))?;

        let etag = format!("{:x}", Md5::digest(&bytes));
        let size = bytes.len() as u64;
        let now = now_epoch_seconds();
        let created = self
            .db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT created FROM r2_objects WHERE bucket_id = ?1 AND key = ?2",
                    params![bucket.to_string(), key],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
            })?
            .unwrap_or(now);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO r2_objects (bucket_id, key, size, content_type, etag, created, updated, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (bucket_id, key) DO UPDATE SET
                     size = excluded.size,
                     content_type = excluded.content_type,
                     etag = excluded.etag,
                     updated = excluded.updated,
                     metadata = excluded.metadata",
                params![
                    bucket.to_string(),
                    key,
                    size as i64,
                    content_type,
                    etag,
                    created,
                    now,
                    metadata
                ],
            )?;
            Ok(())
        })?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            content_type: content_type.to_string(),
            etag,
            created,
            updated: now,
            metadata,
        })
    }

    pub fn get(&self, bucket: BucketId, key: &str) -> Result<Option<ObjectEntry>> {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.read().unwrap();

        let Some(meta) = self.head(bucket, key)? else {
            return Ok(None);
        };
        let bytes = std::fs::read(self.object_path(bucket, key))
            .map_err(|e| LocalflareError::Internal(format!("failed to read object: {e}")))?;
        Ok(Some(ObjectEntry { meta, bytes }))
    }

    pub fn head(&self, bucket: BucketId, key: &str) -> Result<Option<ObjectMeta>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT size, content_type, etag, created, updated, metadata
                 FROM r2_objects WHERE bucket_id = ?1 AND key = ?2",
                params![bucket.to_string(), key],
                |row| {
                    Ok(ObjectMeta {
                        key: key.to_string(),
                        size: row.get::<_, i64>(0)? as u64,
                        content_type: row.get(1)?,
                        etag: row.get(2)?,
                        created: row.get(3)?,
                        updated: row.get(4)?,
                        metadata: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Deleting a missing key is success — same idempotent-delete policy as
    /// the KV store.
    pub fn delete(&self, bucket: BucketId, key: &str) -> Result<()> {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.write().unwrap();

        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM r2_objects WHERE bucket_id = ?1 AND key = ?2",
                params![bucket.to_string(), key],
            )?;
            Ok(())
        })?;
        let _ = std::fs::remove_file(self.object_path(bucket, key));
        Ok(())
    }

    pub fn list(
        &self,
        bucket: BucketId,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        limit: usize,
        start_after: Option<&str>,
    ) -> Result<ObjectListPage> {
        let prefix = prefix.unwrap_or("");
        let after = start_after.unwrap_or("");
        let rows: Vec<ObjectMeta> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, size, content_type, etag, created, updated, metadata
                 FROM r2_objects
                 WHERE bucket_id = ?1 AND key > ?2 AND key LIKE ?3 || '%'
                 ORDER BY key ASC",
            )?;
            let rows = stmt
                .query_map(params![bucket.to_string(), after, prefix], |row| {
                    Ok(ObjectMeta {
                        key: row.get(0)?,
                        size: row.get::<_, i64>(1)? as u64,
                        content_type: row.get(2)?,
                        etag: row.get(3)?,
                        created: row.get(4)?,
                        updated: row.get(5)?,
                        metadata: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut objects = Vec::new();
        let mut delimited_prefixes = Vec::new();
        let mut seen_prefixes = std::collections::HashSet::new();
        for meta in rows {
            if let Some(delim) = delimiter {
                let rest = &meta.key[prefix.len()..];
                if let Some(pos) = rest.find(delim) {
                    let collapsed = format!("{}{}{}", prefix, &rest[..pos], delim);
                    if seen_prefixes.insert(collapsed.clone()) {
                        delimited_prefixes.push(collapsed);
                    }
                    continue;
                }
            }
            objects.push(meta);
            if objects.len() + delimited_prefixes.len() >= limit {
                break;
            }
        }

        let cursor = objects.last().map(|o| o.key.clone());
        Ok(ObjectListPage {
            objects,
            delimited_prefixes,
            cursor,
        })
    }

    pub fn create_multipart_upload(
        &self,
        bucket: BucketId,
        key: &str,
        content_type: &str,
        metadata: Option<String>,
    ) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.multipart.lock().unwrap().insert(
            upload_id.clone(),
            PartialUpload {
                bucket,
                key: key.to_string(),
                content_type: content_type.to_string(),
                metadata,
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    /// Re-uploading an already-used part number silently replaces it — the
    /// last write for a given part number wins.
    pub fn upload_part(&self, upload_id: &str, part_number: u32, bytes: Vec<u8>) -> Result<String> {
        if !(1..=10_000).contains(&part_number) {
            return Err(LocalflareError::InvalidArgument(format!(
                "part number {part_number} out of range [1, 10000]"
            )));
        }
        let etag = format!("{:x}", Md5::digest(&bytes));
        let mut uploads = self.multipart.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| LocalflareError::NotFound(format!("multipart upload {upload_id}")))?;
        upload.parts.insert(part_number, bytes);
        Ok(etag)
    }

    /// Completes the upload: parts are composed in ascending part-number
    /// order into the final object, and the upload id is discarded.
    pub fn complete_multipart_upload(&self, upload_id: &str) -> Result<ObjectMeta> {
        let upload = self
            .multipart
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| LocalflareError::NotFound(format!("multipart upload {upload_id}")))?;

        let mut numbers: Vec<u32> = upload.parts.keys().copied().collect();
        numbers.sort_unstable();
        let mut bytes = Vec::new();
        for number in numbers {
            bytes.extend_from_slice(&upload.parts[&number]);
        }
        self.put(upload.bucket, &upload.key, bytes, &upload.content_type, upload.metadata)
    }

    pub fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        self.multipart.lock().unwrap().remove(upload_id);
        Ok(())
    }

    /// Looks up an in-flight multipart upload by id, returning the key it
    /// was started against so more parts can be uploaded to it.
    pub fn resume_multipart_upload(&self, upload_id: &str) -> Result<String> {
        self.multipart
            .lock()
            .unwrap()
            .get(upload_id)
            .map(|upload| upload.key.clone())
            .ok_or_else(|| LocalflareError::NotFound(format!("multipart upload {upload_id}")))
    }
}

/// Resolve the filesystem path a bucket's contents live under, for callers
/// (tests, admin tooling) that need it directly.
pub fn bucket_root(data_dir: &Path, bucket: BucketId) -> PathBuf {
    data_dir.join("r2").join(bucket.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetaDb;
    use tempfile::tempdir;

    fn store() -> (ObjectStore, BucketId, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = MetaDb::open_in_memory().unwrap();
        let store = ObjectStore::new(db, dir.path());
        let bucket = store.create_bucket("test").unwrap();
        (store, bucket, dir)
    }

    #[test]
    fn put_then_get_round_trips_bytes_and_etag() {
        let (store, bucket, _dir) = store();
        let meta = store
            .put(bucket, "a.txt", b"hello".to_vec(), "text/plain", None)
            .unwrap();
        assert_eq!(meta.etag, format!("{:x}", Md5::digest(b"hello")));
        let entry = store.get(bucket, "a.txt").unwrap().expect("should exist");
        assert_eq!(entry.bytes, b"hello");
        assert_eq!(entry.meta.etag, meta.etag);
    }

    #[test]
    fn multipart_upload_composes_parts_in_ascending_order() {
        let (store, bucket, _dir) = store();
        let upload_id = store
            .create_multipart_upload(bucket, "big.bin", "application/octet-stream", None)
            .unwrap();
        store.upload_part(&upload_id, 2, b"world".to_vec()).unwrap();
        store.upload_part(&upload_id, 1, b"hello ".to_vec()).unwrap();
        let meta = store.complete_multipart_upload(&upload_id).unwrap();
        let entry = store.get(bucket, "big.bin").unwrap().unwrap();
        assert_eq!(entry.bytes, b"hello world");
        assert_eq!(meta.etag, format!("{:x}", Md5::digest(b"hello world")));
    }

    #[test]
    fn re_uploading_a_part_number_replaces_it() {
        let (store, _bucket, _dir) = store();
        let upload_id = store
            .create_multipart_upload(_bucket, "x.bin", "application/octet-stream", None)
            .unwrap();
        store.upload_part(&upload_id, 1, b"first".to_vec()).unwrap();
        store.upload_part(&upload_id, 1, b"second".to_vec()).unwrap();
        let meta = store.complete_multipart_upload(&upload_id).unwrap();
        assert_eq!(meta.size, "second".len() as u64);
    }

    #[test]
    fn list_collapses_past_delimiter_into_common_prefix() {
        let (store, bucket, _dir) = store();
        for key in ["a/1.txt", "a/2.txt", "b.txt"] {
            store
                .put(bucket, key, b"x".to_vec(), "text/plain", None)
                .unwrap();
        }
        let page = store.list(bucket, None, Some("/"), 10, None).unwrap();
        assert_eq!(page.delimited_prefixes, vec!["a/".to_string()]);
        assert_eq!(page.objects.iter().map(|o| o.key.clone()).collect::<Vec<_>>(), vec!["b.txt"]);
    }
}
