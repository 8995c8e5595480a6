//! KV namespace/pair storage — keys unique per namespace, values opaque
//! bytes, optional metadata and absolute epoch-second expiration.

use localflare_common::{NamespaceId, Result};
use rusqlite::{params, OptionalExtension};

use crate::db::{now_epoch_seconds, MetaDb};

pub struct KvStore {
    db: MetaDb,
}

#[derive(Debug, Clone)]
pub struct KvPair {
    pub value: Vec<u8>,
    pub metadata: Option<String>,
}

pub struct KvListPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
}

impl KvStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn create_namespace(&self, title: &str) -> Result<NamespaceId> {
        let id = NamespaceId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_namespaces (id, title) VALUES (?1, ?2)",
                params![id.to_string(), title],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// `get` returns `None` for an absent key *or* an expired one — the
    /// value bytes may still be on disk, but expiration makes it invisible.
    pub fn get(&self, namespace: NamespaceId, key: &str) -> Result<Option<KvPair>> {
        let now = now_epoch_seconds();
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT value, metadata, expiration FROM kv_pairs
                     WHERE namespace_id = ?1 AND key = ?2",
                    params![namespace.to_string(), key],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok(match row {
                Some((_, _, Some(expiration))) if expiration <= now => None,
                Some((value, metadata, _)) => Some(KvPair { value, metadata }),
                None => None,
            })
        })
    }

    pub fn put(
        &self,
        namespace: NamespaceId,
        key: &str,
        value: Vec<u8>,
        metadata: Option<String>,
        expiration: Option<i64>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_pairs (namespace_id, key, value, metadata, expiration)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (namespace_id, key) DO UPDATE SET
                     value = excluded.value,
                     metadata = excluded.metadata,
                     expiration = excluded.expiration",
                params![namespace.to_string(), key, value, metadata, expiration],
            )?;
            Ok(())
        })
    }

    /// Deleting a missing key is success, not `not-found` — storage-level
    /// deletes are the one idempotent error case bindings recover from
    /// locally rather than propagating.
    pub fn delete(&self, namespace: NamespaceId, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv_pairs WHERE namespace_id = ?1 AND key = ?2",
                params![namespace.to_string(), key],
            )?;
            Ok(())
        })
    }

    pub fn list(
        &self,
        namespace: NamespaceId,
        prefix: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<KvListPage> {
        let now = now_epoch_seconds();
        self.db.with_conn(|conn| {
            let prefix_clause = prefix.unwrap_or("");
            let upper = prefix_upper_bound(prefix_clause);
            let after = cursor.unwrap_or("");
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_pairs
                 WHERE namespace_id = ?1
                   AND key > ?2
                   AND key >= ?3 AND key < ?4
                   AND (expiration IS NULL OR expiration > ?5)
                 ORDER BY key ASC
                 LIMIT ?6",
            )?;
            let keys: Vec<String> = stmt
                .query_map(
                    params![
                        namespace.to_string(),
                        after,
                        prefix_clause,
                        upper,
                        now,
                        (limit + 1) as i64
                    ],
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<_>>()?;
            let mut keys = keys;
            let cursor = if keys.len() > limit {
                keys.truncate(limit);
                keys.last().cloned()
            } else {
                None
            };
            Ok(KvListPage { keys, cursor })
        })
    }
}

/// A half-open upper bound string for a lexicographic prefix scan: any key
/// with prefix `p` sorts strictly below `p` with its last byte incremented
/// (or below `\u{10FFFF}`-padding conceptually, approximated here by
/// appending the max byte since SQLite compares TEXT bytewise).
fn prefix_upper_bound(prefix: &str) -> String {
    if prefix.is_empty() {
        return "\u{10FFFF}".repeat(8);
    }
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.last() {
        if *last == 0xFF {
            bytes.pop();
        } else {
            let new_last = *last + 1;
            *bytes.last_mut().unwrap() = new_last;
            break;
        }
    }
    if bytes.is_empty() {
        "\u{10FFFF}".repeat(8)
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetaDb;

    fn store() -> (KvStore, NamespaceId) {
        let db = MetaDb::open_in_memory().unwrap();
        let store = KvStore::new(db);
        let ns = store.create_namespace("test").unwrap();
        (store, ns)
    }

    #[test]
    fn put_then_get_round_trips_bytes() {
        let (store, ns) = store();
        store.put(ns, "a", b"hello".to_vec(), None, None).unwrap();
        let pair = store.get(ns, "a").unwrap().expect("should exist");
        assert_eq!(pair.value, b"hello");
    }

    #[test]
    fn get_returns_none_after_expiration() {
        let (store, ns) = store();
        store
            .put(ns, "a", b"hello".to_vec(), None, Some(now_epoch_seconds() - 10))
            .unwrap();
        assert!(store.get(ns, "a").unwrap().is_none());
    }

    #[test]
    fn delete_of_missing_key_is_success() {
        let (store, ns) = store();
        assert!(store.delete(ns, "missing").is_ok());
    }

    #[test]
    fn list_filters_by_prefix_in_ascending_order() {
        let (store, ns) = store();
        for key in ["b/1", "a/1", "a/2", "c/1"] {
            store.put(ns, key, b"x".to_vec(), None, None).unwrap();
        }
        let page = store.list(ns, Some("a/"), 10, None).unwrap();
        assert_eq!(page.keys, vec!["a/1", "a/2"]);
    }
}
