//! Durable Object storage: namespace/instance registry, per-instance
//! ordered key-value storage, and the single pending alarm row per
//! instance.

use localflare_common::{LocalflareError, NamespaceId, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::{now_epoch_millis, MetaDb};

pub struct DurableObjectStore {
    db: MetaDb,
}

#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub id: NamespaceId,
    pub name: String,
    pub script: String,
    pub class_name: String,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub namespace_id: NamespaceId,
    pub name: Option<String>,
    pub has_storage: bool,
    pub created: i64,
    pub last_access: i64,
}

#[derive(Debug, Clone)]
pub struct AlarmRow {
    pub instance_id: String,
    pub scheduled_time: i64,
    pub retry_count: u32,
}

pub struct ListOptions<'a> {
    pub start: Option<&'a str>,
    pub end: Option<&'a str>,
    pub prefix: Option<&'a str>,
    pub reverse: bool,
    pub limit: usize,
}

impl DurableObjectStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn create_namespace(&self, name: &str, script: &str, class_name: &str) -> Result<NamespaceId> {
        let id = NamespaceId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO do_namespaces (id, name, script, class_name) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), name, script, class_name],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn namespace(&self, id: NamespaceId) -> Result<NamespaceInfo> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, script, class_name FROM do_namespaces WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(NamespaceInfo {
                        id: row.get::<_, String>(0)?.parse().unwrap_or(id),
                        name: row.get(1)?,
                        script: row.get(2)?,
                        class_name: row.get(3)?,
                    })
                },
            )
            .map_err(Into::into)
        })
    }

    pub fn instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, namespace_id, name, has_storage, created, last_access
                 FROM do_instances WHERE id = ?1",
                params![instance_id],
                |row| {
                    Ok(InstanceInfo {
                        id: row.get(0)?,
                        namespace_id: row.get::<_, String>(1)?.parse().map_err(|_| {
                            rusqlite::Error::InvalidColumnType(1, "namespace_id".into(), rusqlite::types::Type::Text)
                        })?,
                        name: row.get(2)?,
                        has_storage: row.get::<_, i64>(3)? != 0,
                        created: row.get(4)?,
                        last_access: row.get(5)?,
                    })
                },
            )
            .map_err(Into::into)
        })
    }

    /// A stable hex id derived deterministically from a UTF-8 name — the
    /// same input always names the same instance.
    pub fn id_from_name(&self, namespace: NamespaceId, name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn id_from_string(&self, id: &str) -> Result<String> {
        if id.len() != 64 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LocalflareError::InvalidArgument(format!("not a valid instance id: {id}")));
        }
        Ok(id.to_string())
    }

    pub fn new_unique_id(&self) -> String {
        hex::encode(Sha256::digest(Uuid::new_v4().as_bytes()))
    }

    /// Resolves (creating on first use) the instance row for `id`.
    pub fn ensure_instance(&self, namespace: NamespaceId, id: &str) -> Result<InstanceInfo> {
        let now = now_epoch_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO do_instances (id, namespace_id, name, has_storage, created, last_access)
                 VALUES (?1, ?2, NULL, 0, ?3, ?3)
                 ON CONFLICT (id) DO UPDATE SET last_access = excluded.last_access",
                params![id, namespace.to_string(), now],
            )?;
            conn.query_row(
                "SELECT id, namespace_id, name, has_storage, created, last_access
                 FROM do_instances WHERE id = ?1",
                params![id],
                |row| {
                    Ok(InstanceInfo {
                        id: row.get(0)?,
                        namespace_id: row.get::<_, String>(1)?.parse().unwrap_or(namespace),
                        name: row.get(2)?,
                        has_storage: row.get::<_, i64>(3)? != 0,
                        created: row.get(4)?,
                        last_access: row.get(5)?,
                    })
                },
            )
            .map_err(Into::into)
        })
    }

    pub fn get(&self, instance_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM do_storage WHERE instance_id = ?1 AND key = ?2",
                params![instance_id, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn get_multiple(&self, instance_id: &str, keys: &[String]) -> Result<Vec<(String, Option<Vec<u8>>)>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get(instance_id, key)?)))
            .collect()
    }

    pub fn put(&self, instance_id: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO do_storage (instance_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (instance_id, key) DO UPDATE SET value = excluded.value",
                params![instance_id, key, value],
            )?;
            conn.execute(
                "UPDATE do_instances SET has_storage = 1 WHERE id = ?1",
                params![instance_id],
            )?;
            Ok(())
        })
    }

    pub fn put_multiple(&self, instance_id: &str, entries: &[(String, Vec<u8>)]) -> Result<()> {
        for (key, value) in entries {
            self.put(instance_id, key, value.clone())?;
        }
        Ok(())
    }

    /// Deleting a missing key is success — same idempotent-delete policy
    /// shared with KV and object storage.
    pub fn delete(&self, instance_id: &str, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM do_storage WHERE instance_id = ?1 AND key = ?2",
                params![instance_id, key],
            )?;
            Ok(())
        })
    }

    pub fn delete_multiple(&self, instance_id: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(instance_id, key)?;
        }
        Ok(())
    }

    pub fn delete_all(&self, instance_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM do_storage WHERE instance_id = ?1", params![instance_id])?;
            Ok(())
        })
    }

    pub fn list(&self, instance_id: &str, options: &ListOptions<'_>) -> Result<Vec<(String, Vec<u8>)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM do_storage WHERE instance_id = ?1 ORDER BY key ASC",
            )?;
            let rows: Vec<(String, Vec<u8>)> = stmt
                .query_map(params![instance_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;

            let mut filtered: Vec<(String, Vec<u8>)> = rows
                .into_iter()
                .filter(|(key, _)| options.start.is_none_or(|s| key.as_str() >= s))
                .filter(|(key, _)| options.end.is_none_or(|e| key.as_str() < e))
                .filter(|(key, _)| options.prefix.is_none_or(|p| key.starts_with(p)))
                .collect();

            if options.reverse {
                filtered.reverse();
            }
            if options.limit > 0 {
                filtered.truncate(options.limit);
            }
            Ok(filtered)
        })
    }

    /// Replaces any existing alarm for `instance_id` with the new time.
    pub fn set_alarm(&self, instance_id: &str, scheduled_time: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO do_alarms (instance_id, scheduled_time, retry_count)
                 VALUES (?1, ?2, 0)
                 ON CONFLICT (instance_id) DO UPDATE SET
                     scheduled_time = excluded.scheduled_time,
                     retry_count = 0",
                params![instance_id, scheduled_time],
            )?;
            Ok(())
        })
    }

    pub fn delete_alarm(&self, instance_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM do_alarms WHERE instance_id = ?1", params![instance_id])?;
            Ok(())
        })
    }

    /// Atomically removes and returns the current alarm row for
    /// `instance_id`. The scheduler calls this at the start of dispatch so
    /// the alarm is gone the instant the handler begins running rather than
    /// after it returns — a crash mid-handler doesn't leave the alarm due
    /// forever, and a throwing handler re-inserts it via
    /// [`Self::reschedule_failed_alarm`] carrying the row's `retry_count`
    /// forward.
    pub fn take_alarm(&self, instance_id: &str) -> Result<Option<AlarmRow>> {
        self.db.with_conn(|conn| {
            let row: Option<AlarmRow> = conn
                .query_row(
                    "SELECT instance_id, scheduled_time, retry_count FROM do_alarms WHERE instance_id = ?1",
                    params![instance_id],
                    |row| {
                        Ok(AlarmRow {
                            instance_id: row.get(0)?,
                            scheduled_time: row.get(1)?,
                            retry_count: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            if row.is_some() {
                conn.execute("DELETE FROM do_alarms WHERE instance_id = ?1", params![instance_id])?;
            }
            Ok(row)
        })
    }

    /// All alarms due by `now`, ascending by `scheduled_time` (ties broken
    /// arbitrarily, i.e. by whatever secondary order SQLite returns them).
    pub fn due_alarms(&self, now: i64) -> Result<Vec<AlarmRow>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT instance_id, scheduled_time, retry_count FROM do_alarms
                 WHERE scheduled_time <= ?1 ORDER BY scheduled_time ASC",
            )?;
            let rows = stmt
                .query_map(params![now], |row| {
                    Ok(AlarmRow {
                        instance_id: row.get(0)?,
                        scheduled_time: row.get(1)?,
                        retry_count: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<_>>()?;
            Ok(rows)
        })
    }

    /// Re-inserts a failed alarm at an exponentially backed-off time.
    /// `retry_count` is the number of failures already charged against this
    /// alarm (carried forward by the caller from the row `take_alarm`
    /// returned, since that call already deleted it); returns `false`
    /// without writing a row once `retry_count` reaches `max_retries`,
    /// signalling the caller to give up and just log.
    pub fn reschedule_failed_alarm(&self, instance_id: &str, retry_count: u32, backoff_ms: i64, max_retries: u32) -> Result<bool> {
        if retry_count >= max_retries {
            return Ok(false);
        }
        self.db.with_conn(|conn| {
            // Exponential: doubles per retry, capped so the shift can't overflow.
            let scaled_backoff = backoff_ms.saturating_mul(1i64 << retry_count.min(20));
            conn.execute(
                "INSERT INTO do_alarms (instance_id, scheduled_time, retry_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (instance_id) DO UPDATE SET
                     scheduled_time = excluded.scheduled_time,
                     retry_count = excluded.retry_count",
                params![instance_id, now_epoch_millis() + scaled_backoff, retry_count + 1],
            )?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetaDb;

    #[test]
    fn id_from_name_is_deterministic() {
        let store = DurableObjectStore::new(MetaDb::open_in_memory().unwrap());
        let ns = NamespaceId::new();
        let a = store.id_from_name(ns, "room");
        let b = store.id_from_name(ns, "room");
        assert_eq!(a, b);
    }

    #[test]
    fn put_then_get_round_trips_bytes() {
        let store = DurableObjectStore::new(MetaDb::open_in_memory().unwrap());
        let ns = NamespaceId::new();
        let id = store.id_from_name(ns, "room");
        store.ensure_instance(ns, &id).unwrap();
        store.put(&id, "k", b"v".to_vec()).unwrap();
        assert_eq!(store.get(&id, "k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn list_with_prefix_is_ascending_and_reverse_flips_it() {
        let store = DurableObjectStore::new(MetaDb::open_in_memory().unwrap());
        let ns = NamespaceId::new();
        let id = store.id_from_name(ns, "room");
        store.ensure_instance(ns, &id).unwrap();
        for key in ["a", "b", "c"] {
            store.put(&id, key, b"x".to_vec()).unwrap();
        }
        let ascending = store
            .list(&id, &ListOptions { start: None, end: None, prefix: None, reverse: false, limit: 0 })
            .unwrap();
        assert_eq!(ascending.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let descending = store
            .list(&id, &ListOptions { start: None, end: None, prefix: None, reverse: true, limit: 0 })
            .unwrap();
        assert_eq!(descending.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec!["c", "b", "a"]);
    }

    #[test]
    fn namespace_and_instance_getters_round_trip() {
        let store = DurableObjectStore::new(MetaDb::open_in_memory().unwrap());
        let ns = store.create_namespace("Room", "export default {};", "Room").unwrap();
        let info = store.namespace(ns).unwrap();
        assert_eq!(info.name, "Room");
        assert_eq!(info.class_name, "Room");

        let id = store.id_from_name(ns, "room-1");
        store.ensure_instance(ns, &id).unwrap();
        let instance = store.instance(&id).unwrap();
        assert_eq!(instance.namespace_id, ns);
    }

    #[test]
    fn reschedule_failed_alarm_doubles_backoff_each_retry() {
        let store = DurableObjectStore::new(MetaDb::open_in_memory().unwrap());
        let ns = NamespaceId::new();
        let id = store.id_from_name(ns, "room");
        store.ensure_instance(ns, &id).unwrap();
        store.set_alarm(&id, now_epoch_millis()).unwrap();

        store.reschedule_failed_alarm(&id, 0, 1000, 5).unwrap();
        let first = store.due_alarms(now_epoch_millis() + 10_000).unwrap()[0].scheduled_time;

        store.reschedule_failed_alarm(&id, 1, 1000, 5).unwrap();
        let second = store.due_alarms(now_epoch_millis() + 10_000).unwrap()[0].scheduled_time;

        // First retry backs off by 1000 * 2^0, second by 1000 * 2^1 — the
        // second gap should be roughly twice the first, not identical to it.
        let first_gap = first - now_epoch_millis();
        let second_gap = second - first;
        assert!(second_gap > first_gap, "backoff should grow between retries: {first_gap} then {second_gap}");
    }

    #[test]
    fn deleting_alarm_before_its_time_leaves_no_row() {
        let store = DurableObjectStore::new(MetaDb::open_in_memory().unwrap());
        let ns = NamespaceId::new();
        let id = store.id_from_name(ns, "room");
        store.ensure_instance(ns, &id).unwrap();
        store.set_alarm(&id, now_epoch_millis() + 60_000).unwrap();
        store.delete_alarm(&id).unwrap();
        assert!(store.due_alarms(now_epoch_millis() + 120_000).unwrap().is_empty());
    }
}
