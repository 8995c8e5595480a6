//! AI Gateway storage: response cache with TTL expiry, a request log, and
//! a sliding fixed-window rate limit counter, all keyed by gateway id.

use localflare_common::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::{now_epoch_seconds, MetaDb};

pub struct GatewayStore {
    db: MetaDb,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub gateway_id: String,
    pub duration_ms: i64,
    pub status: i64,
    pub request: Option<Vec<u8>>,
    pub response: Option<Vec<u8>>,
}

impl GatewayStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn cache_get(&self, gateway_id: &str, cache_key: &str) -> Result<Option<Vec<u8>>> {
        let now = now_epoch_seconds();
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT response FROM gateway_cache
                 WHERE gateway_id = ?1 AND cache_key = ?2 AND expires_at > ?3",
                params![gateway_id, cache_key, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn cache_put(&self, gateway_id: &str, cache_key: &str, response: Vec<u8>, ttl_secs: i64) -> Result<()> {
        let expires_at = now_epoch_seconds() + ttl_secs;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO gateway_cache (gateway_id, cache_key, response, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (gateway_id, cache_key) DO UPDATE SET
                     response = excluded.response,
                     expires_at = excluded.expires_at",
                params![gateway_id, cache_key, response, expires_at],
            )?;
            Ok(())
        })
    }

    pub fn log(&self, entry: &LogEntry) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = now_epoch_seconds();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO gateway_log (id, gateway_id, duration_ms, status, request, response, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    entry.gateway_id,
                    entry.duration_ms,
                    entry.status,
                    entry.request,
                    entry.response,
                    now
                ],
            )?;
            Ok(())
        })
    }

    /// Fixed-window counter keyed by `period_start = now / window_secs *
    /// window_secs`; returns `true` once the pre-increment count was already
    /// at `limit`, meaning this call should be rejected rather than counted.
    pub fn check_and_increment_rate_limit(&self, gateway_id: &str, window_secs: i64, limit: u64) -> Result<bool> {
        let now = now_epoch_seconds();
        let period_start = (now / window_secs) * window_secs;
        self.db.with_conn(|conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT count FROM gateway_rate_limit WHERE gateway_id = ?1 AND period_start = ?2",
                    params![gateway_id, period_start],
                    |row| row.get(0),
                )
                .optional()?;
            if count.unwrap_or(0) as u64 >= limit {
                return Ok(true);
            }
            conn.execute(
                "INSERT INTO gateway_rate_limit (gateway_id, period_start, count, limit_value)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT (gateway_id, period_start) DO UPDATE SET count = count + 1",
                params![gateway_id, period_start, limit as i64],
            )?;
            Ok(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_miss_returns_none_and_put_then_get_round_trips() {
        let store = GatewayStore::new(MetaDb::open_in_memory().unwrap());
        assert!(store.cache_get("gw", "k").unwrap().is_none());
        store.cache_put("gw", "k", b"cached".to_vec(), 60).unwrap();
        assert_eq!(store.cache_get("gw", "k").unwrap(), Some(b"cached".to_vec()));
    }

    #[test]
    fn expired_cache_entry_is_invisible() {
        let store = GatewayStore::new(MetaDb::open_in_memory().unwrap());
        store.cache_put("gw", "k", b"cached".to_vec(), -1).unwrap();
        assert!(store.cache_get("gw", "k").unwrap().is_none());
    }

    #[test]
    fn rate_limit_rejects_once_the_window_is_exhausted() {
        let store = GatewayStore::new(MetaDb::open_in_memory().unwrap());
        assert!(!store.check_and_increment_rate_limit("gw", 60, 2).unwrap());
        assert!(!store.check_and_increment_rate_limit("gw", 60, 2).unwrap());
        assert!(store.check_and_increment_rate_limit("gw", 60, 2).unwrap());
    }
}
