//! Queue storage: messages gated by `visible_at`/`expires_at` absolute
//! instants, never sleeping timers — eligibility is recomputed on every
//! pull, as the concurrency model requires.

use localflare_common::{LocalflareError, QueueId, Result};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::{now_epoch_millis, MetaDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageContentType {
    Json,
    Text,
    Bytes,
    V8,
}

impl MessageContentType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::V8 => "v8",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "json" => Self::Json,
            "text" => Self::Text,
            "v8" => Self::V8,
            _ => Self::Bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub delivery_delay_secs: i64,
    pub message_ttl_secs: i64,
    pub max_retries: u32,
    pub max_batch_size: u32,
    pub max_batch_timeout_ms: i64,
    pub dead_letter_queue: Option<QueueId>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub body: Vec<u8>,
    pub content_type: MessageContentType,
    pub attempts: u32,
    pub created: i64,
    pub visible_at: i64,
    pub expires_at: i64,
}

pub struct QueueStore {
    db: MetaDb,
}

impl QueueStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn create_queue(&self, name: &str, settings: &QueueSettings) -> Result<QueueId> {
        let id = QueueId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queues (id, name, delivery_delay, message_ttl, max_retries,
                                     max_batch_size, max_batch_timeout, dead_letter_queue)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    name,
                    settings.delivery_delay_secs,
                    settings.message_ttl_secs,
                    settings.max_retries,
                    settings.max_batch_size,
                    settings.max_batch_timeout_ms,
                    settings.dead_letter_queue.map(|q| q.to_string()),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    pub fn settings(&self, queue: QueueId) -> Result<QueueSettings> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT delivery_delay, message_ttl, max_retries, max_batch_size,
                        max_batch_timeout, dead_letter_queue
                 FROM queues WHERE id = ?1",
                params![queue.to_string()],
                |row| {
                    Ok(QueueSettings {
                        delivery_delay_secs: row.get(0)?,
                        message_ttl_secs: row.get(1)?,
                        max_retries: row.get(2)?,
                        max_batch_size: row.get(3)?,
                        max_batch_timeout_ms: row.get(4)?,
                        dead_letter_queue: row
                            .get::<_, Option<String>>(5)?
                            .and_then(|s| s.parse().ok()),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| LocalflareError::NotFound(format!("queue {queue}")))
        })
    }

    /// Producer-side send: schedules `visible_at = now + delay`,
    /// `expires_at = now + message_ttl`.
    pub fn send(
        &self,
        queue: QueueId,
        body: Vec<u8>,
        content_type: MessageContentType,
        delay_secs: Option<i64>,
    ) -> Result<String> {
        let settings = self.settings(queue)?;
        let now = now_epoch_millis();
        let delay_ms = delay_secs.unwrap_or(settings.delivery_delay_secs) * 1000;
        let id = Uuid::new_v4().to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_messages (id, queue_id, body, content_type, attempts,
                                             created, visible_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
                params![
                    id,
                    queue.to_string(),
                    body,
                    content_type.as_str(),
                    now,
                    now + delay_ms,
                    now + settings.message_ttl_secs * 1000,
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Pulls up to `batch_size` eligible messages (`visible_at <= now <
    /// expires_at`), FIFO by `created`, atomically bumping `visible_at` to
    /// `now + visibility_timeout` and incrementing `attempts`.
    pub fn pull(&self, queue: QueueId, batch_size: u32, visibility_timeout_secs: i64) -> Result<Vec<Message>> {
        let now = now_epoch_millis();
        let new_visible_at = now + visibility_timeout_secs * 1000;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM queue_messages
                 WHERE queue_id = ?1 AND visible_at <= ?2 AND expires_at > ?2
                 ORDER BY created ASC
                 LIMIT ?3",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![queue.to_string(), now, batch_size], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;

            let mut messages = Vec::with_capacity(ids.len());
            for id in ids {
                conn.execute(
                    "UPDATE queue_messages SET visible_at = ?1, attempts = attempts + 1 WHERE id = ?2",
                    params![new_visible_at, id],
                )?;
                let message = conn.query_row(
                    "SELECT id, body, content_type, attempts, created, visible_at, expires_at
                     FROM queue_messages WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Message {
                            id: row.get(0)?,
                            body: row.get(1)?,
                            content_type: MessageContentType::from_str(&row.get::<_, String>(2)?),
                            attempts: row.get(3)?,
                            created: row.get(4)?,
                            visible_at: row.get(5)?,
                            expires_at: row.get(6)?,
                        })
                    },
                )?;
                messages.push(message);
            }
            Ok(messages)
        })
    }

    pub fn ack(&self, message_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM queue_messages WHERE id = ?1", params![message_id])?;
            Ok(())
        })
    }

    pub fn retry(&self, message_id: &str, delay_secs: i64) -> Result<()> {
        let visible_at = now_epoch_millis() + delay_secs * 1000;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_messages SET visible_at = ?1 WHERE id = ?2",
                params![visible_at, message_id],
            )?;
            Ok(())
        })
    }

    /// A message whose post-increment `attempts` has reached `max_retries`
    /// is moved to the dead-letter queue (or dropped, absent one) instead of
    /// becoming deliverable again.
    pub fn dead_letter_if_exhausted(&self, queue: QueueId, message_id: &str) -> Result<bool> {
        let settings = self.settings(queue)?;
        let exhausted = self.db.with_conn(|conn| {
            let attempts: Option<u32> = conn
                .query_row(
                    "SELECT attempts FROM queue_messages WHERE id = ?1",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(attempts.map(|a| a >= settings.max_retries).unwrap_or(false))
        })?;
        if !exhausted {
            return Ok(false);
        }

        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT body, content_type FROM queue_messages WHERE id = ?1",
                params![message_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(LocalflareError::from)
        })?;

        if let (Some((body, content_type)), Some(dlq)) = (row, settings.dead_letter_queue) {
            self.send(dlq, body, MessageContentType::from_str(&content_type), Some(0))?;
        }
        self.ack(message_id)?;
        Ok(true)
    }

    pub fn queue_depth(&self, queue: QueueId) -> Result<u64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE queue_id = ?1",
                params![queue.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(Into::into)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MetaDb;

    fn default_settings() -> QueueSettings {
        QueueSettings {
            delivery_delay_secs: 0,
            message_ttl_secs: 3600,
            max_retries: 3,
            max_batch_size: 10,
            max_batch_timeout_ms: 1000,
            dead_letter_queue: None,
        }
    }

    #[test]
    fn pull_respects_batch_size_and_fifo_order() {
        let store = QueueStore::new(MetaDb::open_in_memory().unwrap());
        let queue = store.create_queue("q", &default_settings()).unwrap();
        for i in 0..3 {
            store
                .send(queue, format!("msg-{i}").into_bytes(), MessageContentType::Text, None)
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let batch = store.pull(queue, 2, 30).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, b"msg-0");
        assert_eq!(batch[1].body, b"msg-1");
    }

    #[test]
    fn pulled_message_is_hidden_until_visibility_timeout_elapses() {
        let store = QueueStore::new(MetaDb::open_in_memory().unwrap());
        let queue = store.create_queue("q", &default_settings()).unwrap();
        store.send(queue, b"only".to_vec(), MessageContentType::Text, None).unwrap();
        let first = store.pull(queue, 10, 30).unwrap();
        assert_eq!(first.len(), 1);
        let second = store.pull(queue, 10, 30).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn ack_prevents_message_from_reappearing() {
        let store = QueueStore::new(MetaDb::open_in_memory().unwrap());
        let queue = store.create_queue("q", &default_settings()).unwrap();
        store.send(queue, b"only".to_vec(), MessageContentType::Text, None).unwrap();
        let batch = store.pull(queue, 10, 0).unwrap();
        store.ack(&batch[0].id).unwrap();
        let after = store.pull(queue, 10, 0).unwrap();
        assert!(after.is_empty());
    }
}
