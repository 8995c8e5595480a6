//! Per-database SQLite files behind the D1-style relational binding.
//!
//! Each `{id}` gets its own file at `<data_dir>/d1/<id>.db`, opened lazily
//! on first use and cached behind an outer `RwLock` (read to look up an
//! existing handle, write only to insert a newly-opened one) wrapping a
//! `HashMap<DbId, Mutex<Connection>>` — one mutex per database, not a single
//! global one, since these are logically independent databases that should
//! allow concurrent access to different ids.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use localflare_common::{DbId, LocalflareError, Result, WireValue};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;

pub struct RelationalStore {
    data_dir: PathBuf,
    connections: RwLock<HashMap<DbId, Arc<Mutex<Connection>>>>,
}

/// One row of a query result, column name → value.
pub type Row = Vec<(String, WireValue)>;

#[derive(Debug, Clone)]
pub struct QueryMeta {
    pub rows_read: u64,
    pub rows_written: u64,
    pub duration_ms: f64,
    pub changes: u64,
    pub last_row_id: i64,
    pub changed_db: bool,
    pub served_by: String,
}

impl Default for QueryMeta {
    fn default() -> Self {
        Self {
            rows_read: 0,
            rows_written: 0,
            duration_ms: 0.0,
            changes: 0,
            last_row_id: 0,
            changed_db: false,
            served_by: "localflare-d1".to_string(),
        }
    }
}

pub struct AllResult {
    pub results: Vec<Row>,
    pub meta: QueryMeta,
}

pub struct RunResult {
    pub meta: QueryMeta,
}

impl RelationalStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_database(&self, id: DbId) -> Result<()> {
        self.handle(id)?;
        Ok(())
    }

    fn handle(&self, id: DbId) -> Result<Arc<Mutex<Connection>>> {
        if let Some(conn) = self.connections.read().unwrap().get(&id) {
            return Ok(conn.clone());
        }
        let mut connections = self.connections.write().unwrap();
        if let Some(conn) = connections.get(&id) {
            return Ok(conn.clone());
        }
        let dir = self.data_dir.join("d1");
        std::fs::create_dir_all(&dir)
            .map_err(|e| LocalflareError::Internal(format!("failed to create d1 dir: {e}")))?;
        let conn = Connection::open(dir.join(format!("{id}.db")))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let handle = Arc::new(Mutex::new(conn));
        connections.insert(id, handle.clone());
        Ok(handle)
    }

    /// Runs `sql` with `params` bound positionally, returning every row.
    pub fn all(&self, id: DbId, sql: &str, params: &[WireValue]) -> Result<AllResult> {
        let start = std::time::Instant::now();
        let conn_handle = self.handle(id)?;
        let conn = conn_handle.lock().unwrap();
        let mut stmt = prepare(&conn, sql)?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let bound = bind_params(params);
        let mut rows_cursor = stmt
            .query(rusqlite::params_from_iter(bound.iter()))
            .map_err(sql_runtime_error)?;

        let mut results = Vec::new();
        while let Some(row) = rows_cursor.next().map_err(sql_runtime_error)? {
            let mut record = Vec::with_capacity(column_names.len());
            for (i, name) in column_names.iter().enumerate() {
                record.push((name.clone(), value_ref_to_wire(row.get_ref(i)?)));
            }
            results.push(record);
        }
        let rows_read = results.len() as u64;

        Ok(AllResult {
            results,
            meta: QueryMeta {
                rows_read,
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                changed_db: false,
                ..Default::default()
            },
        })
    }

    /// Runs `sql` as a write, returning only metadata (no rows).
    pub fn run(&self, id: DbId, sql: &str, params: &[WireValue]) -> Result<RunResult> {
        let start = std::time::Instant::now();
        let conn_handle = self.handle(id)?;
        let conn = conn_handle.lock().unwrap();
        let bound = bind_params(params);
        let changes = conn
            .execute(sql, rusqlite::params_from_iter(bound.iter()))
            .map_err(sql_runtime_error)? as u64;
        Ok(RunResult {
            meta: QueryMeta {
                rows_written: changes,
                changes,
                last_row_id: conn.last_insert_rowid(),
                duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                changed_db: changes > 0,
                ..Default::default()
            },
        })
    }

    /// Executes every statement in `stmts` inside one transaction; any
    /// failure rolls the whole batch back.
    pub fn batch(&self, id: DbId, stmts: &[(String, Vec<WireValue>)]) -> Result<Vec<RunResult>> {
        let conn_handle = self.handle(id)?;
        let mut conn = conn_handle.lock().unwrap();
        let tx = conn.transaction().map_err(sql_runtime_error)?;
        let mut results = Vec::with_capacity(stmts.len());
        for (sql, params) in stmts {
            let start = std::time::Instant::now();
            let bound = bind_params(params);
            let changes = tx
                .execute(sql, rusqlite::params_from_iter(bound.iter()))
                .map_err(sql_runtime_error)? as u64;
            results.push(RunResult {
                meta: QueryMeta {
                    rows_written: changes,
                    changes,
                    last_row_id: tx.last_insert_rowid(),
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    changed_db: changes > 0,
                    ..Default::default()
                },
            });
        }
        tx.commit().map_err(sql_runtime_error)?;
        Ok(results)
    }

    /// Runs a multi-statement, semicolon-separated SQL blob, returning the
    /// number of statements executed.
    pub fn exec(&self, id: DbId, sql: &str) -> Result<u64> {
        let conn_handle = self.handle(id)?;
        let conn = conn_handle.lock().unwrap();
        conn.execute_batch(sql).map_err(sql_runtime_error)?;
        let count = sql
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .count() as u64;
        Ok(count)
    }

    /// Reads the whole SQLite file backing `id`, whole-file as the D1
    /// `.dump()` artifact.
    pub fn dump(&self, id: DbId) -> Result<Vec<u8>> {
        // Make sure the database has been created/opened before reading its
        // file (also guarantees WAL contents get checkpointed on close, but
        // here we checkpoint explicitly to get a self-consistent file).
        let conn_handle = self.handle(id)?;
        {
            let conn = conn_handle.lock().unwrap();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        let path = self.data_dir.join("d1").join(format!("{id}.db"));
        std::fs::read(&path).map_err(|e| LocalflareError::Internal(format!("failed to read database file: {e}")))
    }
}

fn prepare<'c>(conn: &'c Connection, sql: &str) -> Result<rusqlite::Statement<'c>> {
    conn.prepare(sql)
        .map_err(|e| LocalflareError::SqlSyntax(e.to_string()))
}

fn sql_runtime_error(e: rusqlite::Error) -> LocalflareError {
    use rusqlite::Error as E;
    match &e {
        E::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            LocalflareError::ConstraintViolation(e.to_string())
        }
        _ => LocalflareError::SqlRuntime(e.to_string()),
    }
}

fn bind_params(params: &[WireValue]) -> Vec<SqlValue> {
    params
        .iter()
        .map(|p| match p {
            WireValue::Null => SqlValue::Null,
            WireValue::Bool(b) => SqlValue::Integer(*b as i64),
            WireValue::Integer(i) => SqlValue::Integer(*i),
            WireValue::Real(r) => SqlValue::Real(*r),
            WireValue::Text(s) => SqlValue::Text(s.clone()),
            WireValue::Bytes(b) => SqlValue::Blob(b.clone()),
        })
        .collect()
}

fn value_ref_to_wire(v: ValueRef<'_>) -> WireValue {
    match v {
        ValueRef::Null => WireValue::Null,
        ValueRef::Integer(i) => WireValue::Integer(i),
        ValueRef::Real(r) => WireValue::Real(r),
        ValueRef::Text(t) => WireValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => WireValue::Bytes(b.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn select_after_insert_returns_filtered_row() {
        let dir = tempdir().unwrap();
        let store = RelationalStore::new(dir.path());
        let id = DbId::new();
        store
            .exec(
                id,
                "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, email TEXT UNIQUE, age INTEGER)",
            )
            .unwrap();
        store
            .run(
                id,
                "INSERT INTO users (name, email, age) VALUES (?1, ?2, ?3)",
                &[
                    WireValue::Text("Alice".into()),
                    WireValue::Text("alice@example.com".into()),
                    WireValue::Integer(30),
                ],
            )
            .unwrap();
        store
            .run(
                id,
                "INSERT INTO users (name, email, age) VALUES (?1, ?2, ?3)",
                &[
                    WireValue::Text("Bob".into()),
                    WireValue::Text("bob@example.com".into()),
                    WireValue::Integer(25),
                ],
            )
            .unwrap();

        let result = store
            .all(id, "SELECT * FROM users WHERE age > ?1", &[WireValue::Integer(26)])
            .unwrap();
        assert_eq!(result.results.len(), 1);
        let name = result.results[0]
            .iter()
            .find(|(col, _)| col == "name")
            .map(|(_, v)| v.clone());
        assert_eq!(name, Some(WireValue::Text("Alice".into())));
    }

    #[test]
    fn select_reports_changed_db_false() {
        let dir = tempdir().unwrap();
        let store = RelationalStore::new(dir.path());
        let id = DbId::new();
        store.exec(id, "CREATE TABLE t (x INTEGER)").unwrap();
        let result = store.all(id, "SELECT * FROM t", &[]).unwrap();
        assert!(!result.meta.changed_db);
    }

    #[test]
    fn batch_rolls_back_entirely_on_failure() {
        let dir = tempdir().unwrap();
        let store = RelationalStore::new(dir.path());
        let id = DbId::new();
        store
            .exec(id, "CREATE TABLE t (x INTEGER UNIQUE)")
            .unwrap();
        let outcome = store.batch(
            id,
            &[
                ("INSERT INTO t (x) VALUES (1)".to_string(), vec![]),
                ("INSERT INTO t (x) VALUES (1)".to_string(), vec![]),
            ],
        );
        assert!(outcome.is_err());
        let result = store.all(id, "SELECT * FROM t", &[]).unwrap();
        assert!(result.results.is_empty());
    }
}
